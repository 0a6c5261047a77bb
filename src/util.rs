use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use crate::error::{Error, Result};

pub(crate) fn any_address(ip_v6: bool) -> IpAddr {
    if ip_v6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}

/// Turn a literal IP or a host name into a socket address.
pub(crate) fn resolve_host(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    match (host, port).to_socket_addrs() {
        Ok(mut addrs) => addrs.next().ok_or_else(|| Error::ErrResolveFailed {
            addr: format!("{}:{}", host, port),
        }),
        Err(_) => Err(Error::ErrResolveFailed {
            addr: format!("{}:{}", host, port),
        }),
    }
}

/// Connection resets can happen if the remote host was not up yet; they are
/// not reason to give up on the socket.
pub(crate) fn is_transient_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_resolve_literal() -> Result<()> {
        assert_eq!(
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap(),
            resolve_host("127.0.0.1", 9000)?
        );
        assert_eq!(
            "[::1]:9000".parse::<SocketAddr>().unwrap(),
            resolve_host("::1", 9000)?
        );
        Ok(())
    }

    #[test]
    fn test_resolve_garbage_fails() {
        assert!(resolve_host("no host by this name.invalid", 1).is_err());
    }
}
