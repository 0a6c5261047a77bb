#[cfg(test)]
mod listener_test;

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error, trace, warn};

use crate::config::TransportConfig;
use crate::connection::udp::UdpConnection;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::packet::{Packet, PACKET_HEADER_SIZE, PACKET_MAX_SIZE};
use crate::protocol::ProtocolRegistry;
use crate::util::{any_address, is_transient_error, resolve_host};

/// Receive drain budget per `update` call.
const MAX_POLL_TIME: Duration = Duration::from_millis(10);

/// Handles multiple connections on a shared UDP socket.
///
/// The listener owns the socket and routes every incoming datagram to the
/// connection registered for its source endpoint. Datagrams from unknown
/// senders are admitted only while accepting is enabled and only when they
/// have the shape of a first contact: no ACK cursor, no NAK, and a first
/// chunk numbered zero. Admitted connections sit on a waiting queue until the
/// application accepts or rejects them.
///
/// The active table holds weak references; a connection dropped by its
/// consumer is evicted on the next `update()`.
pub struct UdpListener {
    accept_new_connections: bool,

    socket: Arc<UdpSocket>,
    config: Arc<TransportConfig>,
    registry: Arc<ProtocolRegistry>,

    /// All known connections, keyed by remote endpoint. Standard `HashMap`:
    /// the keys are chosen by remote senders.
    active_conns: HashMap<SocketAddr, Weak<Mutex<UdpConnection>>>,
    dropped_ips: HashMap<IpAddr, u32>,

    waiting_conns: VecDeque<Arc<Mutex<UdpConnection>>>,
}

impl UdpListener {
    /// Open a local socket and make it ready for listening. An empty `ip`
    /// binds the IPv6 any-address, or the IPv4 one if v6 is unsupported.
    pub fn new(
        port: u16,
        ip: &str,
        config: Arc<TransportConfig>,
        registry: Arc<ProtocolRegistry>,
    ) -> Result<Self> {
        let socket = Self::try_bind_socket(port, ip)?;
        socket
            .set_nonblocking(true)
            .map_err(|err| Error::ErrSocketSetupFailed {
                detail: err.to_string(),
            })?;

        Ok(UdpListener {
            accept_new_connections: true,
            socket: Arc::new(socket),
            config,
            registry,
            active_conns: HashMap::new(),
            dropped_ips: HashMap::new(),
            waiting_conns: VecDeque::new(),
        })
    }

    fn try_bind_socket(port: u16, ip: &str) -> Result<UdpSocket> {
        let address = if ip.is_empty() {
            match UdpSocket::bind((Ipv6Addr::UNSPECIFIED, port)) {
                Ok(socket) => return Ok(socket),
                // no v6 support, fall back to the v4 any-address
                Err(_) => SocketAddr::new(any_address(false), port),
            }
        } else {
            resolve_host(ip, port)?
        };

        UdpSocket::bind(address).map_err(|err| {
            let err = Error::ErrBindFailed {
                addr: address.to_string(),
                detail: err.to_string(),
            };
            error!("{}", err);
            err
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    pub fn set_accepting_connections(&mut self, enable: bool) {
        self.accept_new_connections = enable;
    }

    pub fn is_accepting_connections(&self) -> bool {
        self.accept_new_connections
    }

    pub fn has_incoming_connections(&self) -> bool {
        !self.waiting_conns.is_empty()
    }

    /// Receive data from the socket and hand it to the associated
    /// connection, then drive every live connection's `update()`.
    pub fn update(&mut self) -> Result<()> {
        let cur_update_time = Instant::now();
        let mut recv_buffer = [0u8; PACKET_MAX_SIZE];

        loop {
            match self.socket.recv_from(&mut recv_buffer) {
                Ok((bytes_received, from)) => {
                    self.dispatch_datagram(&recv_buffer[..bytes_received], from)?
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if is_transient_error(&err) => {}
                Err(err) => {
                    warn!("receiving on listener socket failed: {}", err);
                    break;
                }
            }

            // make sure we do not get stuck here
            if cur_update_time.elapsed() > MAX_POLL_TIME {
                break;
            }
        }

        self.active_conns
            .retain(|_, conn| conn.strong_count() > 0);

        for conn in self.active_conns.values() {
            if let Some(conn) = conn.upgrade() {
                conn.lock().unwrap().update()?;
            }
        }

        Ok(())
    }

    fn dispatch_datagram(&mut self, data: &[u8], from: SocketAddr) -> Result<()> {
        let known = self.active_conns.get(&from).cloned();

        // known connection but expired; eviction happens in update()
        if matches!(&known, Some(conn) if conn.strong_count() == 0) {
            return Ok(());
        }

        if data.len() < PACKET_HEADER_SIZE {
            return Ok(());
        }

        let raw = Bytes::copy_from_slice(data);
        let pkt = match Packet::unmarshal(&raw) {
            Ok(pkt) => pkt,
            Err(err) => {
                trace!("malformed packet from {}: {}", from, err);
                return Ok(());
            }
        };

        if let Some(conn) = known.and_then(|conn| conn.upgrade()) {
            return conn.lock().unwrap().process_raw_packet(pkt);
        }

        // unknown sender; maybe a new client wants to connect from there
        if self.accept_new_connections && pkt.last_continuous == -1 && pkt.nak_type == 0 {
            if pkt.chunks.first().map_or(false, |chunk| chunk.chunk_number == 0) {
                let conn = Arc::new(Mutex::new(UdpConnection::new(
                    self.socket.clone(),
                    from,
                    self.config.clone(),
                    self.registry.clone(),
                )));

                conn.lock().unwrap().process_raw_packet(pkt)?;

                self.active_conns.insert(from, Arc::downgrade(&conn));
                self.waiting_conns.push_back(conn);
            }

            return Ok(());
        }

        *self.dropped_ips.entry(from.ip()).or_insert(0) += 1;
        Ok(())
    }

    /// Initiate a connection to `ip:port` on the shared socket.
    pub fn spawn_connection(&mut self, ip: &str, port: u16) -> Result<Arc<Mutex<UdpConnection>>> {
        let remote = resolve_host(ip, port)?;
        let conn = Arc::new(Mutex::new(UdpConnection::new(
            self.socket.clone(),
            remote,
            self.config.clone(),
            self.registry.clone(),
        )));

        self.active_conns.insert(remote, Arc::downgrade(&conn));
        Ok(conn)
    }

    pub fn preview_connection(&self) -> Option<Weak<Mutex<UdpConnection>>> {
        self.waiting_conns.front().map(Arc::downgrade)
    }

    pub fn accept_connection(&mut self) -> Option<Arc<Mutex<UdpConnection>>> {
        let conn = self.waiting_conns.pop_front()?;
        let endpoint = conn.lock().unwrap().get_endpoint();
        self.active_conns.insert(endpoint, Arc::downgrade(&conn));
        Some(conn)
    }

    pub fn reject_connection(&mut self) {
        self.waiting_conns.pop_front();
    }

    /// Re-key entries whose connection endpoint changed (i.e. reconnected).
    pub fn update_connections(&mut self) {
        let mut rekeyed = Vec::new();

        self.active_conns.retain(|address, weak| match weak.upgrade() {
            Some(conn) => {
                let endpoint = conn.lock().unwrap().get_endpoint();
                if endpoint != *address {
                    rekeyed.push((endpoint, Arc::downgrade(&conn)));
                    false
                } else {
                    true
                }
            }
            None => true,
        });

        for (endpoint, conn) in rekeyed {
            self.active_conns.insert(endpoint, conn);
        }
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        for (ip, count) in &self.dropped_ips {
            debug!("dropped {} packets from unknown IP {}", count, ip);
        }
    }
}
