use super::*;

use crate::connection::Connection;

/// Registry with a single fixed 10-byte message type.
fn test_registry() -> Arc<ProtocolRegistry> {
    let mut registry = ProtocolRegistry::new();
    registry.add_type(1, 10);
    Arc::new(registry)
}

fn msg10(tag: u8) -> Bytes {
    let mut raw = vec![1u8, tag];
    raw.extend_from_slice(&[2, 3, 4, 5, 6, 7, 8, 9]);
    Bytes::from(raw)
}

fn test_listener() -> (UdpListener, SocketAddr) {
    let listener = UdpListener::new(
        0,
        "127.0.0.1",
        Arc::new(TransportConfig::default()),
        test_registry(),
    )
    .expect("bind failed");
    let addr = listener.local_addr().expect("no local address");
    (listener, addr)
}

/// First-contact shaped packet: no ACK cursor, no NAK, chunk zero.
fn handshake_datagram(payload: &Bytes) -> Bytes {
    use crate::packet::Chunk;

    let mut pkt = Packet::new(-1, 0);
    pkt.chunks.push(Arc::new(Chunk {
        chunk_number: 0,
        data: payload.clone(),
    }));
    pkt.checksum = pkt.calc_checksum();
    pkt.marshal()
}

fn pump(listener: &mut UdpListener) -> Result<()> {
    // give loopback delivery a moment, then poll a few times
    for _ in 0..5 {
        std::thread::sleep(Duration::from_millis(5));
        listener.update()?;
    }
    Ok(())
}

#[test]
fn test_bind_collision_fails() {
    let (_listener, addr) = test_listener();
    let result = UdpListener::new(
        addr.port(),
        "127.0.0.1",
        Arc::new(TransportConfig::default()),
        test_registry(),
    );
    assert!(result.is_err());
}

#[test]
fn test_handshake_admission() -> Result<()> {
    let (mut listener, addr) = test_listener();
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

    sender.send_to(&handshake_datagram(&msg10(1)), addr).unwrap();
    pump(&mut listener)?;

    assert!(listener.has_incoming_connections());
    let preview = listener.preview_connection().expect("waiting queue empty");
    assert!(preview.upgrade().is_some());

    let conn = listener.accept_connection().expect("waiting queue empty");
    assert!(!listener.has_incoming_connections());
    {
        let mut conn = conn.lock().unwrap();
        assert_eq!(sender.local_addr().unwrap(), conn.get_endpoint());
        assert_eq!(Some(msg10(1)), conn.get_data(), "initial packet was fed");
    }

    // a second first-contact from the same endpoint routes to the existing
    // connection instead of creating another
    sender.send_to(&handshake_datagram(&msg10(1)), addr).unwrap();
    pump(&mut listener)?;

    assert!(!listener.has_incoming_connections());
    {
        let mut conn = conn.lock().unwrap();
        assert_eq!(2, conn.stats.packets_recv, "packet reached the connection");
        assert_eq!(None, conn.get_data(), "stray reconnect must not re-deliver");
    }
    Ok(())
}

#[test]
fn test_unknown_sender_tallied() -> Result<()> {
    let (mut listener, addr) = test_listener();
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

    let mut pkt = Packet::new(3, 0);
    pkt.checksum = pkt.calc_checksum();
    sender.send_to(&pkt.marshal(), addr).unwrap();
    pump(&mut listener)?;

    assert!(!listener.has_incoming_connections());
    let ip = sender.local_addr().unwrap().ip();
    assert_eq!(Some(&1), listener.dropped_ips.get(&ip));
    Ok(())
}

#[test]
fn test_admission_can_be_disabled() -> Result<()> {
    let (mut listener, addr) = test_listener();
    listener.set_accepting_connections(false);
    assert!(!listener.is_accepting_connections());

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(&handshake_datagram(&msg10(1)), addr).unwrap();
    pump(&mut listener)?;

    assert!(!listener.has_incoming_connections());
    let ip = sender.local_addr().unwrap().ip();
    assert_eq!(Some(&1), listener.dropped_ips.get(&ip));
    Ok(())
}

#[test]
fn test_reject_connection_drops_it() -> Result<()> {
    let (mut listener, addr) = test_listener();
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

    sender.send_to(&handshake_datagram(&msg10(1)), addr).unwrap();
    pump(&mut listener)?;
    assert!(listener.has_incoming_connections());

    listener.reject_connection();
    assert!(!listener.has_incoming_connections());

    // the rejected connection's table entry dies with its last reference
    pump(&mut listener)?;
    assert!(listener.active_conns.is_empty());
    Ok(())
}

#[test]
fn test_expired_connections_evicted() -> Result<()> {
    let (mut listener, _addr) = test_listener();

    let conn = listener.spawn_connection("127.0.0.1", 45678)?;
    assert_eq!(1, listener.active_conns.len());

    drop(conn);
    listener.update()?;
    assert!(listener.active_conns.is_empty());
    Ok(())
}

#[test]
fn test_update_connections_rekeys_endpoint() -> Result<()> {
    let (mut listener, _addr) = test_listener();

    let conn = listener.spawn_connection("127.0.0.1", 45678)?;
    let moved: SocketAddr = "127.0.0.1:45679".parse().unwrap();
    conn.lock().unwrap().net_address = moved;

    listener.update_connections();

    assert_eq!(1, listener.active_conns.len());
    assert!(listener.active_conns.contains_key(&moved));
    Ok(())
}

#[test]
fn test_end_to_end_round_trip() -> Result<()> {
    let (mut listener, addr) = test_listener();

    let mut client = UdpConnection::connect(
        0,
        addr.port(),
        "127.0.0.1",
        Arc::new(TransportConfig::default()),
        test_registry(),
    )?;
    client.unmute();
    client.send_data(msg10(1));

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut server_conn = None;

    while Instant::now() < deadline {
        client.update()?;
        listener.update()?;

        if server_conn.is_none() && listener.has_incoming_connections() {
            server_conn = listener.accept_connection();
        }
        if let Some(conn) = &server_conn {
            if conn.lock().unwrap().has_incoming_data() {
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    let server_conn = server_conn.expect("handshake never admitted");
    assert_eq!(Some(msg10(1)), server_conn.lock().unwrap().get_data());

    {
        let mut server = server_conn.lock().unwrap();
        server.unmute();
        server.send_data(msg10(2));
        server.flush(true);
    }

    while Instant::now() < deadline {
        client.update()?;
        listener.update()?;
        if client.has_incoming_data() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(Some(msg10(2)), client.get_data());
    assert!(
        client.unacked_chunks.is_empty(),
        "server's ACK cursor must clear the client's unacked queue"
    );
    Ok(())
}
