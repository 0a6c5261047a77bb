use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use log::{trace, warn};

#[cfg(feature = "network-emulation")]
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::bandwidth::BandwidthTracker;
use crate::config::{LossFactor, TransportConfig};
use crate::connection::stats::ConnectionStats;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::packet::{Chunk, Packet, CHUNK_MAX_PAYLOAD, PACKET_HEADER_SIZE, PACKET_MAX_SIZE};
use crate::protocol::ProtocolRegistry;
use crate::util::{any_address, is_transient_error, resolve_host};

/// Base window for coalescing small sends, halved per loss-factor step.
const COALESCE_WINDOW_MS: u64 = 200;
/// Base window for unack resends and keepalive sends, halved per loss-factor
/// step.
const UNACK_WINDOW_MS: u64 = 400;
/// Receive drain budget per `update` call.
const MAX_POLL_TIME: Duration = Duration::from_millis(10);

/// A sparse NAK needs one byte per requested chunk, so at most this many fit
/// behind the signed descriptor.
const MAX_NAK_COUNT: usize = 127;
/// Gaps this far past the ACK cursor cannot be named by a one-byte offset.
const MAX_NAK_OFFSET: i32 = 255;

#[cfg(feature = "network-emulation")]
const EMU_LOSS_PROB: f32 = 0.5;
#[cfg(feature = "network-emulation")]
const EMU_BURST_PROB: f32 = 0.01;
#[cfg(feature = "network-emulation")]
const EMU_BURST_LEN: i32 = 10;
#[cfg(feature = "network-emulation")]
const EMU_CORRUPT_PROB: f32 = 0.0;
#[cfg(feature = "network-emulation")]
const EMU_MIN_LATENCY_MS: u64 = 750;
#[cfg(feature = "network-emulation")]
const EMU_MAX_LATENCY_MS: u64 = 1250;

/// Reliable, ordered connection to a single peer over a UDP socket.
///
/// The outbound byte stream is cut into numbered chunks of at most 254 bytes;
/// packets bundle new and re-sent chunks together with the ACK cursor and a
/// NAK descriptor for the peer. Everything is driven from `update()` on a
/// single thread; nothing here blocks.
pub struct UdpConnection {
    pub(crate) config: Arc<TransportConfig>,
    pub(crate) registry: Arc<ProtocolRegistry>,

    /// Outgoing application messages, not yet chunked.
    pub(crate) outgoing_data: VecDeque<Bytes>,
    /// Chunk payloads received out of order, keyed by chunk number.
    pub(crate) waiting_packets: BTreeMap<i32, Bytes>,
    /// Chunks created but never put on the wire.
    pub(crate) new_chunks: VecDeque<Arc<Chunk>>,
    /// Chunks sent at least once and not yet acknowledged.
    pub(crate) unacked_chunks: VecDeque<Arc<Chunk>>,
    /// Chunks the peer reported missing.
    pub(crate) resend_requested: BTreeMap<i32, Arc<Chunk>>,
    /// Completed application messages awaiting the consumer.
    pub(crate) msg_queue: VecDeque<Bytes>,
    /// Tail bytes of a partially received application message.
    pub(crate) fragment_buffer: Option<Bytes>,

    /// Scratch list of missing chunk numbers, rebuilt per send pass.
    dropped_packets: Vec<i32>,

    pub(crate) socket: Option<Arc<UdpSocket>>,
    pub(crate) net_address: SocketAddr,

    outgoing_bw: BandwidthTracker,
    pub(crate) stats: ConnectionStats,

    epoch: Instant,
    pub(crate) prv_chunk_created_time: Instant,
    pub(crate) prv_packet_send_time: Instant,
    pub(crate) prv_packet_recv_time: Instant,
    pub(crate) prv_unack_resend_time: Instant,
    pub(crate) prv_nak_time: Instant,

    pub(crate) reconnect_time_secs: i32,
    pub(crate) loss_factor: LossFactor,

    pub(crate) last_inorder: i32,
    last_mid_chunk: i32,
    pub(crate) packet_chunk_num: i32,

    pub(crate) muted: bool,
    pub(crate) closed: bool,
    resend_toggle: bool,
    pub(crate) shared_socket: bool,

    #[cfg(feature = "network-emulation")]
    rng: StdRng,
    #[cfg(feature = "network-emulation")]
    loss_counter: i32,
    #[cfg(feature = "network-emulation")]
    delayed_packets: Vec<(Instant, Bytes)>,
}

impl UdpConnection {
    /// Connection on a socket owned by somebody else (usually a listener).
    pub fn new(
        socket: Arc<UdpSocket>,
        net_address: SocketAddr,
        config: Arc<TransportConfig>,
        registry: Arc<ProtocolRegistry>,
    ) -> Self {
        Self::init(Some(socket), net_address, config, registry, true)
    }

    /// Client-side connection with its own socket; `update()` will drain it.
    pub fn connect(
        src_port: u16,
        dst_port: u16,
        host: &str,
        config: Arc<TransportConfig>,
        registry: Arc<ProtocolRegistry>,
    ) -> Result<Self> {
        let net_address = resolve_host(host, dst_port)?;
        let bind_address = SocketAddr::new(any_address(net_address.is_ipv6()), src_port);

        let socket = UdpSocket::bind(bind_address).map_err(|err| Error::ErrBindFailed {
            addr: bind_address.to_string(),
            detail: err.to_string(),
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|err| Error::ErrSocketSetupFailed {
                detail: err.to_string(),
            })?;

        Ok(Self::init(
            Some(Arc::new(socket)),
            net_address,
            config,
            registry,
            false,
        ))
    }

    /// Fresh connection taking over the transport of an existing one.
    pub fn from_connection(
        other: &UdpConnection,
        config: Arc<TransportConfig>,
        registry: Arc<ProtocolRegistry>,
    ) -> Self {
        Self::init(other.socket.clone(), other.net_address, config, registry, true)
    }

    fn init(
        socket: Option<Arc<UdpSocket>>,
        net_address: SocketAddr,
        config: Arc<TransportConfig>,
        registry: Arc<ProtocolRegistry>,
        shared_socket: bool,
    ) -> Self {
        let now = Instant::now();

        UdpConnection {
            reconnect_time_secs: config.reconnect_time_secs(),
            loss_factor: config.network_loss_factor(),
            config,
            registry,
            outgoing_data: VecDeque::new(),
            waiting_packets: BTreeMap::new(),
            new_chunks: VecDeque::new(),
            unacked_chunks: VecDeque::new(),
            resend_requested: BTreeMap::new(),
            msg_queue: VecDeque::new(),
            fragment_buffer: None,
            dropped_packets: Vec::new(),
            socket,
            net_address,
            outgoing_bw: BandwidthTracker::default(),
            stats: ConnectionStats::default(),
            epoch: now,
            prv_chunk_created_time: now,
            prv_packet_send_time: now,
            prv_packet_recv_time: now,
            prv_unack_resend_time: now,
            prv_nak_time: now,
            last_inorder: -1,
            last_mid_chunk: -1,
            packet_chunk_num: 0,
            muted: true,
            closed: false,
            resend_toggle: false,
            shared_socket,
            #[cfg(feature = "network-emulation")]
            rng: StdRng::from_entropy(),
            #[cfg(feature = "network-emulation")]
            loss_counter: 0,
            #[cfg(feature = "network-emulation")]
            delayed_packets: Vec::new(),
        }
    }

    pub fn get_endpoint(&self) -> SocketAddr {
        self.net_address
    }

    pub(crate) fn is_using_address(&self, from: SocketAddr) -> bool {
        self.net_address == from
    }

    fn use_min_loss_factor(&self) -> bool {
        self.loss_factor.is_min()
    }

    fn coalesce_window(&self) -> Duration {
        Duration::from_millis(COALESCE_WINDOW_MS >> self.loss_factor.shift())
    }

    fn unack_window(&self) -> Duration {
        Duration::from_millis(UNACK_WINDOW_MS >> self.loss_factor.shift())
    }

    /// Strip and apply one parsed packet: ACK/NAK bookkeeping, merge of the
    /// carried chunks, then in-order reassembly into application messages.
    pub(crate) fn process_raw_packet(&mut self, pkt: Packet) -> Result<()> {
        self.prv_packet_recv_time = Instant::now();
        self.stats.bytes_recv += pkt.wire_size() as u64;
        self.stats.recv_overhead += PACKET_HEADER_SIZE as u64;
        self.stats.packets_recv += 1;

        if self.emulate_packet_loss() {
            return Ok(());
        }

        if pkt.calc_checksum() != pkt.checksum {
            warn!(
                "discarding incoming corrupted packet: crc {}, len {}",
                pkt.checksum,
                pkt.wire_size()
            );
            return Ok(());
        }

        if pkt.last_continuous < 0
            && self.last_inorder >= 0
            && (self.unacked_chunks.is_empty() || self.unacked_chunks[0].chunk_number > 0)
        {
            warn!("discarding superfluous reconnection attempt from {}", self.net_address);
            return Ok(());
        }

        self.ack_chunks(pkt.last_continuous);

        if !self.unacked_chunks.is_empty() {
            let next_cont = pkt.last_continuous + 1;
            let unack_dif = self.unacked_chunks[0].chunk_number - next_cont;

            if (-256..=256).contains(&unack_dif) {
                if pkt.nak_type < 0 {
                    for i in 0..-(pkt.nak_type as i32) {
                        let unack_pos = i + unack_dif;

                        if unack_pos >= 0 && (unack_pos as usize) < self.unacked_chunks.len() {
                            let chunk = self.unacked_chunks[unack_pos as usize].clone();
                            debug_assert_eq!(chunk.chunk_number, next_cont + i);
                            self.request_resend(chunk);
                        }
                    }
                } else if pkt.nak_type > 0 {
                    let mut unack_pos: i32 = 0;

                    for &nak in &pkt.naks {
                        let nak_pos = unack_dif + nak as i32;
                        if nak_pos < 0 {
                            continue;
                        }

                        // everything below a named offset was implicitly
                        // received, so pending resends for it can go
                        while unack_pos < nak_pos {
                            if (unack_pos as usize) < self.unacked_chunks.len() {
                                let number = self.unacked_chunks[unack_pos as usize].chunk_number;
                                self.resend_requested.remove(&number);
                            }
                            unack_pos += 1;
                        }

                        if (unack_pos as usize) < self.unacked_chunks.len() {
                            let chunk = self.unacked_chunks[unack_pos as usize].clone();
                            debug_assert_eq!(chunk.chunk_number, next_cont + nak as i32);
                            self.request_resend(chunk);
                        }
                        unack_pos += 1;
                    }
                }
            }
        }

        for chunk in &pkt.chunks {
            if self.last_inorder >= chunk.chunk_number
                || self.waiting_packets.contains_key(&chunk.chunk_number)
            {
                self.stats.dropped_chunks += 1;
                continue;
            }

            self.waiting_packets.insert(chunk.chunk_number, chunk.data.clone());
        }

        // drain all in-order chunks that we have waiting
        while let Some(data) = self.waiting_packets.remove(&(self.last_inorder + 1)) {
            self.last_inorder += 1;

            let mut wait_buffer = BytesMut::with_capacity(data.len());
            if let Some(fragment) = self.fragment_buffer.take() {
                wait_buffer.extend_from_slice(&fragment);
            }
            wait_buffer.extend_from_slice(&data);
            let buffer = wait_buffer.freeze();

            let mut pos = 0;
            while pos < buffer.len() {
                let pkt_length = self.registry.packet_length(&buffer[pos..])?;

                if self.registry.is_valid_length(pkt_length, buffer.len() - pos) {
                    self.msg_queue.push_back(buffer.slice(pos..pos + pkt_length as usize));
                    pos += pkt_length as usize;
                } else if pkt_length >= 0 {
                    // partial message, wait for more chunks
                    self.fragment_buffer = Some(buffer.slice(pos..));
                    break;
                } else {
                    warn!(
                        "discarding incoming invalid message: id {}, len {}",
                        buffer[pos], pkt_length
                    );

                    // skip a single byte until we encounter a valid message
                    pos += 1;
                }
            }
        }

        Ok(())
    }

    fn ack_chunks(&mut self, last_ack: i32) {
        while self
            .unacked_chunks
            .front()
            .map_or(false, |chunk| chunk.chunk_number <= last_ack)
        {
            self.unacked_chunks.pop_front();
        }

        // resend requested and later acked, happens every now and then
        while self
            .resend_requested
            .first_key_value()
            .map_or(false, |(&number, _)| number <= last_ack)
        {
            self.resend_requested.pop_first();
        }
    }

    fn request_resend(&mut self, chunk: Arc<Chunk>) {
        self.resend_requested.entry(chunk.chunk_number).or_insert(chunk);
    }

    fn create_chunk(&mut self, data: Bytes) {
        debug_assert!(!data.is_empty() && data.len() <= CHUNK_MAX_PAYLOAD);

        let chunk_number = self.packet_chunk_num;
        self.packet_chunk_num += 1;

        self.new_chunks.push_back(Arc::new(Chunk { chunk_number, data }));
        self.prv_chunk_created_time = Instant::now();
    }

    /// Cut queued messages into chunks, then decide whether to put packets on
    /// the wire. Small messages are held back until enough bytes queue up or
    /// the coalescing window runs out.
    fn flush_impl(&mut self, forced: bool) {
        if self.muted {
            return;
        }

        let now = Instant::now();
        let since_chunk = now - self.prv_chunk_created_time;
        let chunk_interval =
            Duration::from_nanos(1_000_000_000 / self.config.udp_chunks_per_sec() as u64);

        // do not create chunks faster than the configured rate
        let wait_more = since_chunk <= chunk_interval;

        // subtracting the elapsed time shrinks the threshold, so tiny sends
        // still go out once the window lapses
        let required_length =
            (self.coalesce_window().as_millis() as i64 - since_chunk.as_millis() as i64) / 10;

        let mut outgoing_length: i64 = 0;
        if !wait_more {
            for msg in &self.outgoing_data {
                outgoing_length += msg.len() as i64;
                if outgoing_length > required_length {
                    break;
                }
            }
        }

        if forced || (!wait_more && outgoing_length > required_length) {
            let mut buffer = BytesMut::with_capacity(CHUNK_MAX_PAYLOAD);
            let mut partial_message = false;

            loop {
                let budget = self.config.link_outgoing_bandwidth();
                let mut send_more_data = self.outgoing_bw.get_average(true) <= budget as f32;
                send_more_data |= budget <= 0 || partial_message || forced;

                if send_more_data {
                    let drop_front = match self.outgoing_data.front() {
                        Some(raw) => !partial_message && !self.registry.is_valid_packet(raw),
                        None => false,
                    };

                    if drop_front {
                        // discard invalid outgoing raw message
                        self.outgoing_data.pop_front();
                    } else if let Some(raw) = self.outgoing_data.front_mut() {
                        let num_chunk_bytes = (CHUNK_MAX_PAYLOAD - buffer.len()).min(raw.len());

                        buffer.extend_from_slice(&raw[..num_chunk_bytes]);
                        self.stats.sent_overhead += PACKET_HEADER_SIZE as u64;
                        self.outgoing_bw.data_sent(num_chunk_bytes as u32, true);

                        partial_message = num_chunk_bytes != raw.len();
                        if partial_message {
                            let rest = raw.slice(num_chunk_bytes..);
                            *raw = rest;
                        } else {
                            self.outgoing_data.pop_front();
                        }
                    }
                }

                if !buffer.is_empty()
                    && (self.outgoing_data.is_empty()
                        || buffer.len() == CHUNK_MAX_PAYLOAD
                        || !send_more_data)
                {
                    let data = buffer.split().freeze();
                    self.create_chunk(data);
                }

                if self.outgoing_data.is_empty() || !send_more_data {
                    break;
                }
            }
        }

        self.send_if_necessary(forced);
    }

    fn send_if_necessary(&mut self, flushed: bool) {
        let now = Instant::now();
        let unack_window = self.unack_window();

        let diff_send_time = now - self.prv_packet_send_time;
        let chunk_delta_time = now - self.prv_chunk_created_time;
        let unack_delta_time = now - self.prv_unack_resend_time;

        let mut nak_count: i8;

        self.dropped_packets.clear();
        {
            let mut packet_num = self.last_inorder + 1;

            for &key in self.waiting_packets.keys() {
                for _ in 0..(key - packet_num) {
                    self.dropped_packets.push(packet_num);
                    packet_num += 1;
                }
                packet_num = key + 1;
            }

            while self
                .dropped_packets
                .last()
                .map_or(false, |&num| num - (self.last_inorder + 1) > MAX_NAK_OFFSET)
            {
                self.dropped_packets.pop();
            }

            let mut num_continuous: usize = 0;
            for (i, &num) in self.dropped_packets.iter().enumerate() {
                if num != self.last_inorder + i as i32 + 1 {
                    break;
                }
                num_continuous += 1;
            }

            if num_continuous < 8 && now - self.prv_nak_time > unack_window / 2 {
                nak_count = self.dropped_packets.len().min(MAX_NAK_COUNT) as i8;
                // a sparse NAK needs one byte per chunk, do not spam it
                self.prv_nak_time = now;
            } else {
                nak_count = -(num_continuous.min(MAX_NAK_COUNT) as i8);
            }
        }

        if !self.unacked_chunks.is_empty()
            && chunk_delta_time > unack_window
            && unack_delta_time > unack_window
        {
            // resend the last chunk if no ack arrived within reasonable time
            // and no new chunk is about to go out either
            if self.new_chunks.is_empty() {
                if let Some(chunk) = self.unacked_chunks.back().cloned() {
                    self.request_resend(chunk);
                }
            }
            self.prv_unack_resend_time = now;
        }

        let flush_send = flushed || !self.new_chunks.is_empty();
        let other_send = self.use_min_loss_factor() && !self.resend_requested.is_empty();
        let unack_send = nak_count > 0 || diff_send_time > unack_window / 2;

        if !flush_send && !other_send && !unack_send {
            return;
        }

        let use_min = self.use_min_loss_factor();
        let mtu = self.config.max_transmission_unit() as usize;

        let mut max_resend_size = self.resend_requested.len();
        let unack_prev_size = self.unacked_chunks.len();

        // cursors into a snapshot of the resend keys; only the Min policy
        // consumes entries while sending, so the snapshot stays valid
        let resend_keys: Vec<i32> = self.resend_requested.keys().copied().collect();
        let mut fwd_pos = 0usize;
        let mut rev_pos = resend_keys.len();
        let mut mid_pos = 0usize;
        let mut beg_pos = 0usize;
        let mut end_pos = resend_keys.len();
        let mut phase = 0u32;

        if !use_min {
            // limit resend work to a reasonable number of chunks per call
            max_resend_size = max_resend_size.min(20 * self.loss_factor.factor());

            beg_pos = ((max_resend_size + 3) / 4).min(resend_keys.len());
            if beg_pos < resend_keys.len() && self.last_mid_chunk < resend_keys[beg_pos] {
                self.last_mid_chunk = resend_keys[beg_pos] - 1;
            }

            end_pos = resend_keys.len() - ((max_resend_size + 2) / 4).min(resend_keys.len());

            while mid_pos < resend_keys.len() && resend_keys[mid_pos] <= self.last_mid_chunk {
                mid_pos += 1;
            }
            if mid_pos == resend_keys.len()
                || end_pos == resend_keys.len()
                || resend_keys[mid_pos] >= resend_keys[end_pos]
            {
                mid_pos = beg_pos;
            }
        }

        loop {
            let budget = self.config.link_outgoing_bandwidth();
            if budget > 0 && self.outgoing_bw.get_average(false) > budget as f32 {
                break;
            }

            let mut pkt = Packet::new(self.last_inorder, nak_count);

            if nak_count > 0 {
                for i in 0..nak_count as usize {
                    // zero requests a resend of last_inorder + 1
                    pkt.naks
                        .push((self.dropped_packets[i] - (self.last_inorder + 1)) as u8);
                }

                // one request is enough
                nak_count = 0;
            }

            let mut sent = false;

            loop {
                let buffer_size = pkt.wire_size();

                let resend_size: Option<usize> = if max_resend_size == 0 {
                    None
                } else if use_min {
                    self.resend_requested.values().next().map(|c| c.wire_size())
                } else {
                    let key_pos = match phase {
                        0 => Some(fwd_pos),
                        1 => rev_pos.checked_sub(1),
                        _ => Some(mid_pos),
                    };
                    key_pos
                        .and_then(|p| resend_keys.get(p))
                        .and_then(|k| self.resend_requested.get(k))
                        .map(|c| c.wire_size())
                };

                let can_resend =
                    matches!(resend_size, Some(size) if buffer_size + size <= mtu);
                let can_send_new = matches!(
                    self.new_chunks.front(),
                    Some(chunk) if buffer_size + chunk.wire_size() <= mtu
                );

                if !can_resend && !can_send_new {
                    break;
                }

                // alternate between send and resend so neither is starved
                self.resend_toggle = !self.resend_toggle;

                if self.resend_toggle && can_resend {
                    if use_min {
                        if let Some((_, chunk)) = self.resend_requested.pop_first() {
                            pkt.chunks.push(chunk);
                        }
                    } else {
                        // on a lossy connection chunks are re-sent until they
                        // are acked; rotating between the front, back and
                        // middle of the requested range speeds up recovery on
                        // high-latency paths
                        match phase {
                            0 => {
                                if let Some(chunk) = resend_keys
                                    .get(fwd_pos)
                                    .and_then(|k| self.resend_requested.get(k))
                                {
                                    pkt.chunks.push(chunk.clone());
                                }
                                fwd_pos += 1;
                            }
                            1 => {
                                if let Some(prev) = rev_pos.checked_sub(1) {
                                    if let Some(chunk) = resend_keys
                                        .get(prev)
                                        .and_then(|k| self.resend_requested.get(k))
                                    {
                                        pkt.chunks.push(chunk.clone());
                                    }
                                    rev_pos = prev;
                                }
                            }
                            _ => {
                                if let Some(&key) = resend_keys.get(mid_pos) {
                                    if let Some(chunk) = self.resend_requested.get(&key) {
                                        pkt.chunks.push(chunk.clone());
                                    }
                                    self.last_mid_chunk = key;
                                }
                                mid_pos += 1;
                                if mid_pos == end_pos {
                                    mid_pos = beg_pos;
                                }
                            }
                        }
                        phase = (phase + 1) % 4;
                    }

                    self.stats.resent_chunks += 1;
                    max_resend_size -= 1;
                    sent = true;
                    continue;
                }

                if !self.resend_toggle && can_send_new {
                    if let Some(chunk) = self.new_chunks.pop_front() {
                        pkt.chunks.push(chunk.clone());
                        self.unacked_chunks.push_back(chunk);
                    }
                    sent = true;
                    continue;
                }
            }

            pkt.checksum = pkt.calc_checksum();
            self.emulate_packet_corruption(&mut pkt.checksum);
            self.send_packet(&pkt);

            if !sent || (max_resend_size == 0 && self.new_chunks.is_empty()) {
                break;
            }
        }

        if !use_min {
            // on a lossy connection new chunks are queued for pre-emptive
            // retransmission right away
            for i in unack_prev_size..self.unacked_chunks.len() {
                let chunk = self.unacked_chunks[i].clone();
                self.request_resend(chunk);
            }
        }
    }

    fn send_packet(&mut self, pkt: &Packet) {
        let data = pkt.marshal();
        self.outgoing_bw.data_sent(data.len() as u32, false);

        let deferred = self.emulate_latency(&data);
        if !deferred {
            if let Some(socket) = &self.socket {
                if let Err(err) = socket.send_to(&data, self.net_address) {
                    if !is_transient_error(&err) {
                        warn!("sending packet to {} failed: {}", self.net_address, err);
                        return;
                    }
                }
            }
        }

        self.prv_packet_send_time = Instant::now();
        self.stats.bytes_sent += data.len() as u64;
        self.stats.packets_sent += 1;
    }

    #[cfg(feature = "network-emulation")]
    fn emulate_packet_loss(&mut self) -> bool {
        if self.rng.gen::<f32>() < EMU_LOSS_PROB {
            return true;
        }

        if self.loss_counter == 0 && self.rng.gen::<f32>() < EMU_BURST_PROB {
            self.loss_counter = (EMU_BURST_LEN as f32 * self.rng.gen::<f32>()) as i32;
        }

        if self.loss_counter > 0 {
            self.loss_counter -= 1;
            self.loss_counter > 0
        } else {
            false
        }
    }

    #[cfg(feature = "network-emulation")]
    fn emulate_packet_corruption(&mut self, checksum: &mut u8) {
        if self.rng.gen::<f32>() < EMU_CORRUPT_PROB {
            *checksum = self.rng.gen::<u8>();
        }
    }

    #[cfg(feature = "network-emulation")]
    fn emulate_latency(&mut self, data: &Bytes) -> bool {
        let now = Instant::now();
        let spread = (EMU_MAX_LATENCY_MS - EMU_MIN_LATENCY_MS) as f32;
        let delay =
            Duration::from_millis(EMU_MIN_LATENCY_MS + (spread * self.rng.gen::<f32>()) as u64);

        let mut i = 0;
        while i < self.delayed_packets.len() {
            if self.delayed_packets[i].0 <= now {
                let (_, raw) = self.delayed_packets.remove(i);
                if let Some(socket) = &self.socket {
                    let _ = socket.send_to(&raw, self.net_address);
                }
            } else {
                i += 1;
            }
        }

        let defer = self.emulate_packet_loss();
        if defer {
            self.delayed_packets.push((now + delay, data.clone()));
        }
        defer
    }

    #[cfg(not(feature = "network-emulation"))]
    fn emulate_packet_loss(&mut self) -> bool {
        false
    }

    #[cfg(not(feature = "network-emulation"))]
    fn emulate_packet_corruption(&mut self, _checksum: &mut u8) {}

    #[cfg(not(feature = "network-emulation"))]
    fn emulate_latency(&mut self, _data: &Bytes) -> bool {
        false
    }
}

impl Connection for UdpConnection {
    fn send_data(&mut self, data: Bytes) {
        debug_assert!(!data.is_empty());
        self.outgoing_data.push_back(data);
    }

    fn get_data(&mut self) -> Option<Bytes> {
        self.msg_queue.pop_front()
    }

    fn peek(&self, index: usize) -> Option<Bytes> {
        self.msg_queue.get(index).cloned()
    }

    fn delete_buffer_packet_at(&mut self, index: usize) {
        if index < self.msg_queue.len() {
            self.msg_queue.remove(index);
        }
    }

    fn update(&mut self) -> Result<()> {
        let cur_update_time = Instant::now();

        self.outgoing_bw
            .update_time((cur_update_time - self.epoch).as_millis() as u64);

        if !self.shared_socket && !self.closed {
            if let Some(socket) = self.socket.clone() {
                let mut recv_buffer = [0u8; PACKET_MAX_SIZE];

                loop {
                    match socket.recv_from(&mut recv_buffer) {
                        Ok((bytes_received, from)) => {
                            if bytes_received >= PACKET_HEADER_SIZE {
                                let raw = Bytes::copy_from_slice(&recv_buffer[..bytes_received]);
                                match Packet::unmarshal(&raw) {
                                    Ok(pkt) if self.is_using_address(from) => {
                                        self.process_raw_packet(pkt)?
                                    }
                                    Ok(_) => {}
                                    Err(err) => trace!("malformed packet from {}: {}", from, err),
                                }
                            }
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(err) if is_transient_error(&err) => {}
                        Err(err) => {
                            warn!("receiving on {} failed: {}", self.net_address, err);
                            break;
                        }
                    }

                    // make sure we do not get stuck here
                    if cur_update_time.elapsed() > MAX_POLL_TIME {
                        break;
                    }
                }
            }
        }

        self.flush_impl(false);
        Ok(())
    }

    fn flush(&mut self, forced: bool) {
        self.flush_impl(forced);
    }

    fn reconnect_to(&mut self, other: &dyn Connection) {
        if let Some(other) = other.as_any().downcast_ref::<UdpConnection>() {
            self.net_address = other.net_address;
            self.socket = other.socket.clone();
            self.shared_socket = true;
        }
    }

    fn has_incoming_data(&self) -> bool {
        !self.msg_queue.is_empty()
    }

    fn get_packet_queue_size(&self) -> usize {
        self.msg_queue.len()
    }

    fn check_timeout(&self, seconds: i32, initial: bool) -> bool {
        let timeout_secs = match seconds.clamp(-1, 1) {
            0 => {
                if self.stats.bytes_recv > 0 && !initial {
                    self.config.network_timeout_secs()
                } else {
                    self.config.initial_network_timeout_secs()
                }
            }
            1 => seconds,
            _ => self.reconnect_time_secs,
        };

        timeout_secs > 0
            && self.prv_packet_recv_time.elapsed() > Duration::from_secs(timeout_secs as u64)
    }

    fn can_reconnect(&self) -> bool {
        self.reconnect_time_secs > 0
    }

    fn needs_reconnect(&mut self) -> bool {
        if !self.can_reconnect() {
            return false;
        }

        if !self.check_timeout(-1, false) {
            self.reconnect_time_secs = self.config.reconnect_time_secs();
            return false;
        }

        if self.check_timeout(self.reconnect_time_secs, false) {
            self.reconnect_time_secs += 1;
            return true;
        }

        false
    }

    fn unmute(&mut self) {
        self.muted = false;
    }

    fn close(&mut self, flush: bool) {
        if self.closed {
            return;
        }

        self.flush_impl(flush);
        self.muted = true;

        if !self.shared_socket {
            self.socket = None;
        }

        self.closed = true;
    }

    fn set_loss_factor(&mut self, factor: i32) {
        self.loss_factor = LossFactor::from_i32(factor);
    }

    fn get_statistics(&self) -> String {
        self.stats.to_string()
    }

    fn get_full_address(&self) -> String {
        format!("[{}]:{}", self.net_address.ip(), self.net_address.port())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

impl Drop for UdpConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.flush_impl(true);
        }
    }
}
