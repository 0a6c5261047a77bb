use std::any::Any;
use std::collections::VecDeque;

use bytes::Bytes;

use crate::connection::Connection;

/// Dummy queue-like connection, bounces everything back to the sender.
#[derive(Debug, Default)]
pub struct LoopbackConnection {
    pkt_queue: VecDeque<Bytes>,
}

impl LoopbackConnection {
    pub fn new() -> Self {
        LoopbackConnection::default()
    }
}

impl Connection for LoopbackConnection {
    fn send_data(&mut self, data: Bytes) {
        self.pkt_queue.push_back(data);
    }

    fn get_data(&mut self) -> Option<Bytes> {
        self.pkt_queue.pop_front()
    }

    fn peek(&self, index: usize) -> Option<Bytes> {
        self.pkt_queue.get(index).cloned()
    }

    fn delete_buffer_packet_at(&mut self, index: usize) {
        if index < self.pkt_queue.len() {
            self.pkt_queue.remove(index);
        }
    }

    fn flush(&mut self, _forced: bool) {}

    fn reconnect_to(&mut self, _other: &dyn Connection) {}

    fn has_incoming_data(&self) -> bool {
        !self.pkt_queue.is_empty()
    }

    fn get_packet_queue_size(&self) -> usize {
        self.pkt_queue.len()
    }

    fn check_timeout(&self, _seconds: i32, _initial: bool) -> bool {
        false
    }

    fn can_reconnect(&self) -> bool {
        false
    }

    fn needs_reconnect(&mut self) -> bool {
        false
    }

    fn unmute(&mut self) {}

    fn close(&mut self, _flush: bool) {}

    fn set_loss_factor(&mut self, _factor: i32) {}

    fn get_statistics(&self) -> String {
        "N/A".to_owned()
    }

    fn get_full_address(&self) -> String {
        "Loopback".to_owned()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
