use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::protocol::ProtocolRegistry;

const MAX_INSTANCES: usize = 2;

/// Slot 0 carries server->client traffic, slot 1 client->server.
static PKT_QUEUES: [Mutex<VecDeque<Bytes>>; MAX_INSTANCES] = [
    Mutex::new(VecDeque::new()),
    Mutex::new(VecDeque::new()),
];
static NUM_INSTANCES: AtomicUsize = AtomicUsize::new(0);

/// Direct connection between server and client buffers living in the same
/// process instance. At most two exist at a time; sending from one locks the
/// other's slot and enqueues the message untouched.
#[derive(Debug)]
pub struct LocalConnection {
    registry: Arc<ProtocolRegistry>,
    instance: usize,
    bytes_sent: u64,
    bytes_recv: u64,
}

impl LocalConnection {
    pub fn new(registry: Arc<ProtocolRegistry>) -> Result<Self> {
        let instance = NUM_INSTANCES.fetch_add(1, Ordering::SeqCst);
        if instance >= MAX_INSTANCES {
            NUM_INSTANCES.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::ErrTooManyLocalConnections);
        }

        // clear data that might have been left over
        PKT_QUEUES[instance].lock().unwrap().clear();

        Ok(LocalConnection {
            registry,
            instance,
            bytes_sent: 0,
            bytes_recv: 0,
        })
    }

    fn remote_instance(&self) -> usize {
        (self.instance + 1) % MAX_INSTANCES
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        NUM_INSTANCES.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Connection for LocalConnection {
    fn send_data(&mut self, data: Bytes) {
        debug_assert!(self.registry.is_valid_packet(&data));

        self.bytes_sent += data.len() as u64;

        // sending from A to B locks B's queue
        PKT_QUEUES[self.remote_instance()]
            .lock()
            .unwrap()
            .push_back(data);
    }

    fn get_data(&mut self) -> Option<Bytes> {
        let msg = PKT_QUEUES[self.instance].lock().unwrap().pop_front()?;
        self.bytes_recv += msg.len() as u64;
        Some(msg)
    }

    fn peek(&self, index: usize) -> Option<Bytes> {
        PKT_QUEUES[self.instance].lock().unwrap().get(index).cloned()
    }

    fn delete_buffer_packet_at(&mut self, index: usize) {
        let mut queue = PKT_QUEUES[self.instance].lock().unwrap();
        if index < queue.len() {
            queue.remove(index);
        }
    }

    fn flush(&mut self, _forced: bool) {}

    fn reconnect_to(&mut self, _other: &dyn Connection) {}

    fn has_incoming_data(&self) -> bool {
        !PKT_QUEUES[self.instance].lock().unwrap().is_empty()
    }

    fn get_packet_queue_size(&self) -> usize {
        PKT_QUEUES[self.instance].lock().unwrap().len()
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

    fn close(&mut self, flush: bool) {
        if !flush {
            return;
        }
        PKT_QUEUES[self.instance].lock().unwrap().clear();
    }

    fn set_loss_factor(&mut self, _factor: i32) {}

    fn get_statistics(&self) -> String {
        format!(
            "\t{} bytes sent\n\t{} bytes recv'd",
            self.bytes_sent, self.bytes_recv
        )
    }

    fn get_full_address(&self) -> String {
        "Localhost".to_owned()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
