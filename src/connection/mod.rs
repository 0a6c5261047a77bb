
pub(crate) mod local;
pub(crate) mod loopback;
pub(crate) mod stats;
pub(crate) mod udp;

use std::any::Any;

use bytes::Bytes;

use crate::error::Result;

/// The uniform connection abstraction.
///
/// Implemented by [`udp::UdpConnection`] (the real transport),
/// [`local::LocalConnection`] (same-process peer) and
/// [`loopback::LoopbackConnection`] (echo queue). Application messages go in
/// and come out intact; everything in between is the implementation's
/// business.
pub trait Connection {
    /// Enqueue a raw application message for the peer.
    fn send_data(&mut self, data: Bytes);

    /// Pop the next ready application message.
    fn get_data(&mut self) -> Option<Bytes>;

    /// Inspect the i-th ready application message without consuming it.
    fn peek(&self, index: usize) -> Option<Bytes>;

    /// Drop the i-th ready application message without consuming it.
    fn delete_buffer_packet_at(&mut self, index: usize);

    /// Drive I/O and timers; called periodically by the owner.
    fn update(&mut self) -> Result<()> {
        Ok(())
    }

    /// Force a pacing/send pass.
    fn flush(&mut self, forced: bool);

    /// Adopt the peer endpoint and shared socket of `other`.
    fn reconnect_to(&mut self, other: &dyn Connection);

    fn has_incoming_data(&self) -> bool;

    fn get_packet_queue_size(&self) -> usize;

    /// `seconds == 0` selects the configured idle timeout (initial one before
    /// any traffic or when `initial` is set), positive values are used
    /// verbatim, negative values select the reconnect back-off scale.
    fn check_timeout(&self, seconds: i32, initial: bool) -> bool;

    fn can_reconnect(&self) -> bool;

    fn needs_reconnect(&mut self) -> bool;

    /// Connections are silent by default; unmuting allows them to send data.
    fn unmute(&mut self);

    fn close(&mut self, flush: bool);

    fn set_loss_factor(&mut self, factor: i32);

    fn get_statistics(&self) -> String;

    fn get_full_address(&self) -> String;

    fn as_any(&self) -> &(dyn Any + Send + Sync);
}
