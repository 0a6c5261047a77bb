//! Reliable, ordered, chunk-based message transport over UDP
//!
//! rudp layers ordering, retransmission, negative acknowledgment, bandwidth
//! pacing and fragmentation/reassembly on top of a single UDP socket that may
//! be shared among many peer connections. It contains no async runtime and
//! spawns no threads: a [`UdpListener`] and every [`UdpConnection`] are
//! driven cooperatively by calling `update()` from one thread, and nothing
//! inside ever blocks.
//!
//! Message boundaries come from a [`ProtocolRegistry`] the application seeds
//! with one length rule per message id; the transport itself never interprets
//! message content. The most important types are `UdpListener`, which owns
//! the socket and dispatches incoming datagrams to the related connection,
//! and `UdpConnection`, which contains the bulk of the reliability logic for
//! a single peer.

#![warn(rust_2018_idioms)]

mod bandwidth;

mod config;
pub use crate::config::{LossFactor, TransportConfig};

mod connection;
pub use crate::connection::{
    local::LocalConnection, loopback::LoopbackConnection, stats::ConnectionStats,
    udp::UdpConnection, Connection,
};

mod error;
pub use crate::error::{Error, Result};

mod listener;
pub use crate::listener::UdpListener;

pub(crate) mod packet;

mod protocol;
pub use crate::protocol::{ProtocolRegistry, LENGTH_IN_BYTE, LENGTH_IN_WORD};

pub(crate) mod util;
