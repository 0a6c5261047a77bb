use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("raw is too small for a packet header")]
    ErrPacketHeaderTooSmall,
    #[error("message id {id} maps to an impossible length rule")]
    ErrInvalidMessageLength { id: u8 },
    #[error("only two local connections may exist per process")]
    ErrTooManyLocalConnections,
    #[error("failed to resolve address {addr}")]
    ErrResolveFailed { addr: String },
    #[error("failed to bind UDP socket to {addr}: {detail}")]
    ErrBindFailed { addr: String, detail: String },
    #[error("failed to make UDP socket non-blocking: {detail}")]
    ErrSocketSetupFailed { detail: String },
}
