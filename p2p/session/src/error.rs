//! Session layer error types.

use thiserror::Error;
use uuid::Uuid;

/// Negotiation, transfer and direct-connection errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Wire framing or parse violation
    #[error("wire protocol error: {0}")]
    Wire(#[from] p2p_wire::WireError),

    /// Session-description text could not be parsed
    #[error("signaling parse error: {0}")]
    Slp(#[from] p2p_wire::SlpError),

    /// Socket failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller used the API out of order
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// No negotiation state exists for this call id
    #[error("unknown call id: {0}")]
    UnknownCall(Uuid),

    /// A malformed context blob
    #[error("malformed context: {0}")]
    Context(String),

    /// Feature exists in the protocol but not in this implementation
    #[error("not supported: {0}")]
    Unsupported(&'static str),

    /// The listener expired before a connection arrived
    #[error("listener expired before a connection arrived")]
    Expired,

    /// Handshake nonce verification failed
    #[error("handshake authentication failed")]
    AuthFailed,

    /// The peer closed the socket mid-exchange
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// An internal channel was dropped
    #[error("channel closed")]
    ChannelClosed,
}
