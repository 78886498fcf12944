//! Transfer sessions, SLP negotiation and direct connections for messenger P2P.
//!
//! This crate layers the peer-to-peer transfer state machine on top of
//! `p2p-wire`: an SLP negotiation handler that answers invitations and
//! drives transfers per call id, transfer sessions that stream payload data
//! through a shared outbound scheduler, and the NAT-traversal fast path that
//! upgrades a negotiated transfer from the relay transport to an
//! authenticated TCP connection.
//!
//! ## Features
//!
//! - **Negotiation Handler**: INVITE/200/603/BYE session-description flow
//! - **Transfer Sessions**: file, user-tile, emoticon and activity payloads
//! - **Message Pump**: pooled reassembly feeding registered handlers
//! - **Outbound Scheduler**: identifier stamping and bounded-size splitting
//! - **Direct Connections**: probe-port listener, foo handshake, nonce auth
//! - **Connection Typing**: NAT classification from local/external endpoints
//!
//! ## Data Path
//!
//! ```text
//! relay transport ──> MessagePump ──> SlpHandler ──> TransferSession
//!                         ^                              |
//!                         |                              v
//! DirectConnection ───────+                     Outbound scheduler
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod config;
pub mod direct;
pub mod error;
pub mod handler;
pub mod nat;
pub mod properties;
pub mod transfer;

// Re-export main types
pub use bridge::{HandlerRegistry, MessageHandler, MessagePump, MessageProcessor, Outbound};
pub use config::P2pConfig;
pub use direct::{
    accept_handshake, bind_listener, connect_handshake, hash_nonce, run_listener, AuthState,
    DirectConnection,
};
pub use error::SessionError;
pub use handler::{InviteDecision, SlpHandler, TransferInvitation, TransferObserver};
pub use nat::{net_id, ConnectionType};
pub use properties::{ActivityContext, DataType, FileContext, TransferProperties};
pub use transfer::{shared_stream, DataStream, MemoryStream, SharedStream, TransferSession};
