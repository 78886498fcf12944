//! Wire protocol framing, reassembly, and session signaling for messenger P2P.
//!
//! This crate provides the transport-agnostic pieces of the P2P transfer
//! stack: binary message framing for both wire versions, splitting and
//! pooled reassembly of fragmented messages, the SLP session-description
//! text codec used to negotiate transfers, and the length-prefixed framing
//! spoken on negotiated direct connections.
//!
//! ## Features
//!
//! - **Two Header Variants**: fixed 48-byte V1 and TLV-extensible V2
//! - **Zero-Copy I/O**: Uses `Bytes`/`BytesMut` for minimal allocations
//! - **Message Splitting**: bounded-size chunks with per-version semantics
//! - **Pooled Reassembly**: per-version FIFOs of complete messages
//! - **SLP Codec**: INVITE/status signaling with GUID correlation
//! - **Direct Framing**: foo preamble, handshake and data frames
//!
//! ## Wire Format (relay transport)
//!
//! ```text
//! +----------------------+----------------------------+
//! | V1 Header (48B)      | little-endian, fixed       |
//! |   or V2 Headers      | big-endian, TLV-extensible |
//! +----------------------+----------------------------+
//! | body                 | variable (0..N)            |
//! +----------------------+----------------------------+
//! | u32 footer (V1 only) | big-endian application id  |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod direct;
pub mod error;
pub mod header;
pub mod message;
pub mod pool;
pub mod slp;

// Re-export main types
pub use direct::{
    encode_frame, encode_handshake, parse_handshake, DirectFrameDecoder, FOO_PAYLOAD,
    FOO_PREAMBLE, MAX_FRAME_SIZE,
};
pub use error::WireError;
pub use header::{
    Header, MessageFlags, OpCode, Tlv, TransferFlow, V1Header, V2DataHeader, V2Header,
    WireVersion, TLV_ACKED_IDENTIFIER, TLV_REMAINING_BYTES, V1_FOOTER_SIZE, V1_HEADER_SIZE,
    V2_BASE_HEADER_SIZE, V2_DATA_HEADER_SIZE,
};
pub use message::{Message, MAX_PAYLOAD_SIZE};
pub use pool::MessagePool;
pub use slp::{
    format_guid, parse_guid, SlpContentType, SlpError, SlpMessage, SlpStartLine, EUF_GUID_ACTIVITY,
    EUF_GUID_FILE, EUF_GUID_USER_TILE, METHOD_BYE, METHOD_INVITE, SLP_VERSION, STATUS_DECLINE,
    STATUS_INTERNAL_ERROR, STATUS_OK,
};
