//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Incomplete message (need more data)
    #[error("incomplete message")]
    Incomplete,

    /// Unsupported wire version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Unknown protocol flag bits
    #[error("unknown flag bits: {0:#x}")]
    Flags(u32),

    /// Unknown operation-code bits
    #[error("unknown operation code: {0:#x}")]
    OpCode(u8),

    /// Unknown transfer-flow bits
    #[error("unknown transfer-flow: {0:#x}")]
    TransferFlow(u8),

    /// Malformed TLV region
    #[error("malformed tlv region")]
    Tlv,

    /// Declared sizes are inconsistent with the payload
    #[error("inconsistent sizes: message {message} total {total}")]
    Sizes {
        /// Declared message size
        message: u64,
        /// Declared total size
        total: u64,
    },

    /// Malformed message structure
    #[error("malformed message")]
    Malformed,
}
