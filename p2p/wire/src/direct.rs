//! Direct-connection wire codec.
//!
//! Once two peers negotiate a direct socket, every payload travels as a
//! 4-byte little-endian length prefix followed by that many bytes; relay
//! footers are never present. The very first frame each way is the fixed
//! `foo` preamble, the second is a handshake frame carrying a nonce GUID
//! after a V1 header, and everything after authentication is an ordinary
//! header-framed message.
//!
//! ```text
//! preamble:  04 00 00 00 66 6F 6F 00
//! handshake: [len u32 LE][48-byte V1 header][nonce GUID, 16 bytes LE]
//! data:      [len u32 LE][header][body]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::header::{MessageFlags, V1Header, V1_HEADER_SIZE};
use crate::message::{Message, MAX_PAYLOAD_SIZE};
use crate::WireError;

/// The 8-byte opener both sides send first
pub const FOO_PREAMBLE: [u8; 8] = *b"\x04\x00\x00\x00foo\x00";

/// Preamble payload after the length prefix
pub const FOO_PAYLOAD: &[u8] = b"foo\x00";

/// Upper bound on a single direct frame
pub const MAX_FRAME_SIZE: usize = MAX_PAYLOAD_SIZE + 1024;

/// Wrap a message in direct framing (length prefix, no footer)
pub fn encode_frame(msg: &Message) -> Result<Bytes, WireError> {
    let bare = msg.encode_bare()?;
    let mut buf = BytesMut::with_capacity(4 + bare.len());
    buf.put_u32_le(bare.len() as u32);
    buf.put_slice(&bare);
    Ok(buf.freeze())
}

/// Build the framed handshake carrying `nonce` after a V1 header
pub fn encode_handshake(nonce: Uuid) -> Bytes {
    let header = V1Header {
        flags: MessageFlags::DIRECT_HANDSHAKE,
        ..Default::default()
    };

    let mut buf = BytesMut::with_capacity(4 + V1_HEADER_SIZE + 16);
    buf.put_u32_le((V1_HEADER_SIZE + 16) as u32);
    header.encode(&mut buf);
    buf.put_slice(&nonce.to_bytes_le());
    buf.freeze()
}

/// Extract the nonce GUID from a handshake frame payload
pub fn parse_handshake(frame: &Bytes) -> Result<Uuid, WireError> {
    let mut buf = frame.clone();
    let header = V1Header::decode(&mut buf)?;
    if !header.flags.contains(MessageFlags::DIRECT_HANDSHAKE) {
        return Err(WireError::Malformed);
    }
    if buf.len() < 16 {
        return Err(WireError::Incomplete);
    }

    let mut guid = [0u8; 16];
    buf.copy_to_slice(&mut guid);
    Ok(Uuid::from_bytes_le(guid))
}

/// Incremental decoder for length-prefixed direct frames.
///
/// Feed raw socket bytes into `buf`; each call yields at most one complete
/// frame payload, or `Ok(None)` when more data is needed.
#[derive(Debug, Default)]
pub struct DirectFrameDecoder {
    pending: Option<usize>,
}

impl DirectFrameDecoder {
    /// Create a decoder awaiting a length prefix
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to extract the next frame payload from `buf`
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        let len = match self.pending {
            Some(len) => len,
            None => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                let len = buf.get_u32_le() as usize;
                if len == 0 || len > MAX_FRAME_SIZE {
                    return Err(WireError::Size(len));
                }
                self.pending = Some(len);
                len
            }
        };

        if buf.len() < len {
            return Ok(None);
        }
        self.pending = None;
        Ok(Some(buf.split_to(len).freeze()))
    }
}
