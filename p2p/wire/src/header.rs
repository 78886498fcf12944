//! Binary header processing for both wire versions.
//!
//! Version 1 is a fixed 48-byte little-endian header followed by the payload
//! and, on the relay transport, a 4-byte big-endian footer. Version 2 is a
//! big-endian, TLV-extensible header pair: an envelope header that is always
//! present and a data header that only precedes a payload.
//!
//! ```text
//! V1 (little-endian, 48 bytes):
//! | 0  | 4 | session id      |
//! | 4  | 4 | identifier      |
//! | 8  | 8 | data offset     |
//! | 16 | 8 | total size      |
//! | 24 | 4 | message size    |
//! | 28 | 4 | flags           |
//! | 32 | 4 | ack session id  |
//! | 36 | 4 | ack identifier  |
//! | 40 | 8 | ack total size  |
//!
//! V2 (big-endian, variable):
//! [len u8][op u8][payload len u16][identifier u32][TLVs ... pad]
//! [len u8][transfer flow u8][package u16][session id u32][TLVs ... pad]
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// V1 header size in bytes
pub const V1_HEADER_SIZE: usize = 48;

/// V1 relay footer size in bytes
pub const V1_FOOTER_SIZE: usize = 4;

/// V2 envelope header size in bytes, without TLVs
pub const V2_BASE_HEADER_SIZE: usize = 8;

/// V2 data header size in bytes, without TLVs
pub const V2_DATA_HEADER_SIZE: usize = 8;

/// Envelope TLV kind carrying the acknowledged identifier (u32)
pub const TLV_ACKED_IDENTIFIER: u8 = 0x02;

/// Data TLV kind carrying the bytes still expected for this run (u64)
pub const TLV_REMAINING_BYTES: u8 = 0x01;

/// Wire protocol versions
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireVersion {
    /// Fixed 48-byte header with trailing relay footer
    V1 = 1,
    /// TLV-extensible header pair
    V2 = 2,
}

impl TryFrom<u8> for WireVersion {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(WireVersion::V1),
            2 => Ok(WireVersion::V2),
            _ => Err(crate::WireError::Version(value)),
        }
    }
}

bitflags! {
    /// V1 protocol flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MessageFlags: u32 {
        /// Negative acknowledgement
        const NAK = 0x1;
        /// Acknowledgement
        const ACK = 0x2;
        /// Waiting for the peer to act
        const WAITING = 0x4;
        /// Protocol-level error
        const ERROR = 0x8;
        /// Payload carries file data
        const FILE = 0x10;
        /// Payload carries object data
        const DATA = 0x20;
        /// Session close request
        const CLOSE = 0x40;
        /// Transport-layer error
        const TLP_ERROR = 0x80;
        /// Direct-connection handshake frame
        const DIRECT_HANDSHAKE = 0x100;
    }
}

bitflags! {
    /// V2 operation code bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OpCode: u8 {
        /// Peer wants its init state re-synced
        const SYN = 0x1;
        /// Peer requests an acknowledgement
        const RAK = 0x2;
    }
}

bitflags! {
    /// V2 transfer-flow combination
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TransferFlow: u8 {
        /// First fragment of a logical message
        const FIRST = 0x01;
        /// Object (user-tile or emoticon) payload
        const MSN_OBJECT = 0x04;
        /// File-transfer payload
        const FILE = 0x06;
    }
}

/// Version-tagged header variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Header {
    /// Version 1 header
    V1(V1Header),
    /// Version 2 header
    V2(V2Header),
}

/// A raw type-length-value entry preserved through parse/serialize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tlv {
    /// TLV kind tag
    pub kind: u8,
    /// Raw value bytes (at most 255)
    pub value: Bytes,
}

/// Version 1 header (48 bytes, little-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct V1Header {
    /// Session the payload belongs to (0 for signaling)
    pub session_id: u32,
    /// Message identifier, shared by every chunk of one message
    pub identifier: u32,
    /// Byte offset of this chunk within the full message
    pub offset: u64,
    /// Total size of the full message
    pub total_size: u64,
    /// Size of this chunk's payload
    pub message_size: u32,
    /// Protocol flags
    pub flags: MessageFlags,
    /// Ack bookkeeping: session id echo
    pub ack_session_id: u32,
    /// Ack bookkeeping: identifier being acknowledged
    pub ack_identifier: u32,
    /// Ack bookkeeping: total size being acknowledged
    pub ack_total_size: u64,
}

impl Default for V1Header {
    fn default() -> Self {
        Self {
            session_id: 0,
            identifier: 0,
            offset: 0,
            total_size: 0,
            message_size: 0,
            flags: MessageFlags::empty(),
            ack_session_id: 0,
            ack_identifier: 0,
            ack_total_size: 0,
        }
    }
}

impl V1Header {
    /// Encode the header to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.session_id);
        buf.put_u32_le(self.identifier);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.total_size);
        buf.put_u32_le(self.message_size);
        buf.put_u32_le(self.flags.bits());
        buf.put_u32_le(self.ack_session_id);
        buf.put_u32_le(self.ack_identifier);
        buf.put_u64_le(self.ack_total_size);
    }

    /// Decode a header from bytes, consuming exactly 48 bytes
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < V1_HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }

        let session_id = buf.get_u32_le();
        let identifier = buf.get_u32_le();
        let offset = buf.get_u64_le();
        let total_size = buf.get_u64_le();
        let message_size = buf.get_u32_le();
        let raw_flags = buf.get_u32_le();
        let flags =
            MessageFlags::from_bits(raw_flags).ok_or(crate::WireError::Flags(raw_flags))?;
        let ack_session_id = buf.get_u32_le();
        let ack_identifier = buf.get_u32_le();
        let ack_total_size = buf.get_u64_le();

        // A fragment must lie inside the declared total: offset + size <= total
        if offset
            .checked_add(u64::from(message_size))
            .map_or(true, |end| end > total_size)
        {
            return Err(crate::WireError::Sizes {
                message: u64::from(message_size),
                total: total_size,
            });
        }

        Ok(Self {
            session_id,
            identifier,
            offset,
            total_size,
            message_size,
            flags,
            ack_session_id,
            ack_identifier,
            ack_total_size,
        })
    }

    /// Whether this header marks an acknowledgement
    pub fn is_ack(&self) -> bool {
        self.flags.contains(MessageFlags::ACK)
    }
}

/// Version 2 data header, present only when a payload follows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V2DataHeader {
    /// Transfer-flow combination (empty for continuation fragments)
    pub transfer_flow: TransferFlow,
    /// Package number shared by every fragment of one message
    pub package_number: u16,
    /// Session the payload belongs to (0 for signaling)
    pub session_id: u32,
    /// Bytes still expected after this fragment (TLV 0x01)
    pub remaining_bytes: u64,
    /// Unrecognized data TLVs, preserved verbatim
    pub tlvs: Vec<Tlv>,
}

impl Default for V2DataHeader {
    fn default() -> Self {
        Self {
            transfer_flow: TransferFlow::empty(),
            package_number: 0,
            session_id: 0,
            remaining_bytes: 0,
            tlvs: Vec::new(),
        }
    }
}

/// Version 2 envelope header (big-endian, variable length)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V2Header {
    /// Message identifier; advances by payload size across chunks
    pub identifier: u32,
    /// Operation code bits
    pub op_code: OpCode,
    /// Payload byte length (u16 on the wire)
    pub message_size: u32,
    /// Identifier being acknowledged (TLV 0x02)
    pub acked_identifier: Option<u32>,
    /// Unrecognized envelope TLVs, preserved verbatim
    pub tlvs: Vec<Tlv>,
    /// Data header, present exactly when `message_size > 0`
    pub data_header: Option<V2DataHeader>,
}

impl Default for V2Header {
    fn default() -> Self {
        Self {
            identifier: 0,
            op_code: OpCode::empty(),
            message_size: 0,
            acked_identifier: None,
            tlvs: Vec::new(),
            data_header: None,
        }
    }
}

impl V2Header {
    /// Total encoded length of envelope plus data header, without payload
    pub fn encoded_len(&self) -> usize {
        let mut len = V2_BASE_HEADER_SIZE + tlv_region_len(self.envelope_tlv_sizes());
        if let Some(data) = &self.data_header {
            len += V2_DATA_HEADER_SIZE + tlv_region_len(data.tlv_sizes());
        }
        len
    }

    pub(crate) fn envelope_tlv_sizes(&self) -> usize {
        let mut len = 0;
        if self.acked_identifier.is_some() {
            len += 2 + 4;
        }
        for tlv in &self.tlvs {
            len += 2 + tlv.value.len();
        }
        len
    }

    /// Encode envelope and data headers to bytes
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), crate::WireError> {
        let envelope_tlvs = tlv_region_len(self.envelope_tlv_sizes());
        let header_len = V2_BASE_HEADER_SIZE + envelope_tlvs;
        if header_len > u8::MAX as usize {
            return Err(crate::WireError::Size(header_len));
        }
        if self.message_size > u32::from(u16::MAX) {
            return Err(crate::WireError::Size(self.message_size as usize));
        }

        buf.put_u8(header_len as u8);
        buf.put_u8(self.op_code.bits());
        buf.put_u16(self.message_size as u16);
        buf.put_u32(self.identifier);

        let mark = buf.len();
        if let Some(acked) = self.acked_identifier {
            buf.put_u8(TLV_ACKED_IDENTIFIER);
            buf.put_u8(4);
            buf.put_u32(acked);
        }
        encode_tlvs(buf, &self.tlvs)?;
        pad_tlv_region(buf, mark, envelope_tlvs);

        if let Some(data) = &self.data_header {
            data.encode(buf)?;
        }

        Ok(())
    }

    /// Decode envelope and, when a payload is declared, the data header
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < V2_BASE_HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }

        let header_len = buf.get_u8() as usize;
        if header_len < V2_BASE_HEADER_SIZE {
            return Err(crate::WireError::Malformed);
        }
        let raw_op = buf.get_u8();
        let op_code = OpCode::from_bits(raw_op).ok_or(crate::WireError::OpCode(raw_op))?;
        let message_size = u32::from(buf.get_u16());
        let identifier = buf.get_u32();

        let tlv_len = header_len - V2_BASE_HEADER_SIZE;
        if buf.len() < tlv_len {
            return Err(crate::WireError::Incomplete);
        }
        let mut tlv_region = buf.split_to(tlv_len);

        let mut acked_identifier = None;
        let mut tlvs = Vec::new();
        decode_tlvs(&mut tlv_region, |kind, mut value| {
            match kind {
                TLV_ACKED_IDENTIFIER if value.len() == 4 => {
                    acked_identifier = Some(value.get_u32());
                }
                _ => tlvs.push(Tlv { kind, value }),
            }
            Ok(())
        })?;

        let data_header = if message_size > 0 {
            Some(V2DataHeader::decode(buf)?)
        } else {
            None
        };

        Ok(Self {
            identifier,
            op_code,
            message_size,
            acked_identifier,
            tlvs,
            data_header,
        })
    }
}

impl V2DataHeader {
    fn tlv_sizes(&self) -> usize {
        let mut len = 0;
        if self.remaining_bytes > 0 {
            len += 2 + 8;
        }
        for tlv in &self.tlvs {
            len += 2 + tlv.value.len();
        }
        len
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), crate::WireError> {
        let data_tlvs = tlv_region_len(self.tlv_sizes());
        let header_len = V2_DATA_HEADER_SIZE + data_tlvs;
        if header_len > u8::MAX as usize {
            return Err(crate::WireError::Size(header_len));
        }

        buf.put_u8(header_len as u8);
        buf.put_u8(self.transfer_flow.bits());
        buf.put_u16(self.package_number);
        buf.put_u32(self.session_id);

        let mark = buf.len();
        if self.remaining_bytes > 0 {
            buf.put_u8(TLV_REMAINING_BYTES);
            buf.put_u8(8);
            buf.put_u64(self.remaining_bytes);
        }
        encode_tlvs(buf, &self.tlvs)?;
        pad_tlv_region(buf, mark, data_tlvs);

        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < V2_DATA_HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }

        let header_len = buf.get_u8() as usize;
        if header_len < V2_DATA_HEADER_SIZE {
            return Err(crate::WireError::Malformed);
        }
        let raw_flow = buf.get_u8();
        let transfer_flow =
            TransferFlow::from_bits(raw_flow).ok_or(crate::WireError::TransferFlow(raw_flow))?;
        let package_number = buf.get_u16();
        let session_id = buf.get_u32();

        let tlv_len = header_len - V2_DATA_HEADER_SIZE;
        if buf.len() < tlv_len {
            return Err(crate::WireError::Incomplete);
        }
        let mut tlv_region = buf.split_to(tlv_len);

        let mut remaining_bytes = 0;
        let mut tlvs = Vec::new();
        decode_tlvs(&mut tlv_region, |kind, mut value| {
            match kind {
                TLV_REMAINING_BYTES if value.len() == 8 => {
                    remaining_bytes = value.get_u64();
                }
                _ => tlvs.push(Tlv { kind, value }),
            }
            Ok(())
        })?;

        Ok(Self {
            transfer_flow,
            package_number,
            session_id,
            remaining_bytes,
            tlvs,
        })
    }
}

pub(crate) fn tlv_region_len(payload: usize) -> usize {
    // TLV regions are padded to a 4-byte boundary
    (payload + 3) & !3
}

fn encode_tlvs(buf: &mut BytesMut, tlvs: &[Tlv]) -> Result<(), crate::WireError> {
    for tlv in tlvs {
        if tlv.value.len() > u8::MAX as usize || tlv.kind == 0 {
            return Err(crate::WireError::Tlv);
        }
        buf.put_u8(tlv.kind);
        buf.put_u8(tlv.value.len() as u8);
        buf.put_slice(&tlv.value);
    }
    Ok(())
}

fn pad_tlv_region(buf: &mut BytesMut, mark: usize, region_len: usize) {
    let written = buf.len() - mark;
    for _ in written..region_len {
        buf.put_u8(0);
    }
}

fn decode_tlvs<F>(region: &mut Bytes, mut visit: F) -> Result<(), crate::WireError>
where
    F: FnMut(u8, Bytes) -> Result<(), crate::WireError>,
{
    while region.len() >= 2 {
        let kind = region.get_u8();
        if kind == 0 {
            // Zero kind starts the padding
            break;
        }
        let len = region.get_u8() as usize;
        if len > region.len() {
            return Err(crate::WireError::Tlv);
        }
        let value = region.split_to(len);
        visit(kind, value)?;
    }
    Ok(())
}
