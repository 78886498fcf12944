//! Wire message representation.
//!
//! A [`Message`] pairs a version-tagged header with a payload and, for V1 on
//! the relay transport, a trailing footer that carries the application id of
//! the payload. Messages know how to serialize themselves for the relay and
//! direct transports, how to split into bounded-size chunks, and how to
//! produce the acknowledgement for a received message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::header::{
    tlv_region_len, Header, MessageFlags, OpCode, TransferFlow, V1Header, V2DataHeader, V2Header,
    WireVersion, V1_FOOTER_SIZE, V1_HEADER_SIZE,
};
use crate::WireError;

/// Upper bound on a single wire message's payload
pub const MAX_PAYLOAD_SIZE: usize = 1 << 20;

/// A single P2P wire message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Version-tagged header
    pub header: Header,
    /// V1 relay footer value (application id; unused for V2)
    pub footer: u32,
    pub(crate) body: Bytes,
}

impl Message {
    /// Create an empty message of the given wire version
    pub fn new(version: WireVersion) -> Self {
        let header = match version {
            WireVersion::V1 => Header::V1(V1Header::default()),
            WireVersion::V2 => Header::V2(V2Header::default()),
        };
        Self {
            header,
            footer: 0,
            body: Bytes::new(),
        }
    }

    /// Create a message of the given version carrying `body`
    pub fn with_body(version: WireVersion, body: Bytes) -> Self {
        let mut msg = Self::new(version);
        msg.set_body(body);
        msg
    }

    /// Wire version, derived from the header variant
    pub fn version(&self) -> WireVersion {
        match &self.header {
            Header::V1(_) => WireVersion::V1,
            Header::V2(_) => WireVersion::V2,
        }
    }

    /// Payload bytes
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Replace the payload, recomputing the header's effective sizes
    pub fn set_body(&mut self, body: Bytes) {
        match &mut self.header {
            Header::V1(h) => {
                h.message_size = body.len() as u32;
                h.total_size = body.len() as u64;
            }
            Header::V2(h) => {
                h.message_size = body.len() as u32;
                if body.is_empty() {
                    h.data_header = None;
                } else if h.data_header.is_none() {
                    h.data_header = Some(V2DataHeader::default());
                }
            }
        }
        self.body = body;
    }

    /// V1 header accessor
    pub fn v1(&self) -> Option<&V1Header> {
        match &self.header {
            Header::V1(h) => Some(h),
            Header::V2(_) => None,
        }
    }

    /// Mutable V1 header accessor
    pub fn v1_mut(&mut self) -> Option<&mut V1Header> {
        match &mut self.header {
            Header::V1(h) => Some(h),
            Header::V2(_) => None,
        }
    }

    /// V2 header accessor
    pub fn v2(&self) -> Option<&V2Header> {
        match &self.header {
            Header::V1(_) => None,
            Header::V2(h) => Some(h),
        }
    }

    /// Mutable V2 header accessor
    pub fn v2_mut(&mut self) -> Option<&mut V2Header> {
        match &mut self.header {
            Header::V1(_) => None,
            Header::V2(h) => Some(h),
        }
    }

    /// Message identifier
    pub fn identifier(&self) -> u32 {
        match &self.header {
            Header::V1(h) => h.identifier,
            Header::V2(h) => h.identifier,
        }
    }

    /// Set the message identifier
    pub fn set_identifier(&mut self, identifier: u32) {
        match &mut self.header {
            Header::V1(h) => h.identifier = identifier,
            Header::V2(h) => h.identifier = identifier,
        }
    }

    /// Session id the payload belongs to (0 for signaling)
    pub fn session_id(&self) -> u32 {
        match &self.header {
            Header::V1(h) => h.session_id,
            Header::V2(h) => h.data_header.as_ref().map_or(0, |d| d.session_id),
        }
    }

    /// Set the session id
    pub fn set_session_id(&mut self, session_id: u32) {
        match &mut self.header {
            Header::V1(h) => h.session_id = session_id,
            Header::V2(h) => {
                if let Some(data) = h.data_header.as_mut() {
                    data.session_id = session_id;
                }
            }
        }
    }

    /// Payload size declared by the header
    pub fn message_size(&self) -> u64 {
        match &self.header {
            Header::V1(h) => u64::from(h.message_size),
            Header::V2(h) => u64::from(h.message_size),
        }
    }

    /// Whether this message acknowledges another
    pub fn is_ack(&self) -> bool {
        match &self.header {
            Header::V1(h) => h.is_ack(),
            Header::V2(h) => h.acked_identifier.is_some() && h.message_size == 0,
        }
    }

    /// Whether the relay path should acknowledge this message
    pub fn requires_ack(&self) -> bool {
        match &self.header {
            Header::V1(h) => !h.is_ack() && h.message_size > 0,
            Header::V2(h) => h.op_code.contains(OpCode::RAK),
        }
    }

    /// Produce the acknowledgement for this message.
    ///
    /// The ack carries no payload. For V1 the ack bookkeeping fields echo the
    /// received header; for V2 the acknowledged identifier rides in a header
    /// TLV. The ack's own identifier is left at 0 for the outbound sequencer
    /// to assign.
    pub fn create_ack(&self) -> Message {
        match &self.header {
            Header::V1(h) => {
                let mut ack = *h;
                ack.flags = MessageFlags::ACK;
                ack.ack_identifier = h.identifier;
                ack.ack_session_id = h.ack_session_id;
                ack.ack_total_size = h.total_size;
                ack.identifier = 0;
                ack.offset = 0;
                ack.message_size = 0;
                Message {
                    header: Header::V1(ack),
                    footer: self.footer,
                    body: Bytes::new(),
                }
            }
            Header::V2(h) => {
                let ack = V2Header {
                    acked_identifier: Some(h.identifier.wrapping_add(h.message_size)),
                    ..Default::default()
                };
                Message {
                    header: Header::V2(ack),
                    footer: 0,
                    body: Bytes::new(),
                }
            }
        }
    }

    /// Split into chunks whose payloads are at most `max_chunk` bytes.
    ///
    /// Returns the message unchanged when it already fits. V1 chunks share
    /// the identifier and advance `offset`; each gets a fresh random
    /// ack-session-id so every chunk is independently acknowledgeable. V2
    /// chunks advance `identifier` by each emitted payload size, keep header
    /// TLVs on the first chunk only, and strip the `FIRST` bit from the
    /// transfer-flow of continuations.
    pub fn split(&self, max_chunk: usize) -> Vec<Message> {
        let max_chunk = max_chunk.max(1);
        match &self.header {
            Header::V1(h) => {
                if self.body.len() <= max_chunk {
                    return vec![self.clone()];
                }

                let total = self.body.len();
                let mut chunks = Vec::with_capacity((total + max_chunk - 1) / max_chunk);
                let mut start = 0;
                while start < total {
                    let len = max_chunk.min(total - start);
                    let mut chunk = *h;
                    chunk.offset = h.offset + start as u64;
                    chunk.message_size = len as u32;
                    chunk.ack_session_id = rand::random::<u32>();
                    chunks.push(Message {
                        header: Header::V1(chunk),
                        footer: self.footer,
                        body: self.body.slice(start..start + len),
                    });
                    start += len;
                }
                chunks
            }
            Header::V2(h) => {
                // A chunk boundary must not cut through the envelope TLVs,
                // so the first chunk's payload room shrinks by their length.
                let first_room = max_chunk
                    .saturating_sub(tlv_region_len(h.envelope_tlv_sizes()))
                    .max(1);
                if self.body.len() <= first_room {
                    return vec![self.clone()];
                }

                let total = self.body.len();
                let template = h.data_header.clone().unwrap_or_default();
                let mut chunks = Vec::new();
                let mut start = 0;
                let mut identifier = h.identifier;
                while start < total {
                    let room = if start == 0 { first_room } else { max_chunk };
                    let len = room.min(total - start);
                    let remaining = (total - start - len) as u64;

                    let mut chunk = if start == 0 {
                        h.clone()
                    } else {
                        V2Header::default()
                    };
                    chunk.identifier = identifier;
                    chunk.message_size = len as u32;

                    let data = chunk.data_header.get_or_insert_with(V2DataHeader::default);
                    data.package_number = template.package_number;
                    data.session_id = template.session_id;
                    data.remaining_bytes = remaining;
                    if start == 0 {
                        data.transfer_flow = template.transfer_flow;
                        data.tlvs = template.tlvs.clone();
                    } else {
                        data.transfer_flow = template.transfer_flow & !TransferFlow::FIRST;
                        data.tlvs = Vec::new();
                    }

                    identifier = identifier.wrapping_add(len as u32);
                    chunks.push(Message {
                        header: Header::V2(chunk),
                        footer: 0,
                        body: self.body.slice(start..start + len),
                    });
                    start += len;
                }
                chunks
            }
        }
    }

    /// Total encoded length on the relay transport
    pub fn encoded_len(&self) -> usize {
        match &self.header {
            Header::V1(_) => V1_HEADER_SIZE + self.body.len() + V1_FOOTER_SIZE,
            Header::V2(h) => h.encoded_len() + self.body.len(),
        }
    }

    /// Serialize for the relay transport (V1 carries the footer)
    pub fn encode(&self) -> Result<Bytes, WireError> {
        self.encode_inner(true)
    }

    /// Serialize for the direct transport (no footer, no length prefix)
    pub fn encode_bare(&self) -> Result<Bytes, WireError> {
        self.encode_inner(false)
    }

    fn encode_inner(&self, with_footer: bool) -> Result<Bytes, WireError> {
        if self.message_size() != self.body.len() as u64 {
            return Err(WireError::Sizes {
                message: self.message_size(),
                total: self.body.len() as u64,
            });
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        match &self.header {
            Header::V1(h) => {
                h.encode(&mut buf);
                buf.put_slice(&self.body);
                if with_footer {
                    buf.put_u32(self.footer);
                }
            }
            Header::V2(h) => {
                h.encode(&mut buf)?;
                buf.put_slice(&self.body);
            }
        }
        Ok(buf.freeze())
    }

    /// Parse a relay-framed message (V1 requires the trailing footer)
    pub fn decode(version: WireVersion, buf: &mut Bytes) -> Result<Self, WireError> {
        let mut msg = Self::decode_bare(version, buf)?;
        if version == WireVersion::V1 {
            if buf.len() < V1_FOOTER_SIZE {
                return Err(WireError::Incomplete);
            }
            msg.footer = buf.get_u32();
        }
        Ok(msg)
    }

    /// Parse a message without a footer, as framed on the direct transport.
    ///
    /// Trailing bytes past the declared payload are left in `buf`.
    pub fn decode_bare(version: WireVersion, buf: &mut Bytes) -> Result<Self, WireError> {
        let header = match version {
            WireVersion::V1 => Header::V1(V1Header::decode(buf)?),
            WireVersion::V2 => Header::V2(V2Header::decode(buf)?),
        };

        let size = match &header {
            Header::V1(h) => h.message_size as usize,
            Header::V2(h) => h.message_size as usize,
        };
        if size > MAX_PAYLOAD_SIZE {
            return Err(WireError::Size(size));
        }
        if buf.len() < size {
            return Err(WireError::Incomplete);
        }
        let body = buf.split_to(size);

        Ok(Self {
            header,
            footer: 0,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1_message(body: &'static [u8]) -> Message {
        let mut msg = Message::with_body(WireVersion::V1, Bytes::from_static(body));
        msg.set_identifier(100);
        msg.set_session_id(7);
        msg.footer = 2;
        msg
    }

    #[test]
    fn test_v1_relay_roundtrip() {
        let msg = v1_message(b"hello world");
        let wire = msg.encode().unwrap();
        assert_eq!(wire.len(), V1_HEADER_SIZE + 11 + V1_FOOTER_SIZE);

        let mut buf = wire;
        let decoded = Message::decode(WireVersion::V1, &mut buf).unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_v1_footer_required_on_relay() {
        let msg = v1_message(b"hi");
        let wire = msg.encode().unwrap();
        let mut truncated = wire.slice(..wire.len() - 2);
        assert!(matches!(
            Message::decode(WireVersion::V1, &mut truncated),
            Err(WireError::Incomplete)
        ));
    }

    #[test]
    fn test_v1_bare_has_no_footer() {
        let msg = v1_message(b"hi");
        let bare = msg.encode_bare().unwrap();
        assert_eq!(bare.len(), V1_HEADER_SIZE + 2);

        let mut buf = bare;
        let decoded = Message::decode_bare(WireVersion::V1, &mut buf).unwrap();
        assert_eq!(decoded.body(), msg.body());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_split_not_needed() {
        let msg = v1_message(b"small");
        let chunks = msg.split(1202);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], msg);
    }

    #[test]
    fn test_split_v1_offsets_and_sizes() {
        let body = Bytes::from(vec![0xAB; 3000]);
        let mut msg = Message::with_body(WireVersion::V1, body.clone());
        msg.set_identifier(500);
        msg.footer = 2;

        let chunks = msg.split(1202);
        assert_eq!(chunks.len(), 3);

        let offsets: Vec<u64> = chunks.iter().map(|c| c.v1().unwrap().offset).collect();
        let sizes: Vec<u32> = chunks.iter().map(|c| c.v1().unwrap().message_size).collect();
        assert_eq!(offsets, vec![0, 1202, 2404]);
        assert_eq!(sizes, vec![1202, 1202, 596]);

        for chunk in &chunks {
            let h = chunk.v1().unwrap();
            assert_eq!(h.identifier, 500);
            assert_eq!(h.total_size, 3000);
            assert_eq!(chunk.footer, 2);
        }

        let rejoined: Vec<u8> = chunks
            .iter()
            .flat_map(|c| c.body().iter().copied())
            .collect();
        assert_eq!(rejoined, body.to_vec());
    }

    #[test]
    fn test_split_v1_fresh_ack_session_ids() {
        let msg = Message::with_body(WireVersion::V1, Bytes::from(vec![0; 5000]));
        let chunks = msg.split(1202);
        let ids: Vec<u32> = chunks
            .iter()
            .map(|c| c.v1().unwrap().ack_session_id)
            .collect();
        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn test_split_v2_identifier_advance() {
        let mut msg = Message::with_body(WireVersion::V2, Bytes::from(vec![1; 3000]));
        msg.set_identifier(1000);
        msg.set_session_id(42);
        if let Some(h) = msg.v2_mut() {
            let data = h.data_header.as_mut().unwrap();
            data.transfer_flow = TransferFlow::FIRST | TransferFlow::FILE;
            data.package_number = 9;
        }

        let chunks = msg.split(1202);
        assert_eq!(chunks.len(), 3);

        let first = chunks[0].v2().unwrap();
        assert_eq!(first.identifier, 1000);
        let first_data = first.data_header.as_ref().unwrap();
        assert!(first_data.transfer_flow.contains(TransferFlow::FIRST));
        assert_eq!(
            first_data.remaining_bytes,
            3000 - u64::from(first.message_size)
        );

        let mut expected_id = 1000 + first.message_size;
        let mut remaining = first_data.remaining_bytes;
        for chunk in &chunks[1..] {
            let h = chunk.v2().unwrap();
            assert_eq!(h.identifier, expected_id);
            let data = h.data_header.as_ref().unwrap();
            assert_eq!(data.transfer_flow, TransferFlow::FILE);
            assert_eq!(data.package_number, 9);
            assert_eq!(data.session_id, 42);
            remaining -= u64::from(h.message_size);
            assert_eq!(data.remaining_bytes, remaining);
            expected_id += h.message_size;
        }
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_create_ack_v1() {
        let mut msg = v1_message(b"payload");
        if let Some(h) = msg.v1_mut() {
            h.ack_session_id = 0xBEEF;
        }

        let ack = msg.create_ack();
        let h = ack.v1().unwrap();
        assert_eq!(h.flags, MessageFlags::ACK);
        assert_eq!(h.ack_identifier, 100);
        assert_eq!(h.ack_session_id, 0xBEEF);
        assert_eq!(h.ack_total_size, 7);
        assert_eq!(h.message_size, 0);
        assert_eq!(h.identifier, 0);
        assert!(ack.body().is_empty());
        assert!(ack.is_ack());
        assert!(!ack.requires_ack());
    }

    #[test]
    fn test_create_ack_v2() {
        let mut msg = Message::with_body(WireVersion::V2, Bytes::from_static(b"abcde"));
        msg.set_identifier(600);

        let ack = msg.create_ack();
        let h = ack.v2().unwrap();
        assert_eq!(h.acked_identifier, Some(605));
        assert_eq!(h.message_size, 0);
        assert!(h.data_header.is_none());
        assert!(ack.is_ack());
    }

    #[test]
    fn test_size_mismatch_rejected_on_encode() {
        let mut msg = v1_message(b"abc");
        if let Some(h) = msg.v1_mut() {
            h.message_size = 99;
        }
        assert!(matches!(
            msg.encode(),
            Err(WireError::Sizes { .. })
        ));
    }
}
