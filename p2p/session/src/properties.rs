//! Per-call transfer state and invitation context blobs.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use p2p_wire::{
    MessageFlags, SlpMessage, TransferFlow, EUF_GUID_ACTIVITY, EUF_GUID_FILE, EUF_GUID_USER_TILE,
};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::error::SessionError;

/// Size of the fixed file-context prefix
pub const FILE_CONTEXT_SIZE: usize = 574;
/// File-context format version
const FILE_CONTEXT_VERSION: u32 = 3;
/// UTF-16 code units reserved for the file name, NUL terminator included
const FILE_NAME_UNITS: usize = 260;
/// Trailing reserved bytes of the fixed prefix
const FILE_CONTEXT_RESERVED: usize = 34;

/// Application payload carried by a transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    /// File transfer
    File,
    /// Display image
    UserTile,
    /// Custom emoticon
    Emoticon,
    /// Activity / application invitation
    Activity,
    /// Unrecognized EUF-GUID
    Unknown,
}

impl DataType {
    /// Classifies an invitation from its `EUF-GUID` and `AppID` fields.
    pub fn from_invite(euf_guid: Uuid, app_id: u32) -> Self {
        if euf_guid == EUF_GUID_FILE {
            DataType::File
        } else if euf_guid == EUF_GUID_USER_TILE {
            if app_id == 11 {
                DataType::Emoticon
            } else {
                DataType::UserTile
            }
        } else if euf_guid == EUF_GUID_ACTIVITY {
            DataType::Activity
        } else {
            DataType::Unknown
        }
    }

    /// `EUF-GUID` value sent when inviting for this payload type
    pub fn euf_guid(&self) -> Uuid {
        match self {
            DataType::File => EUF_GUID_FILE,
            DataType::UserTile | DataType::Emoticon => EUF_GUID_USER_TILE,
            DataType::Activity => EUF_GUID_ACTIVITY,
            DataType::Unknown => Uuid::nil(),
        }
    }

    /// Footer tag stamped on data messages of this type
    pub fn footer(&self) -> u32 {
        match self {
            DataType::File => 2,
            DataType::UserTile => 12,
            DataType::Emoticon => 11,
            DataType::Activity | DataType::Unknown => 0,
        }
    }

    /// Header flags stamped on data messages of this type
    pub fn message_flags(&self) -> MessageFlags {
        match self {
            DataType::File => MessageFlags::FILE,
            _ => MessageFlags::DATA,
        }
    }

    /// Transfer-flow bits stamped on V2 data messages of this type
    pub fn transfer_flow(&self) -> TransferFlow {
        match self {
            DataType::File => TransferFlow::FILE,
            DataType::UserTile | DataType::Emoticon => TransferFlow::MSN_OBJECT,
            DataType::Activity | DataType::Unknown => TransferFlow::empty(),
        }
    }
}

/// Negotiation state for one invitation, keyed by call id
#[derive(Clone, Debug)]
pub struct TransferProperties {
    /// Call id correlating every signaling message of this invitation
    pub call_id: Uuid,
    /// Session id carried by the data messages
    pub session_id: u32,
    /// Local account name
    pub local_passport: String,
    /// Remote account name
    pub remote_passport: String,
    /// Local endpoint id, when the conversation is endpoint-addressed
    pub local_endpoint_id: Option<Uuid>,
    /// Remote endpoint id, when known
    pub remote_endpoint_id: Option<Uuid>,
    /// Payload classification from the invitation
    pub data_type: DataType,
    /// Raw (already base64-decoded) context blob from the invitation
    pub context: Bytes,
    /// Branch token of the last signaling message, echoed in replies
    pub last_branch: Uuid,
    /// Sequence number of the last signaling message
    pub last_cseq: u32,
    /// Nonce offered for direct-connection authentication
    pub nonce: Uuid,
    /// Hashed nonce received from the peer, when it offered one
    pub hashed_nonce: Option<Uuid>,
    /// Whether the remote side sent the invitation
    pub remote_invited: bool,
    /// Pending close acknowledgements; the entry is removed at zero
    pub close_state: i32,
    /// Abort handle of the scheduled direct-connection offer, if armed
    pub settle_abort: Option<AbortHandle>,
    /// Invitation parked by a delayed accept/decline decision
    pub pending_invite: Option<SlpMessage>,
}

impl TransferProperties {
    /// Creates negotiation state with a fresh auth nonce.
    pub fn new(call_id: Uuid, session_id: u32) -> Self {
        Self {
            call_id,
            session_id,
            local_passport: String::new(),
            remote_passport: String::new(),
            local_endpoint_id: None,
            remote_endpoint_id: None,
            data_type: DataType::Unknown,
            context: Bytes::new(),
            last_branch: Uuid::nil(),
            last_cseq: 0,
            nonce: Uuid::new_v4(),
            hashed_nonce: None,
            remote_invited: false,
            close_state: 1,
            settle_abort: None,
            pending_invite: None,
        }
    }
}

/// File-transfer invitation context.
///
/// The wire form is a fixed 574-byte little-endian prefix (header length,
/// format version, file size, type flags, a 520-byte NUL-padded UTF-16LE
/// file name and reserved bytes), optionally followed by raw preview bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileContext {
    /// Size of the offered file in bytes
    pub file_size: u64,
    /// File name shown to the receiving user
    pub file_name: String,
    /// Optional preview image bytes
    pub preview: Bytes,
}

impl FileContext {
    /// Creates a context with no preview.
    pub fn new(file_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            file_size,
            file_name: file_name.into(),
            preview: Bytes::new(),
        }
    }

    /// Serializes the context blob.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FILE_CONTEXT_SIZE + self.preview.len());
        buf.put_u32_le(FILE_CONTEXT_SIZE as u32);
        buf.put_u32_le(FILE_CONTEXT_VERSION);
        buf.put_u64_le(self.file_size);
        buf.put_u32_le(u32::from(self.preview.is_empty()));
        let mut units: Vec<u16> = self.file_name.encode_utf16().take(FILE_NAME_UNITS - 1).collect();
        units.resize(FILE_NAME_UNITS, 0);
        for unit in &units {
            buf.put_u16_le(*unit);
        }
        buf.put_bytes(0, FILE_CONTEXT_RESERVED);
        buf.extend_from_slice(&self.preview);
        buf.freeze()
    }

    /// Parses a context blob, keeping any trailing preview bytes.
    pub fn parse(mut bytes: Bytes) -> Result<Self, SessionError> {
        if bytes.len() < FILE_CONTEXT_SIZE {
            return Err(SessionError::Context(format!(
                "file context too short: {} bytes",
                bytes.len()
            )));
        }
        let header_len = bytes.get_u32_le() as usize;
        if header_len < FILE_CONTEXT_SIZE {
            return Err(SessionError::Context(format!(
                "file context header length {} below fixed prefix",
                header_len
            )));
        }
        let _version = bytes.get_u32_le();
        let file_size = bytes.get_u64_le();
        let _type_flags = bytes.get_u32_le();
        let name_raw = bytes.split_to(FILE_NAME_UNITS * 2);
        let mut units = Vec::with_capacity(FILE_NAME_UNITS);
        for pair in name_raw.chunks_exact(2) {
            let unit = u16::from_le_bytes([pair[0], pair[1]]);
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        let file_name = String::from_utf16(&units)
            .map_err(|_| SessionError::Context("file name is not valid UTF-16".into()))?;
        bytes.advance(FILE_CONTEXT_RESERVED);
        // A larger declared header carries extension fields before the preview
        let surplus = header_len - FILE_CONTEXT_SIZE;
        if surplus > bytes.len() {
            return Err(SessionError::Context(format!(
                "file context header length {} exceeds blob",
                header_len
            )));
        }
        bytes.advance(surplus);
        Ok(Self {
            file_size,
            file_name,
            preview: bytes,
        })
    }
}

/// Activity invitation context: `"<activity id>;1;<activity name>"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivityContext {
    /// Numeric activity / application id
    pub activity_id: u32,
    /// Display name of the activity
    pub activity_name: String,
}

impl ActivityContext {
    /// Serializes the context blob.
    pub fn encode(&self) -> Bytes {
        Bytes::from(format!("{};1;{}", self.activity_id, self.activity_name))
    }

    /// Parses a context blob.
    pub fn parse(bytes: &[u8]) -> Result<Self, SessionError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| SessionError::Context("activity context is not UTF-8".into()))?;
        let mut parts = text.splitn(3, ';');
        let id_field = parts
            .next()
            .ok_or_else(|| SessionError::Context("activity context is empty".into()))?;
        let activity_id = id_field
            .parse()
            .map_err(|_| SessionError::Context(format!("bad activity id {:?}", id_field)))?;
        let _marker = parts
            .next()
            .ok_or_else(|| SessionError::Context("activity context missing fields".into()))?;
        let activity_name = parts
            .next()
            .ok_or_else(|| SessionError::Context("activity context missing name".into()))?
            .trim_end_matches('\0')
            .to_string();
        Ok(Self {
            activity_id,
            activity_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_classification() {
        assert_eq!(DataType::from_invite(EUF_GUID_FILE, 2), DataType::File);
        assert_eq!(DataType::from_invite(EUF_GUID_USER_TILE, 12), DataType::UserTile);
        assert_eq!(DataType::from_invite(EUF_GUID_USER_TILE, 11), DataType::Emoticon);
        assert_eq!(DataType::from_invite(EUF_GUID_ACTIVITY, 0), DataType::Activity);
        assert_eq!(DataType::from_invite(Uuid::new_v4(), 2), DataType::Unknown);
    }

    #[test]
    fn test_data_type_footer_and_flags() {
        assert_eq!(DataType::File.footer(), 2);
        assert_eq!(DataType::UserTile.footer(), 12);
        assert_eq!(DataType::Emoticon.footer(), 11);
        assert_eq!(DataType::Activity.footer(), 0);
        assert_eq!(DataType::File.message_flags(), MessageFlags::FILE);
        assert_eq!(DataType::UserTile.message_flags(), MessageFlags::DATA);
        assert_eq!(DataType::Activity.message_flags(), MessageFlags::DATA);
        assert_eq!(DataType::File.transfer_flow(), TransferFlow::FILE);
        assert_eq!(DataType::Emoticon.transfer_flow(), TransferFlow::MSN_OBJECT);
        assert!(DataType::Activity.transfer_flow().is_empty());
    }

    #[test]
    fn test_transfer_properties_defaults() {
        let props = TransferProperties::new(Uuid::new_v4(), 77);
        assert_eq!(props.session_id, 77);
        assert_eq!(props.close_state, 1);
        assert!(!props.remote_invited);
        assert_ne!(props.nonce, Uuid::nil());
        assert!(props.hashed_nonce.is_none());
    }

    #[test]
    fn test_file_context_roundtrip() {
        let context = FileContext {
            file_size: 54_321,
            file_name: "holiday photos.zip".into(),
            preview: Bytes::from_static(b"\x89PNG"),
        };
        let encoded = context.encode();
        assert_eq!(encoded.len(), FILE_CONTEXT_SIZE + 4);
        assert_eq!(&encoded[..4], &574u32.to_le_bytes());
        assert_eq!(&encoded[4..8], &3u32.to_le_bytes());
        let parsed = FileContext::parse(encoded).unwrap();
        assert_eq!(parsed, context);
    }

    #[test]
    fn test_file_context_name_truncation() {
        let long = "x".repeat(400);
        let encoded = FileContext::new(long, 1).encode();
        assert_eq!(encoded.len(), FILE_CONTEXT_SIZE);
        let parsed = FileContext::parse(encoded).unwrap();
        assert_eq!(parsed.file_name.len(), FILE_NAME_UNITS - 1);
    }

    #[test]
    fn test_file_context_too_short() {
        let err = FileContext::parse(Bytes::from_static(b"short")).unwrap_err();
        assert!(matches!(err, SessionError::Context(_)));
    }

    #[test]
    fn test_file_context_extended_header_skipped() {
        let context = FileContext {
            file_size: 2048,
            file_name: "notes.txt".into(),
            preview: Bytes::from_static(b"\x89PNG"),
        };
        let encoded = context.encode();

        // Same blob with eight extension bytes declared as part of the header
        let mut extended = BytesMut::with_capacity(encoded.len() + 8);
        extended.extend_from_slice(&encoded[..FILE_CONTEXT_SIZE]);
        extended.extend_from_slice(&[0xAA; 8]);
        extended.extend_from_slice(&encoded[FILE_CONTEXT_SIZE..]);
        extended[..4].copy_from_slice(&(FILE_CONTEXT_SIZE as u32 + 8).to_le_bytes());

        let parsed = FileContext::parse(extended.freeze()).unwrap();
        assert_eq!(parsed, context);
    }

    #[test]
    fn test_file_context_header_past_blob_rejected() {
        let encoded = FileContext::new("a.txt", 1).encode();
        let mut oversized = BytesMut::from(&encoded[..]);
        oversized[..4].copy_from_slice(&700u32.to_le_bytes());

        let err = FileContext::parse(oversized.freeze()).unwrap_err();
        assert!(matches!(err, SessionError::Context(_)));
    }

    #[test]
    fn test_activity_context_roundtrip() {
        let context = ActivityContext {
            activity_id: 99991,
            activity_name: "Tic Tac Toe".into(),
        };
        let encoded = context.encode();
        assert_eq!(&encoded[..], b"99991;1;Tic Tac Toe");
        assert_eq!(ActivityContext::parse(&encoded).unwrap(), context);
    }

    #[test]
    fn test_activity_context_malformed() {
        assert!(ActivityContext::parse(b"not-a-number;1;x").is_err());
        assert!(ActivityContext::parse(b"42").is_err());
        assert!(ActivityContext::parse(&[0xff, 0xfe, 0x00]).is_err());
    }
}
