//! Session-description (SLP) text codec.
//!
//! SLP messages negotiate transfers before any bulk data flows. They look
//! like a compact SIP dialect:
//!
//! ```text
//! INVITE MSNMSGR:bob@example.com MSNSLP/1.0
//! To: <msnmsgr:bob@example.com>
//! From: <msnmsgr:alice@example.com>
//! Via: MSNSLP/1.0/TLP ;branch={8B55E672-5B91-4D37-B905-7D18F8C7AF92}
//! CSeq: 0
//! Call-ID: {B4A55B13-9C23-4264-AF77-3A0CE9A761F2}
//! Max-Forwards: 0
//! Content-Type: application/x-msnmsgr-sessionreqbody
//! Content-Length: ...
//!
//! EUF-GUID: {5D3E02AB-6190-11D3-BBBB-00C04F795683}
//! SessionID: 1705062
//! AppID: 2
//! Context: <base64>
//! ```
//!
//! Lines are CRLF-separated and the body ends with `\r\n\0`; `Content-Length`
//! counts the body bytes including that terminator.

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

/// SLP protocol version token
pub const SLP_VERSION: &str = "MSNSLP/1.0";

/// Request method opening a negotiation
pub const METHOD_INVITE: &str = "INVITE";

/// Request method closing a session
pub const METHOD_BYE: &str = "BYE";

/// Status accepting an invitation
pub const STATUS_OK: u16 = 200;

/// Status declining an invitation
pub const STATUS_DECLINE: u16 = 603;

/// Status rejecting an unintelligible invitation
pub const STATUS_INTERNAL_ERROR: u16 = 500;

/// EUF-GUID identifying a file-transfer invitation
pub const EUF_GUID_FILE: Uuid = Uuid::from_u128(0x5D3E02AB_6190_11D3_BBBB_00C04F795683);

/// EUF-GUID identifying a user-tile (display image) invitation
pub const EUF_GUID_USER_TILE: Uuid = Uuid::from_u128(0xA4268EEC_FEC5_49E5_95C3_F126696BDBF6);

/// EUF-GUID identifying an activity invitation
pub const EUF_GUID_ACTIVITY: Uuid = Uuid::from_u128(0x6A13AF9C_5308_4F35_923A_67E8DDA40C2F);

/// SLP text parse errors
#[derive(Error, Debug)]
pub enum SlpError {
    /// Message is not UTF-8 text
    #[error("not utf-8 text")]
    Encoding,

    /// Start line does not match either grammar
    #[error("malformed start line: {0}")]
    StartLine(String),

    /// A required head header is absent
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    /// A head or body line is not `Key: Value`
    #[error("malformed header line: {0}")]
    HeaderLine(String),

    /// A GUID field failed to parse
    #[error("malformed guid: {0}")]
    Guid(String),

    /// A numeric field failed to parse
    #[error("malformed numeric field: {0}")]
    Number(String),
}

/// Body content types carried by session-description messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlpContentType {
    /// `application/x-msnmsgr-sessionreqbody`
    SessionReq,
    /// `application/x-msnmsgr-transreqbody`
    TransReq,
    /// `application/x-msnmsgr-transrespbody`
    TransResp,
    /// `application/x-msnmsgr-sessionclosebody`
    SessionClose,
    /// Anything else, preserved verbatim
    Other(String),
}

impl SlpContentType {
    /// The MIME-style string for this content type
    pub fn as_str(&self) -> &str {
        match self {
            SlpContentType::SessionReq => "application/x-msnmsgr-sessionreqbody",
            SlpContentType::TransReq => "application/x-msnmsgr-transreqbody",
            SlpContentType::TransResp => "application/x-msnmsgr-transrespbody",
            SlpContentType::SessionClose => "application/x-msnmsgr-sessionclosebody",
            SlpContentType::Other(s) => s,
        }
    }

    fn from_value(value: &str) -> Self {
        match value {
            "application/x-msnmsgr-sessionreqbody" => SlpContentType::SessionReq,
            "application/x-msnmsgr-transreqbody" => SlpContentType::TransReq,
            "application/x-msnmsgr-transrespbody" => SlpContentType::TransResp,
            "application/x-msnmsgr-sessionclosebody" => SlpContentType::SessionClose,
            other => SlpContentType::Other(other.to_string()),
        }
    }
}

/// Start line of an SLP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlpStartLine {
    /// `METHOD uri MSNSLP/1.0`
    Request {
        /// Request method (INVITE, BYE)
        method: String,
        /// Request URI (`MSNMSGR:<passport>`)
        uri: String,
    },
    /// `MSNSLP/1.0 code reason`
    Status {
        /// Numeric status code
        code: u16,
        /// Human-readable reason phrase
        reason: String,
    },
}

/// A parsed or under-construction session-description message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlpMessage {
    /// Request or status start line
    pub start: SlpStartLine,
    /// `To` header value as it appears on the wire
    pub to: String,
    /// `From` header value as it appears on the wire
    pub from: String,
    /// Branch token from the `Via` header
    pub branch: Uuid,
    /// `CSeq` sequence number
    pub cseq: u32,
    /// `Call-ID` correlating one negotiation
    pub call_id: Uuid,
    /// `Max-Forwards` hop limit
    pub max_forwards: u32,
    /// Body content type
    pub content_type: SlpContentType,
    /// Ordered body key/value fields
    pub fields: Vec<(String, String)>,
}

impl SlpMessage {
    /// Build a request with fresh branch and call id
    pub fn request(method: &str, to: &str, from: &str, content_type: SlpContentType) -> Self {
        Self {
            start: SlpStartLine::Request {
                method: method.to_string(),
                uri: format!("MSNMSGR:{to}"),
            },
            to: format!("<msnmsgr:{to}>"),
            from: format!("<msnmsgr:{from}>"),
            branch: Uuid::new_v4(),
            cseq: 0,
            call_id: Uuid::new_v4(),
            max_forwards: 0,
            content_type,
            fields: Vec::new(),
        }
    }

    /// Build a status reply to this message.
    ///
    /// Swaps the endpoints, keeps the branch and call id, and bumps `CSeq`.
    pub fn reply(&self, code: u16, reason: &str, content_type: SlpContentType) -> Self {
        Self {
            start: SlpStartLine::Status {
                code,
                reason: reason.to_string(),
            },
            to: self.from.clone(),
            from: self.to.clone(),
            branch: self.branch,
            cseq: self.cseq + 1,
            call_id: self.call_id,
            max_forwards: 0,
            content_type,
            fields: Vec::new(),
        }
    }

    /// True when the start line is a request for `method`
    pub fn is_request(&self, method: &str) -> bool {
        matches!(&self.start, SlpStartLine::Request { method: m, .. } if m == method)
    }

    /// Status code, when the start line is a status
    pub fn status_code(&self) -> Option<u16> {
        match &self.start {
            SlpStartLine::Status { code, .. } => Some(*code),
            SlpStartLine::Request { .. } => None,
        }
    }

    /// Look up a body field by exact key
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a body field, replacing an existing entry with the same key
    pub fn set_field(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self.fields.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.fields.push((key.to_string(), value));
        }
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut body = String::new();
        for (key, value) in &self.fields {
            body.push_str(key);
            body.push_str(": ");
            body.push_str(value);
            body.push_str("\r\n");
        }
        body.push_str("\r\n\0");

        let start = match &self.start {
            SlpStartLine::Request { method, uri } => format!("{method} {uri} {SLP_VERSION}"),
            SlpStartLine::Status { code, reason } => format!("{SLP_VERSION} {code} {reason}"),
        };

        let mut text = String::with_capacity(start.len() + body.len() + 256);
        text.push_str(&start);
        text.push_str("\r\n");
        text.push_str(&format!("To: {}\r\n", self.to));
        text.push_str(&format!("From: {}\r\n", self.from));
        text.push_str(&format!(
            "Via: MSNSLP/1.0/TLP ;branch={}\r\n",
            format_guid(self.branch)
        ));
        text.push_str(&format!("CSeq: {}\r\n", self.cseq));
        text.push_str(&format!("Call-ID: {}\r\n", format_guid(self.call_id)));
        text.push_str(&format!("Max-Forwards: {}\r\n", self.max_forwards));
        text.push_str(&format!("Content-Type: {}\r\n", self.content_type.as_str()));
        text.push_str(&format!("Content-Length: {}\r\n", body.len()));
        text.push_str("\r\n");
        text.push_str(&body);

        Bytes::from(text)
    }

    /// Parse wire bytes into a message
    pub fn parse(bytes: &[u8]) -> Result<Self, SlpError> {
        let text = std::str::from_utf8(bytes).map_err(|_| SlpError::Encoding)?;
        let (head, body) = text
            .split_once("\r\n\r\n")
            .ok_or_else(|| SlpError::StartLine(first_line(text)))?;

        let mut lines = head.split("\r\n");
        let start_line = lines.next().unwrap_or_default();
        let start = parse_start_line(start_line)?;

        let mut to = None;
        let mut from = None;
        let mut branch = None;
        let mut cseq = 0;
        let mut call_id = None;
        let mut max_forwards = 0;
        let mut content_type = None;

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| SlpError::HeaderLine(line.to_string()))?;
            let value = value.trim();
            match key {
                "To" => to = Some(value.to_string()),
                "From" => from = Some(value.to_string()),
                "Via" => branch = Some(parse_branch(value)?),
                "CSeq" => {
                    cseq = value
                        .parse()
                        .map_err(|_| SlpError::Number(value.to_string()))?;
                }
                "Call-ID" => call_id = Some(parse_guid(value)?),
                "Max-Forwards" => {
                    max_forwards = value
                        .parse()
                        .map_err(|_| SlpError::Number(value.to_string()))?;
                }
                "Content-Type" => content_type = Some(SlpContentType::from_value(value)),
                // Content-Length and unknown headers are recomputed/ignored
                _ => {}
            }
        }

        let fields = parse_body(body)?;

        Ok(Self {
            start,
            to: to.ok_or(SlpError::MissingHeader("To"))?,
            from: from.ok_or(SlpError::MissingHeader("From"))?,
            branch: branch.ok_or(SlpError::MissingHeader("Via"))?,
            cseq,
            call_id: call_id.ok_or(SlpError::MissingHeader("Call-ID"))?,
            max_forwards,
            content_type: content_type.ok_or(SlpError::MissingHeader("Content-Type"))?,
            fields,
        })
    }
}

/// Format a GUID the way SLP carries them: braced, uppercase
pub fn format_guid(guid: Uuid) -> String {
    format!("{{{}}}", guid.hyphenated().to_string().to_uppercase())
}

/// Parse a braced or bare GUID field
pub fn parse_guid(value: &str) -> Result<Uuid, SlpError> {
    let trimmed = value.trim().trim_start_matches('{').trim_end_matches('}');
    Uuid::parse_str(trimmed).map_err(|_| SlpError::Guid(value.to_string()))
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().to_string()
}

fn parse_start_line(line: &str) -> Result<SlpStartLine, SlpError> {
    if let Some(rest) = line.strip_prefix(SLP_VERSION) {
        let rest = rest.trim_start();
        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        let code = code
            .parse()
            .map_err(|_| SlpError::StartLine(line.to_string()))?;
        return Ok(SlpStartLine::Status {
            code,
            reason: reason.trim().to_string(),
        });
    }

    let mut parts = line.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(uri), Some(version)) if version == SLP_VERSION => {
            Ok(SlpStartLine::Request {
                method: method.to_string(),
                uri: uri.to_string(),
            })
        }
        _ => Err(SlpError::StartLine(line.to_string())),
    }
}

fn parse_branch(via: &str) -> Result<Uuid, SlpError> {
    let after = via
        .split("branch=")
        .nth(1)
        .ok_or_else(|| SlpError::Guid(via.to_string()))?;
    let token = after.split(';').next().unwrap_or(after).trim();
    parse_guid(token)
}

fn parse_body(body: &str) -> Result<Vec<(String, String)>, SlpError> {
    let trimmed = body.trim_end_matches('\0');
    let mut fields = Vec::new();
    for line in trimmed.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| SlpError::HeaderLine(line.to_string()))?;
        fields.push((key.to_string(), value.trim().to_string()));
    }
    Ok(fields)
}
