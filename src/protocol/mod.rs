use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

pub mod parser;

pub use parser::{FrameParser, ParsedFrame};

/// Kind byte plus big-endian length
pub const HEADER_LEN: usize = 5;

/// Message id that opens every file payload
pub const FILE_ID_LEN: usize = 16;

/// CRC32 trailer after a file frame, outside of its declared length
pub const CHECKSUM_LEN: usize = 4;

/// Upper bound for command and record payloads
pub const MAX_MESSAGE_LEN: u32 = 8 * 1024 * 1024;

/// Largest attachment a single file frame can describe
pub const MAX_FILE_CONTENT_LEN: u64 = u32::MAX as u64 - FILE_ID_LEN as u64;

/// Frame kind byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Command = 0x00,
    Record = 0x01,
    File = 0x02,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameKind::Command),
            0x01 => Ok(FrameKind::Record),
            0x02 => Ok(FrameKind::File),
            other => Err(ProtocolError::UnknownFrameKind(other)),
        }
    }
}

/// `[kind][length]` prefix shared by every frame.
///
/// For file frames `length` covers `identifier ‖ content` only; the 4-byte
/// checksum trailer follows the payload without being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub length: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.kind as u8;
        out[1..].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    /// Decode and bound-check a header
    pub fn decode(bytes: [u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        let kind = FrameKind::try_from(bytes[0])?;
        let length = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        match kind {
            FrameKind::Command | FrameKind::Record if length > MAX_MESSAGE_LEN => {
                Err(ProtocolError::MalformedFrame(format!(
                    "{kind:?} frame declares {length} bytes, limit is {MAX_MESSAGE_LEN}"
                )))
            }
            FrameKind::Record if length == 0 => Err(ProtocolError::MalformedFrame(
                "record frame without entity tag".to_string(),
            )),
            FrameKind::File if (length as usize) < FILE_ID_LEN => {
                Err(ProtocolError::MalformedFrame(format!(
                    "file frame declares {length} bytes, shorter than its identifier"
                )))
            }
            _ => Ok(Self { kind, length }),
        }
    }
}

/// Transferable entity types, in the order the sender walks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EntityType {
    Conversation = 0,
    Participant = 1,
    User = 2,
    App = 3,
    Asset = 4,
    Snapshot = 5,
    Sticker = 6,
    PinnedMessage = 7,
    TranscriptMessage = 8,
    Message = 9,
    MessageMention = 10,
    ExpiredMessage = 11,
}

impl EntityType {
    pub const ALL: [EntityType; 12] = [
        EntityType::Conversation,
        EntityType::Participant,
        EntityType::User,
        EntityType::App,
        EntityType::Asset,
        EntityType::Snapshot,
        EntityType::Sticker,
        EntityType::PinnedMessage,
        EntityType::TranscriptMessage,
        EntityType::Message,
        EntityType::MessageMention,
        EntityType::ExpiredMessage,
    ];

    /// Fields forming the natural key, in key order
    pub fn key_fields(self) -> &'static [&'static str] {
        match self {
            EntityType::Conversation => &["conversation_id"],
            EntityType::Participant => &["conversation_id", "user_id"],
            EntityType::User => &["user_id"],
            EntityType::App => &["app_id"],
            EntityType::Asset => &["asset_id"],
            EntityType::Snapshot => &["snapshot_id"],
            EntityType::Sticker => &["sticker_id"],
            EntityType::TranscriptMessage => &["transcript_id", "message_id"],
            EntityType::PinnedMessage
            | EntityType::Message
            | EntityType::MessageMention
            | EntityType::ExpiredMessage => &["message_id"],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EntityType::Conversation => "conversation",
            EntityType::Participant => "participant",
            EntityType::User => "user",
            EntityType::App => "app",
            EntityType::Asset => "asset",
            EntityType::Snapshot => "snapshot",
            EntityType::Sticker => "sticker",
            EntityType::PinnedMessage => "pinned_message",
            EntityType::TranscriptMessage => "transcript_message",
            EntityType::Message => "message",
            EntityType::MessageMention => "message_mention",
            EntityType::ExpiredMessage => "expired_message",
        }
    }
}

impl TryFrom<u8> for EntityType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        EntityType::ALL
            .get(value as usize)
            .copied()
            .ok_or(ProtocolError::UnknownEntity(value))
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Natural key of a record; composite keys are joined with `:`.
///
/// Ordering is the keyset pagination order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey(pub String);

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Control message actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Connect,
    Start,
    Progress,
    Finish,
}

/// Control message carried by a command frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

impl Command {
    fn bare(action: Action) -> Self {
        Self {
            action,
            user_id: None,
            code: None,
            platform: None,
            total: None,
            progress: None,
        }
    }

    pub fn connect(user_id: impl Into<String>, code: u32) -> Self {
        Self {
            user_id: Some(user_id.into()),
            code: Some(code),
            platform: Some(local_platform()),
            ..Self::bare(Action::Connect)
        }
    }

    pub fn start(total: u64) -> Self {
        Self {
            total: Some(total),
            platform: Some(local_platform()),
            ..Self::bare(Action::Start)
        }
    }

    pub fn progress(percent: u8) -> Self {
        Self {
            progress: Some(percent.min(100)),
            ..Self::bare(Action::Progress)
        }
    }

    pub fn finish() -> Self {
        Self::bare(Action::Finish)
    }

    /// Encode as a complete command frame
    pub fn to_frame(&self) -> Result<Bytes, ProtocolError> {
        let payload = serde_json::to_vec(self)?;
        Ok(frame(FrameKind::Command, &[], &payload))
    }

    /// Decode a command payload and check the fields its action requires
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        let command: Command = serde_json::from_slice(payload)
            .map_err(|e| ProtocolError::InvalidCommand(e.to_string()))?;
        command.validate()?;
        Ok(command)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        let missing = |field: &'static str| ProtocolError::MissingField {
            action: self.action,
            field,
        };
        match self.action {
            Action::Connect => {
                self.user_id.as_ref().ok_or_else(|| missing("user_id"))?;
                self.code.ok_or_else(|| missing("code"))?;
            }
            Action::Start => {
                self.total.ok_or_else(|| missing("total"))?;
            }
            Action::Progress => {
                let percent = self.progress.ok_or_else(|| missing("progress"))?;
                if percent > 100 {
                    return Err(ProtocolError::InvalidCommand(format!(
                        "progress {percent} is above 100"
                    )));
                }
            }
            Action::Finish => {}
        }
        Ok(())
    }
}

/// A serialized domain entity plus its type tag
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub entity: EntityType,
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(entity: EntityType, fields: Map<String, Value>) -> Self {
        Self { entity, fields }
    }

    /// Build from a JSON object; `None` for any other JSON value
    pub fn from_value(entity: EntityType, value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self::new(entity, fields)),
            _ => None,
        }
    }

    /// Natural key, or `None` when a key field is missing or not scalar
    pub fn key(&self) -> Option<RecordKey> {
        let mut parts = Vec::with_capacity(2);
        for field in self.entity.key_fields() {
            let part = match self.fields.get(*field)? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            parts.push(part);
        }
        Some(RecordKey(parts.join(":")))
    }

    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Encode as a complete record frame
    pub fn to_frame(&self) -> Result<Bytes, ProtocolError> {
        let body = serde_json::to_vec(&self.fields)?;
        if body.len() + 1 > MAX_MESSAGE_LEN as usize {
            return Err(ProtocolError::RecordTooLarge(body.len()));
        }
        Ok(frame(FrameKind::Record, &[self.entity as u8], &body))
    }

    /// Decode the entity fields that follow the tag byte
    pub fn from_body(entity: EntityType, body: &[u8]) -> Result<Self, serde_json::Error> {
        let fields: Map<String, Value> = serde_json::from_slice(body)?;
        Ok(Self::new(entity, fields))
    }
}

/// Header and identifier that open a file frame with `content_len` bytes
pub fn file_header(id: &Uuid, content_len: u64) -> Result<Bytes, ProtocolError> {
    if content_len > MAX_FILE_CONTENT_LEN {
        return Err(ProtocolError::FileTooLarge(content_len));
    }
    let header = FrameHeader {
        kind: FrameKind::File,
        length: (FILE_ID_LEN as u64 + content_len) as u32,
    };
    let mut out = BytesMut::with_capacity(HEADER_LEN + FILE_ID_LEN);
    out.put_slice(&header.encode());
    out.put_slice(id.as_bytes());
    Ok(out.freeze())
}

/// Checksum trailer that closes a file frame
pub fn file_trailer(checksum: u32) -> Bytes {
    Bytes::copy_from_slice(&checksum.to_be_bytes())
}

fn frame(kind: FrameKind, prefix: &[u8], body: &[u8]) -> Bytes {
    let length = (prefix.len() + body.len()) as u32;
    let mut out = BytesMut::with_capacity(HEADER_LEN + length as usize);
    out.put_slice(&FrameHeader { kind, length }.encode());
    out.put_slice(prefix);
    out.put_slice(body);
    out.freeze()
}

fn local_platform() -> String {
    std::env::consts::OS.to_string()
}

/// Errors that arise when producing or interpreting frames
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownFrameKind(u8),

    #[error("unknown entity type: {0}")]
    UnknownEntity(u8),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("{action:?} command without {field}")]
    MissingField { action: Action, field: &'static str },

    #[error("unexpected {0:?} command")]
    UnexpectedCommand(Action),

    #[error("unexpected {0:?} frame")]
    UnexpectedFrame(FrameKind),

    #[error("record of {0} bytes exceeds the frame limit")]
    RecordTooLarge(usize),

    #[error("file of {0} bytes exceeds the frame limit")]
    FileTooLarge(u64),

    #[error("serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
}
