//! Collaborators standing in for the application's relational store.
//!
//! The transfer engines only see these traits; [`dir::DirStore`] is a
//! directory-backed implementation used by the CLI and the tests.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::SystemTime;
use uuid::Uuid;

use crate::protocol::{EntityType, Record, RecordKey};

pub mod dir;

pub use dir::DirStore;

/// Read side used by the sending engine.
///
/// Methods block; engines call them off the async executor.
pub trait RecordSource: Send + Sync {
    /// Number of records of one entity type that pass `filter`
    fn count(&self, entity: EntityType, filter: &TransferFilter) -> Result<u64, StoreError>;

    /// Up to `limit` records passing `filter` with a natural key strictly
    /// greater than `after`, in ascending key order
    fn page(
        &self,
        entity: EntityType,
        filter: &TransferFilter,
        after: Option<&RecordKey>,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError>;

    /// Whether a message or transcript message with this id exists
    fn record_exists(&self, id: &Uuid) -> Result<bool, StoreError>;

    /// Whether the attachment of message `id` belongs to a record that
    /// passes `filter`
    fn attachment_in_scope(&self, id: &Uuid, filter: &TransferFilter) -> Result<bool, StoreError>;

    /// Attachment directories to enumerate, in send order
    fn attachment_roots(&self) -> Vec<(AttachmentCategory, PathBuf)>;
}

/// Write side used by the receiving engine
pub trait RecordSink: Send + Sync {
    /// Insert or replace by natural key
    fn upsert(&self, record: Record) -> Result<(), StoreError>;

    /// Every path the attachment of message `id` should be stored at, one
    /// per owning record. Empty when no owner has been received.
    fn attachment_destinations(&self, id: &Uuid) -> Result<Vec<PathBuf>, StoreError>;

    fn flush(&self) -> Result<(), StoreError>;
}

/// Narrows a transfer to some conversations and to messages created at or
/// after a point in time.
///
/// The default filter lets everything through. Under any other filter,
/// transcript messages travel only with a `*_TRANSCRIPT` message that passes,
/// and attachments only with a record that passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferFilter {
    pub conversations: Option<BTreeSet<String>>,
    pub earliest_created_at: Option<SystemTime>,
}

impl TransferFilter {
    pub fn is_passthrough(&self) -> bool {
        self.conversations.is_none() && self.earliest_created_at.is_none()
    }

    /// Whether `record` passes on its own fields.
    ///
    /// Transcript messages depend on their parent message, which only the
    /// store can look up; they always pass here.
    pub fn matches(&self, record: &Record) -> bool {
        match record.entity {
            EntityType::Conversation | EntityType::Participant | EntityType::MessageMention => {
                self.conversation_matches(record)
            }
            EntityType::PinnedMessage | EntityType::Message => {
                self.conversation_matches(record) && self.created_at_matches(record)
            }
            _ => true,
        }
    }

    fn conversation_matches(&self, record: &Record) -> bool {
        match &self.conversations {
            Some(ids) => record
                .str_field("conversation_id")
                .is_some_and(|id| ids.contains(id)),
            None => true,
        }
    }

    // Timestamps that do not parse are kept
    fn created_at_matches(&self, record: &Record) -> bool {
        let Some(floor) = self.earliest_created_at else {
            return true;
        };
        match record
            .str_field("created_at")
            .map(humantime::parse_rfc3339_weak)
        {
            Some(Ok(created_at)) => created_at >= floor,
            _ => true,
        }
    }
}

/// Attachment directory kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentCategory {
    Photos,
    Files,
    Videos,
    Audios,
    Transcript,
}

impl AttachmentCategory {
    pub const ALL: [AttachmentCategory; 5] = [
        AttachmentCategory::Photos,
        AttachmentCategory::Files,
        AttachmentCategory::Videos,
        AttachmentCategory::Audios,
        AttachmentCategory::Transcript,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            AttachmentCategory::Photos => "Photos",
            AttachmentCategory::Files => "Files",
            AttachmentCategory::Videos => "Videos",
            AttachmentCategory::Audios => "Audios",
            AttachmentCategory::Transcript => "Transcript",
        }
    }

    /// Directory for a message category such as `SIGNAL_IMAGE`
    pub fn for_message_category(category: &str) -> Option<Self> {
        if category.ends_with("_IMAGE") {
            Some(AttachmentCategory::Photos)
        } else if category.ends_with("_DATA") {
            Some(AttachmentCategory::Files)
        } else if category.ends_with("_VIDEO") {
            Some(AttachmentCategory::Videos)
        } else if category.ends_with("_AUDIO") {
            Some(AttachmentCategory::Audios)
        } else {
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store data is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} record is missing its key fields")]
    MissingKey(EntityType),

    #[error("{path}: {reason}")]
    Corrupt { path: String, reason: String },
}
