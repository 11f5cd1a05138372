use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{AttachmentCategory, RecordSink, RecordSource, StoreError, TransferFilter};
use crate::protocol::{EntityType, Record, RecordKey};

const RECORDS_DIR: &str = "records";
const ATTACHMENTS_DIR: &str = "attachments";

#[derive(Default)]
struct Tables {
    records: BTreeMap<EntityType, BTreeMap<RecordKey, Record>>,
    dirty: BTreeSet<EntityType>,
}

impl Tables {
    fn message(&self, id: &Uuid) -> Option<&Record> {
        let messages = self.records.get(&EntityType::Message)?;
        // Ids may have been stored in either case
        messages
            .get(&RecordKey(id.hyphenated().to_string()))
            .or_else(|| {
                let upper = id.hyphenated().encode_upper(&mut Uuid::encode_buffer()).to_string();
                messages.get(&RecordKey(upper))
            })
    }

    fn message_by_str(&self, id: &str) -> Option<&Record> {
        match Uuid::parse_str(id) {
            Ok(id) => self.message(&id),
            Err(_) => self
                .records
                .get(&EntityType::Message)?
                .get(&RecordKey(id.to_string())),
        }
    }

    /// Transcript messages whose own message id is `id`
    fn transcripts<'a>(&'a self, id: &'a Uuid) -> impl Iterator<Item = &'a Record> + 'a {
        self.records
            .get(&EntityType::TranscriptMessage)
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter(move |record| {
                record
                    .str_field("message_id")
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .is_some_and(|found| found == *id)
            })
    }

    /// A transcript message travels with its parent `*_TRANSCRIPT` message
    fn transcript_in_scope(&self, record: &Record, filter: &TransferFilter) -> bool {
        record
            .str_field("transcript_id")
            .and_then(|id| self.message_by_str(id))
            .is_some_and(|parent| {
                parent
                    .str_field("category")
                    .is_some_and(|category| category.ends_with("_TRANSCRIPT"))
                    && filter.matches(parent)
            })
    }

    fn in_scope(&self, record: &Record, filter: &TransferFilter) -> bool {
        if filter.is_passthrough() {
            return true;
        }
        match record.entity {
            EntityType::TranscriptMessage => self.transcript_in_scope(record, filter),
            _ => filter.matches(record),
        }
    }
}

/// Account data kept as plain files.
///
/// ```text
/// <root>/records/<entity>.json         JSON array of entity objects
/// <root>/attachments/<Category>/<id>.<ext>
/// <root>/attachments/Transcript/<transcript_id>/<id>.<ext>
/// ```
///
/// Records live in memory once opened; `flush` writes changed tables back.
pub struct DirStore {
    root: PathBuf,
    tables: Mutex<Tables>,
}

impl DirStore {
    /// Open or create a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(root.join(RECORDS_DIR))?;
        for category in AttachmentCategory::ALL {
            std::fs::create_dir_all(root.join(ATTACHMENTS_DIR).join(category.dir_name()))?;
        }

        let mut tables = Tables::default();
        for entity in EntityType::ALL {
            let path = table_path(&root, entity);
            if !path.exists() {
                continue;
            }
            let rows: Vec<Value> = serde_json::from_slice(&std::fs::read(&path)?)?;
            let table = tables.records.entry(entity).or_default();
            for row in rows {
                let record = Record::from_value(entity, row).ok_or_else(|| StoreError::Corrupt {
                    path: path.display().to_string(),
                    reason: "row is not an object".to_string(),
                })?;
                let key = record.key().ok_or(StoreError::MissingKey(entity))?;
                table.insert(key, record);
            }
            tracing::debug!(%entity, count = table.len(), "loaded table");
        }

        Ok(Self {
            root,
            tables: Mutex::new(tables),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn attachments_dir(&self, category: AttachmentCategory) -> PathBuf {
        self.root.join(ATTACHMENTS_DIR).join(category.dir_name())
    }

    /// Delete a record, returning it if present
    pub fn remove(&self, entity: EntityType, key: &RecordKey) -> Option<Record> {
        let mut tables = self.tables();
        let removed = tables.records.get_mut(&entity)?.remove(key);
        if removed.is_some() {
            tables.dirty.insert(entity);
        }
        removed
    }

    /// All records of one type in key order
    pub fn records(&self, entity: EntityType) -> Vec<Record> {
        self.tables()
            .records
            .get(&entity)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, entity: EntityType) -> usize {
        self.tables().records.get(&entity).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.tables().records.values().all(BTreeMap::is_empty)
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn table_path(root: &Path, entity: EntityType) -> PathBuf {
    root.join(RECORDS_DIR).join(format!("{}.json", entity.name()))
}

/// `<id>.<ext>`, taking the extension from `media_url` when it has one
fn attachment_file_name(record: &Record, id: &Uuid) -> String {
    let extension = record
        .str_field("media_url")
        .and_then(|url| Path::new(url).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty());
    match extension {
        Some(ext) => format!("{}.{ext}", id.hyphenated()),
        None => id.hyphenated().to_string(),
    }
}

/// Whether `name` can be used as a single directory name under the store
fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

impl RecordSource for DirStore {
    fn count(&self, entity: EntityType, filter: &TransferFilter) -> Result<u64, StoreError> {
        let tables = self.tables();
        let Some(table) = tables.records.get(&entity) else {
            return Ok(0);
        };
        if filter.is_passthrough() {
            return Ok(table.len() as u64);
        }
        Ok(table
            .values()
            .filter(|record| tables.in_scope(record, filter))
            .count() as u64)
    }

    fn page(
        &self,
        entity: EntityType,
        filter: &TransferFilter,
        after: Option<&RecordKey>,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let tables = self.tables();
        let Some(table) = tables.records.get(&entity) else {
            return Ok(Vec::new());
        };
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        Ok(table
            .range::<RecordKey, _>((lower, Bound::Unbounded))
            .map(|(_, record)| record)
            .filter(|record| tables.in_scope(record, filter))
            .take(limit)
            .cloned()
            .collect())
    }

    fn record_exists(&self, id: &Uuid) -> Result<bool, StoreError> {
        let tables = self.tables();
        Ok(tables.message(id).is_some() || tables.transcripts(id).next().is_some())
    }

    fn attachment_in_scope(&self, id: &Uuid, filter: &TransferFilter) -> Result<bool, StoreError> {
        let tables = self.tables();
        let by_message = tables
            .message(id)
            .is_some_and(|message| tables.in_scope(message, filter));
        Ok(by_message
            || tables
                .transcripts(id)
                .any(|transcript| tables.in_scope(transcript, filter)))
    }

    fn attachment_roots(&self) -> Vec<(AttachmentCategory, PathBuf)> {
        AttachmentCategory::ALL
            .iter()
            .map(|category| (*category, self.attachments_dir(*category)))
            .collect()
    }
}

impl RecordSink for DirStore {
    fn upsert(&self, record: Record) -> Result<(), StoreError> {
        let key = record.key().ok_or(StoreError::MissingKey(record.entity))?;
        let entity = record.entity;
        let mut tables = self.tables();
        tables.records.entry(entity).or_default().insert(key, record);
        tables.dirty.insert(entity);
        Ok(())
    }

    fn attachment_destinations(&self, id: &Uuid) -> Result<Vec<PathBuf>, StoreError> {
        let tables = self.tables();
        let mut destinations = Vec::new();
        if let Some(message) = tables.message(id) {
            let category = message
                .str_field("category")
                .and_then(AttachmentCategory::for_message_category);
            if let Some(category) = category {
                destinations.push(
                    self.attachments_dir(category)
                        .join(attachment_file_name(message, id)),
                );
            }
        }
        for transcript in tables.transcripts(id) {
            let Some(transcript_id) = transcript.str_field("transcript_id") else {
                continue;
            };
            if !is_plain_name(transcript_id) {
                tracing::warn!(file_id = %id, transcript_id, "refusing unsafe transcript directory");
                continue;
            }
            let path = self
                .attachments_dir(AttachmentCategory::Transcript)
                .join(transcript_id)
                .join(attachment_file_name(transcript, id));
            if !destinations.contains(&path) {
                destinations.push(path);
            }
        }
        Ok(destinations)
    }

    fn flush(&self) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let dirty = std::mem::take(&mut tables.dirty);
        for entity in dirty {
            let rows: Vec<&serde_json::Map<String, Value>> = tables
                .records
                .get(&entity)
                .map(|table| table.values().map(|record| &record.fields).collect())
                .unwrap_or_default();
            let path = table_path(&self.root, entity);
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_vec(&rows)?)?;
            std::fs::rename(&tmp, &path)?;
            tracing::debug!(%entity, count = rows.len(), "table written");
        }
        Ok(())
    }
}
