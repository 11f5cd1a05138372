use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;
use walkdir::WalkDir;

use super::{blocking, is_partial, FileChunker, SendPermit, TransferError};
use crate::config::TransferConfig;
use crate::network::Outbound;
use crate::protocol::{
    file_header, file_trailer, Command, EntityType, ProtocolError, Record, RecordKey,
    MAX_FILE_CONTENT_LEN,
};
use crate::store::{AttachmentCategory, RecordSource, StoreError, TransferFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderPhase {
    Idle,
    Counting,
    SendingStart,
    SendingRecords,
    SendingFiles,
    SendingFinish,
    Done,
}

/// Reported to whoever drives the engine
#[derive(Debug, Clone, PartialEq)]
pub enum SenderEvent {
    Phase(SenderPhase),
    Counted { total: u64 },
    SlowConsumer { waited: Duration },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendSummary {
    pub records: BTreeMap<EntityType, u64>,
    pub skipped_records: u64,
    pub files: u64,
    pub skipped_files: u64,
    pub orphans_deleted: u64,
}

impl SendSummary {
    pub fn total_records(&self) -> u64 {
        self.records.values().sum()
    }
}

/// A candidate attachment found on disk
#[derive(Debug, Clone)]
struct Attachment {
    category: AttachmentCategory,
    path: PathBuf,
    /// `None` when the file stem is not a message id
    id: Option<Uuid>,
}

/// Source-side producer: counts, then streams every record page and every
/// attachment, then `finish`.
pub struct SendingEngine {
    source: Arc<dyn RecordSource>,
    outbound: Arc<dyn Outbound>,
    page_size: usize,
    chunk_size: usize,
    permit: SendPermit,
    filter: TransferFilter,
    events: Option<mpsc::UnboundedSender<SenderEvent>>,
}

impl SendingEngine {
    pub fn new(
        source: Arc<dyn RecordSource>,
        outbound: Arc<dyn Outbound>,
        config: &TransferConfig,
    ) -> Self {
        Self {
            source,
            outbound,
            page_size: config.page_size,
            chunk_size: config.chunk_size,
            permit: SendPermit::new(config.slow_consumer_after),
            filter: TransferFilter::default(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SenderEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Send only what `filter` lets through
    pub fn with_filter(mut self, filter: TransferFilter) -> Self {
        self.filter = filter;
        self
    }

    pub async fn run(self) -> Result<SendSummary, TransferError> {
        let mut summary = SendSummary::default();

        self.enter(SenderPhase::Counting);
        if !self.filter.is_passthrough() {
            tracing::info!(filter = ?self.filter, "sending a filtered selection");
        }
        let attachments = self.enumerate_attachments().await?;
        let total = self.count_records().await? + attachments.len() as u64;
        tracing::info!(total, files = attachments.len(), "counted transferable items");
        self.emit(SenderEvent::Counted { total });

        self.enter(SenderPhase::SendingStart);
        self.submit(Command::start(total).to_frame()?).await?;

        self.enter(SenderPhase::SendingRecords);
        for entity in EntityType::ALL {
            self.send_entity(entity, &mut summary).await?;
        }

        self.enter(SenderPhase::SendingFiles);
        for attachment in attachments {
            self.send_attachment(attachment, &mut summary).await?;
        }

        self.enter(SenderPhase::SendingFinish);
        self.submit(Command::finish().to_frame()?).await?;

        self.enter(SenderPhase::Done);
        tracing::info!(
            records = summary.total_records(),
            skipped_records = summary.skipped_records,
            files = summary.files,
            skipped_files = summary.skipped_files,
            orphans_deleted = summary.orphans_deleted,
            "all data sent"
        );
        Ok(summary)
    }

    fn enter(&self, phase: SenderPhase) {
        tracing::debug!(?phase, "sender phase");
        self.emit(SenderEvent::Phase(phase));
    }

    fn emit(&self, event: SenderEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    async fn submit(&self, data: Bytes) -> Result<(), TransferError> {
        let events = self.events.clone();
        self.permit
            .submit(&*self.outbound, data, move |waited| {
                if let Some(events) = &events {
                    let _ = events.send(SenderEvent::SlowConsumer { waited });
                }
            })
            .await?;
        Ok(())
    }

    async fn count_records(&self) -> Result<u64, TransferError> {
        let source = self.source.clone();
        let filter = self.filter.clone();
        blocking(move || {
            let mut total = 0;
            for entity in EntityType::ALL {
                let count = source.count(entity, &filter)?;
                tracing::debug!(%entity, count, "counted records");
                total += count;
            }
            Ok(total)
        })
        .await
    }

    async fn fetch_page(
        &self,
        entity: EntityType,
        after: Option<RecordKey>,
    ) -> Result<Vec<Record>, TransferError> {
        let source = self.source.clone();
        let filter = self.filter.clone();
        let limit = self.page_size;
        blocking(move || source.page(entity, &filter, after.as_ref(), limit)).await
    }

    async fn send_entity(
        &self,
        entity: EntityType,
        summary: &mut SendSummary,
    ) -> Result<(), TransferError> {
        let mut after: Option<RecordKey> = None;
        let mut sent = 0u64;
        loop {
            let page = self.fetch_page(entity, after.take()).await?;
            let full = page.len() == self.page_size;

            for record in &page {
                match record.to_frame() {
                    Ok(frame) => {
                        self.submit(frame).await?;
                        sent += 1;
                    }
                    Err(ProtocolError::RecordTooLarge(len)) => {
                        tracing::warn!(%entity, key = ?record.key(), len, "skipping oversized record");
                        summary.skipped_records += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if !full {
                break;
            }
            let last = page.last().and_then(Record::key);
            after = Some(last.ok_or(StoreError::MissingKey(entity))?);
        }

        if sent > 0 {
            tracing::info!(%entity, count = sent, "sent records");
        }
        summary.records.insert(entity, sent);
        Ok(())
    }

    /// Attachments on disk; under a filter, only those whose owner passes it
    async fn enumerate_attachments(&self) -> Result<Vec<Attachment>, TransferError> {
        let source = self.source.clone();
        let filter = self.filter.clone();
        blocking(move || {
            let found = enumerate(&source.attachment_roots());
            if filter.is_passthrough() {
                return Ok(found);
            }
            let mut scoped = Vec::new();
            for attachment in found {
                if let Some(id) = attachment.id {
                    if source.attachment_in_scope(&id, &filter)? {
                        scoped.push(attachment);
                    }
                }
            }
            Ok(scoped)
        })
        .await
    }

    async fn send_attachment(
        &self,
        attachment: Attachment,
        summary: &mut SendSummary,
    ) -> Result<(), TransferError> {
        let owner = match attachment.id {
            Some(id) => {
                let source = self.source.clone();
                blocking(move || source.record_exists(&id))
                    .await?
                    .then_some(id)
            }
            None => None,
        };
        let Some(id) = owner else {
            delete_orphan(&attachment.path).await;
            summary.orphans_deleted += 1;
            return Ok(());
        };

        let mut chunker = match FileChunker::open(&attachment.path, &id, self.chunk_size).await {
            Ok(chunker) => chunker,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %attachment.path.display(), "attachment vanished before sending");
                summary.skipped_files += 1;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let size = chunker.total_size();
        if size > MAX_FILE_CONTENT_LEN {
            tracing::warn!(path = %attachment.path.display(), size, "skipping oversized attachment");
            summary.skipped_files += 1;
            return Ok(());
        }

        self.submit(file_header(&id, size)?).await?;
        while let Some(chunk) = chunker.next_chunk().await? {
            self.submit(chunk).await?;
        }
        self.submit(file_trailer(chunker.finish())).await?;

        tracing::debug!(file_id = %id, category = ?attachment.category, size, "sent attachment");
        summary.files += 1;
        Ok(())
    }
}

fn enumerate(roots: &[(AttachmentCategory, PathBuf)]) -> Vec<Attachment> {
    let mut found = Vec::new();
    for (category, root) in roots {
        if !root.is_dir() {
            continue;
        }
        // Transcript attachments sit one directory deeper
        let depth = match category {
            AttachmentCategory::Transcript => 2,
            _ => 1,
        };
        let entries = WalkDir::new(root)
            .min_depth(1)
            .max_depth(depth)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable attachment entry");
                    None
                }
            });

        for entry in entries {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            if is_partial(&path) || is_video_thumbnail(*category, &path) {
                continue;
            }
            let id = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| Uuid::parse_str(stem).ok());
            found.push(Attachment {
                category: *category,
                path,
                id,
            });
        }
    }
    found
}

fn is_video_thumbnail(category: AttachmentCategory, path: &Path) -> bool {
    category == AttachmentCategory::Videos
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jpeg"))
}

async fn delete_orphan(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::info!(path = %path.display(), "deleted orphan attachment"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to delete orphan attachment"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksum;
    use crate::protocol::{Action, FrameKind, FrameParser, ParsedFrame};
    use crate::store::DirStore;
    use crate::store::RecordSink;
    use crate::transfer::flow::testing::RecordingOutbound;
    use crate::transfer::ReceivingEngine;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(page_size: usize, chunk_size: usize) -> TransferConfig {
        TransferConfig {
            page_size,
            chunk_size,
            ..TransferConfig::default()
        }
    }

    fn store_with_conversations(dir: &TempDir, count: usize) -> Arc<DirStore> {
        let store = DirStore::open(dir.path()).unwrap();
        for n in 0..count {
            store
                .upsert(
                    Record::from_value(
                        EntityType::Conversation,
                        json!({ "conversation_id": format!("c-{n:05}") }),
                    )
                    .unwrap(),
                )
                .unwrap();
        }
        Arc::new(store)
    }

    fn add_image_message(store: &DirStore) -> Uuid {
        let id = Uuid::new_v4();
        store
            .upsert(
                Record::from_value(
                    EntityType::Message,
                    json!({
                        "message_id": id.to_string(),
                        "category": "SIGNAL_IMAGE",
                        "media_url": format!("{id}.jpg"),
                    }),
                )
                .unwrap(),
            )
            .unwrap();
        id
    }

    fn parse(wire: &[u8]) -> Vec<ParsedFrame> {
        let mut parser = FrameParser::new();
        let frames = parser.push(wire).unwrap();
        parser.finish().unwrap();
        frames
    }

    async fn run(
        store: Arc<DirStore>,
        config: &TransferConfig,
    ) -> (SendSummary, Arc<RecordingOutbound>) {
        let outbound = Arc::new(RecordingOutbound::new(true));
        let summary = SendingEngine::new(store, outbound.clone(), config)
            .run()
            .await
            .unwrap();
        (summary, outbound)
    }

    #[tokio::test]
    async fn test_pages_of_conversations() {
        let dir = TempDir::new().unwrap();
        let store = store_with_conversations(&dir, 250);
        let (summary, outbound) = run(store, &config(100, 1024)).await;

        let frames = parse(&outbound.wire());
        assert!(matches!(&frames[0], ParsedFrame::Command(c) if c.total == Some(250)));
        let records: Vec<_> = frames
            .iter()
            .filter(|f| matches!(f, ParsedFrame::Record { entity: EntityType::Conversation, .. }))
            .collect();
        assert_eq!(records.len(), 250);
        assert!(matches!(frames.last(), Some(ParsedFrame::Command(c)) if c.action == Action::Finish));
        assert_eq!(summary.records[&EntityType::Conversation], 250);
    }

    #[tokio::test]
    async fn test_page_boundaries() {
        struct Pages {
            inner: Arc<DirStore>,
            calls: std::sync::Mutex<Vec<usize>>,
        }
        impl RecordSource for Pages {
            fn count(&self, entity: EntityType, filter: &TransferFilter) -> Result<u64, StoreError> {
                self.inner.count(entity, filter)
            }
            fn page(
                &self,
                entity: EntityType,
                filter: &TransferFilter,
                after: Option<&RecordKey>,
                limit: usize,
            ) -> Result<Vec<Record>, StoreError> {
                let page = self.inner.page(entity, filter, after, limit)?;
                if entity == EntityType::Conversation {
                    self.calls.lock().unwrap().push(page.len());
                }
                Ok(page)
            }
            fn record_exists(&self, id: &Uuid) -> Result<bool, StoreError> {
                self.inner.record_exists(id)
            }
            fn attachment_in_scope(
                &self,
                id: &Uuid,
                filter: &TransferFilter,
            ) -> Result<bool, StoreError> {
                self.inner.attachment_in_scope(id, filter)
            }
            fn attachment_roots(&self) -> Vec<(AttachmentCategory, PathBuf)> {
                self.inner.attachment_roots()
            }
        }

        let dir = TempDir::new().unwrap();
        let pages = Arc::new(Pages {
            inner: store_with_conversations(&dir, 250),
            calls: Default::default(),
        });
        let outbound = Arc::new(RecordingOutbound::new(true));
        SendingEngine::new(pages.clone(), outbound, &config(100, 1024))
            .run()
            .await
            .unwrap();
        assert_eq!(*pages.calls.lock().unwrap(), vec![100, 100, 50]);

        let dir = TempDir::new().unwrap();
        let pages = Arc::new(Pages {
            inner: store_with_conversations(&dir, 100),
            calls: Default::default(),
        });
        let outbound = Arc::new(RecordingOutbound::new(true));
        SendingEngine::new(pages.clone(), outbound, &config(10, 1024))
            .run()
            .await
            .unwrap();
        let calls = pages.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 11);
        assert_eq!(calls.iter().sum::<usize>(), 100);
        assert_eq!(calls.last(), Some(&0));
    }

    #[tokio::test]
    async fn test_large_file_chunking() {
        let dir = TempDir::new().unwrap();
        let store = store_with_conversations(&dir, 0);
        let id = add_image_message(&store);
        let content: Vec<u8> = (0..25 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let path = store
            .attachments_dir(AttachmentCategory::Photos)
            .join(format!("{id}.jpg"));
        std::fs::write(&path, &content).unwrap();

        let chunk_size = 10 * 1024 * 1024;
        let (summary, outbound) = run(store, &config(100, chunk_size)).await;
        assert_eq!(summary.files, 1);

        let units = outbound.units.lock().unwrap().clone();
        let header_at = units
            .iter()
            .position(|u| u.len() == 5 + 16 && u[0] == FrameKind::File as u8)
            .unwrap();
        let chunk_lens: Vec<usize> = units[header_at + 1..header_at + 4]
            .iter()
            .map(|u| u.len())
            .collect();
        assert_eq!(chunk_lens, vec![chunk_size, chunk_size, 5 * 1024 * 1024]);

        let mut expected = Checksum::new();
        expected.update(id.as_bytes());
        expected.update(&content);
        let trailer = &units[header_at + 4];
        assert_eq!(trailer.as_ref(), &expected.finalize().to_be_bytes());
    }

    #[tokio::test]
    async fn test_one_unit_in_flight() {
        let dir = TempDir::new().unwrap();
        let store = store_with_conversations(&dir, 30);
        let id = add_image_message(&store);
        std::fs::write(
            store
                .attachments_dir(AttachmentCategory::Photos)
                .join(format!("{id}.jpg")),
            vec![7u8; 100],
        )
        .unwrap();

        let outbound = Arc::new(RecordingOutbound::new(false));
        let engine = SendingEngine::new(store, outbound.clone(), &config(10, 16));
        let task = tokio::spawn(engine.run());

        while !task.is_finished() {
            outbound.complete_next();
            tokio::task::yield_now().await;
        }
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(*outbound.max_outstanding.lock().unwrap(), 1);
        // start + 31 records + header + 7 chunks + trailer + finish
        assert_eq!(outbound.units.lock().unwrap().len(), 1 + 31 + 1 + 7 + 1 + 1);
    }

    #[tokio::test]
    async fn test_orphans_and_thumbnails() {
        let dir = TempDir::new().unwrap();
        let store = store_with_conversations(&dir, 0);
        let owned = add_image_message(&store);

        let photos = store.attachments_dir(AttachmentCategory::Photos);
        let videos = store.attachments_dir(AttachmentCategory::Videos);
        let owned_path = photos.join(format!("{owned}.jpg"));
        let orphan_path = photos.join(format!("{}.jpg", Uuid::new_v4()));
        let junk_path = photos.join("not-a-message.png");
        let thumbnail_path = videos.join(format!("{}.jpeg", Uuid::new_v4()));
        for path in [&owned_path, &orphan_path, &junk_path, &thumbnail_path] {
            std::fs::write(path, b"bytes").unwrap();
        }

        let (summary, outbound) = run(store, &config(100, 1024)).await;
        assert_eq!(summary.files, 1);
        assert_eq!(summary.orphans_deleted, 2);
        assert!(owned_path.exists());
        assert!(!orphan_path.exists());
        assert!(!junk_path.exists());
        assert!(thumbnail_path.exists());

        let files: Vec<Uuid> = parse(&outbound.wire())
            .into_iter()
            .filter_map(|f| match f {
                ParsedFrame::FileStart { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(files, vec![owned]);
    }

    #[tokio::test]
    async fn test_received_attachment_is_sent_on() {
        let dir = TempDir::new().unwrap();
        let store = store_with_conversations(&dir, 0);
        let id = Uuid::new_v4();
        let content = b"imported photo";
        let mut checksum = Checksum::new();
        checksum.update(id.as_bytes());
        checksum.update(content);

        let mut receiver = ReceivingEngine::new(store.clone(), 100);
        let frames = [
            ParsedFrame::Command(Command::start(2)),
            ParsedFrame::Record {
                entity: EntityType::Message,
                body: Bytes::from(
                    json!({
                        "message_id": id.to_string(),
                        "category": "SIGNAL_IMAGE",
                        "media_url": "photo.jpg",
                    })
                    .to_string(),
                ),
            },
            ParsedFrame::FileStart { id, size: content.len() as u64 },
            ParsedFrame::FileChunk(Bytes::from_static(content)),
            ParsedFrame::FileEnd { checksum: checksum.finalize() },
            ParsedFrame::Command(Command::finish()),
        ];
        for frame in frames {
            receiver.handle(frame).await.unwrap();
        }
        assert_eq!(receiver.summary().files_accepted, 1);
        let stored = store
            .attachments_dir(AttachmentCategory::Photos)
            .join(format!("{id}.jpg"));

        let (summary, outbound) = run(store, &config(100, 1024)).await;
        assert_eq!(summary.files, 1);
        assert_eq!(summary.orphans_deleted, 0);
        assert_eq!(std::fs::read(&stored).unwrap(), content);
        let sent: Vec<Uuid> = parse(&outbound.wire())
            .into_iter()
            .filter_map(|f| match f {
                ParsedFrame::FileStart { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![id]);
    }

    #[tokio::test]
    async fn test_filtered_selection() {
        let dir = TempDir::new().unwrap();
        let store = store_with_conversations(&dir, 20);
        let mut ids = Vec::new();
        for (conversation_id, created_at) in [
            ("c-00001", "2024-06-01T08:00:00Z"),
            ("c-00001", "2023-12-31T23:00:00Z"),
            ("c-00002", "2024-06-01T08:00:00Z"),
        ] {
            let id = Uuid::new_v4();
            store
                .upsert(
                    Record::from_value(
                        EntityType::Message,
                        json!({
                            "message_id": id.to_string(),
                            "conversation_id": conversation_id,
                            "category": "SIGNAL_IMAGE",
                            "created_at": created_at,
                        }),
                    )
                    .unwrap(),
                )
                .unwrap();
            let path = store
                .attachments_dir(AttachmentCategory::Photos)
                .join(format!("{id}.jpg"));
            std::fs::write(&path, b"img").unwrap();
            ids.push((id, path));
        }
        let orphan = store
            .attachments_dir(AttachmentCategory::Photos)
            .join(format!("{}.jpg", Uuid::new_v4()));
        std::fs::write(&orphan, b"img").unwrap();

        let filter = TransferFilter {
            conversations: Some(["c-00001".to_string()].into_iter().collect()),
            earliest_created_at: Some(humantime::parse_rfc3339("2024-01-01T00:00:00Z").unwrap()),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbound = Arc::new(RecordingOutbound::new(true));
        let summary = SendingEngine::new(store, outbound.clone(), &config(100, 1024))
            .with_filter(filter)
            .with_events(tx)
            .run()
            .await
            .unwrap();

        // One conversation, one message and its attachment
        assert_eq!(summary.records[&EntityType::Conversation], 1);
        assert_eq!(summary.records[&EntityType::Message], 1);
        assert_eq!(summary.files, 1);
        let mut counted = None;
        while let Ok(event) = rx.try_recv() {
            if let SenderEvent::Counted { total } = event {
                counted = Some(total);
            }
        }
        assert_eq!(counted, Some(3));

        let sent: Vec<Uuid> = parse(&outbound.wire())
            .into_iter()
            .filter_map(|f| match f {
                ParsedFrame::FileStart { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![ids[0].0]);
        // Out-of-scope files are left alone rather than treated as orphans
        assert!(ids.iter().all(|(_, path)| path.exists()));
        assert!(orphan.exists());
    }

    #[tokio::test]
    async fn test_closed_transport_aborts() {
        let dir = TempDir::new().unwrap();
        let store = store_with_conversations(&dir, 5);
        let outbound = Arc::new(RecordingOutbound::new(true));
        outbound.close();

        let result = SendingEngine::new(store, outbound, &TransferConfig::default())
            .run()
            .await;
        assert!(matches!(result, Err(TransferError::Transport(_))));
    }

    #[tokio::test]
    async fn test_events() {
        let dir = TempDir::new().unwrap();
        let store = store_with_conversations(&dir, 3);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbound = Arc::new(RecordingOutbound::new(true));
        SendingEngine::new(store, outbound, &TransferConfig::default())
            .with_events(tx)
            .run()
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events.contains(&SenderEvent::Counted { total: 3 }));
        assert_eq!(events.last(), Some(&SenderEvent::Phase(SenderPhase::Done)));
    }
}
