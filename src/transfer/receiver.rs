use std::sync::Arc;
use uuid::Uuid;

use super::{blocking, FileWriter, TransferError};
use crate::protocol::{Action, ParsedFrame, ProtocolError, Record};
use crate::store::RecordSink;

/// What the session should do after a frame was consumed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// `start` received with the advisory total
    Started { total: u64 },
    /// Time to tell the sender how far along we are
    Progress { processed: u64, total: u64, percent: u8 },
    /// `finish` received and everything flushed
    Finished,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveSummary {
    pub records_persisted: u64,
    pub records_rejected: u64,
    pub files_accepted: u64,
    pub files_rejected: u64,
}

struct IncomingFile {
    id: Uuid,
    /// `None` once the file is known to be unusable; content is then drained
    writer: Option<FileWriter>,
}

/// Destination-side consumer of parsed frames.
///
/// Data problems (unparseable records, missing owners, checksum mismatches)
/// are logged and counted; only protocol and storage-flush errors are fatal.
pub struct ReceivingEngine {
    sink: Arc<dyn RecordSink>,
    progress_every: u64,
    total: Option<u64>,
    processed: u64,
    since_progress: u64,
    current: Option<IncomingFile>,
    summary: ReceiveSummary,
}

impl ReceivingEngine {
    pub fn new(sink: Arc<dyn RecordSink>, progress_every: u64) -> Self {
        Self {
            sink,
            progress_every: progress_every.max(1),
            total: None,
            processed: 0,
            since_progress: 0,
            current: None,
            summary: ReceiveSummary::default(),
        }
    }

    pub fn summary(&self) -> &ReceiveSummary {
        &self.summary
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub async fn handle(&mut self, frame: ParsedFrame) -> Result<Step, TransferError> {
        let Some(total) = self.total else {
            return match frame {
                ParsedFrame::Command(command) if command.action == Action::Start => {
                    let total = command.total.unwrap_or_default();
                    tracing::info!(
                        total,
                        platform = command.platform.as_deref().unwrap_or("unknown"),
                        "transfer started"
                    );
                    self.total = Some(total);
                    Ok(Step::Started { total })
                }
                ParsedFrame::Command(command) => {
                    Err(ProtocolError::UnexpectedCommand(command.action).into())
                }
                other => Err(ProtocolError::UnexpectedFrame(other.kind()).into()),
            };
        };

        match frame {
            ParsedFrame::Command(command) => match command.action {
                Action::Finish => self.finish().await,
                other => Err(ProtocolError::UnexpectedCommand(other).into()),
            },
            ParsedFrame::Record { entity, body } => {
                match Record::from_body(entity, &body) {
                    Ok(record) => self.persist(record).await?,
                    Err(e) => {
                        tracing::warn!(%entity, error = %e, "dropping unreadable record");
                        self.summary.records_rejected += 1;
                    }
                }
                Ok(self.item_done(total))
            }
            ParsedFrame::FileStart { id, size } => {
                self.begin_file(id, size).await?;
                Ok(Step::Continue)
            }
            ParsedFrame::FileChunk(data) => {
                self.write_chunk(&data).await;
                Ok(Step::Continue)
            }
            ParsedFrame::FileEnd { checksum } => {
                self.end_file(checksum).await;
                Ok(self.item_done(total))
            }
        }
    }

    async fn persist(&mut self, record: Record) -> Result<(), TransferError> {
        let entity = record.entity;
        let sink = self.sink.clone();
        match blocking(move || sink.upsert(record)).await {
            Ok(()) => self.summary.records_persisted += 1,
            Err(TransferError::Store(e)) => {
                tracing::warn!(%entity, error = %e, "failed to persist record");
                self.summary.records_rejected += 1;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn begin_file(&mut self, id: Uuid, size: u64) -> Result<(), TransferError> {
        let sink = self.sink.clone();
        let mut destinations = match blocking(move || sink.attachment_destinations(&id)).await {
            Ok(destinations) => destinations.into_iter(),
            Err(TransferError::Store(e)) => {
                tracing::warn!(file_id = %id, error = %e, "failed to resolve attachment destination");
                Vec::new().into_iter()
            }
            Err(e) => return Err(e),
        };

        let writer = match destinations.next() {
            Some(path) => match FileWriter::create(&path, &id, size).await {
                Ok(writer) => Some(writer.with_copies(destinations.collect())),
                Err(e) => {
                    tracing::warn!(file_id = %id, path = %path.display(), error = %e, "cannot create attachment");
                    None
                }
            },
            None => {
                tracing::warn!(file_id = %id, "attachment has no owning record");
                None
            }
        };
        self.current = Some(IncomingFile { id, writer });
        Ok(())
    }

    async fn write_chunk(&mut self, data: &[u8]) {
        let Some(file) = self.current.as_mut() else {
            return;
        };
        let Some(writer) = file.writer.as_mut() else {
            return;
        };
        let result = writer.write_chunk(data).await;
        if let Err(e) = result {
            tracing::warn!(file_id = %file.id, error = %e, "failed to write attachment");
            if let Some(writer) = file.writer.take() {
                writer.discard().await;
            }
        }
    }

    async fn end_file(&mut self, checksum: u32) {
        let Some(file) = self.current.take() else {
            return;
        };
        let accepted = match file.writer {
            Some(writer) => match writer.commit(checksum).await {
                Ok(true) => true,
                Ok(false) => {
                    tracing::warn!(file_id = %file.id, "checksum mismatch, attachment dropped");
                    false
                }
                Err(e) => {
                    tracing::warn!(file_id = %file.id, error = %e, "failed to store attachment");
                    false
                }
            },
            None => false,
        };
        if accepted {
            self.summary.files_accepted += 1;
        } else {
            self.summary.files_rejected += 1;
        }
    }

    fn item_done(&mut self, total: u64) -> Step {
        self.processed += 1;
        self.since_progress += 1;
        if self.since_progress < self.progress_every {
            return Step::Continue;
        }
        self.since_progress = 0;
        Step::Progress {
            processed: self.processed,
            total,
            percent: percent(self.processed, total),
        }
    }

    async fn finish(&mut self) -> Result<Step, TransferError> {
        let sink = self.sink.clone();
        blocking(move || sink.flush()).await?;
        tracing::info!(
            records = self.summary.records_persisted,
            records_rejected = self.summary.records_rejected,
            files = self.summary.files_accepted,
            files_rejected = self.summary.files_rejected,
            "transfer finished"
        );
        Ok(Step::Finished)
    }
}

/// Share of the advisory total, capped at 100
pub fn percent(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (processed.saturating_mul(100) / total).min(100) as u8
}
