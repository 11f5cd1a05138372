use bytes::{Buf, Bytes, BytesMut};
use uuid::Uuid;

use super::{
    Command, EntityType, FrameHeader, FrameKind, ProtocolError, CHECKSUM_LEN, FILE_ID_LEN,
    HEADER_LEN,
};

/// A decoded unit handed to the receiving side.
///
/// File frames are surfaced incrementally so attachment content never has to
/// be buffered whole: one `FileStart`, any number of `FileChunk`s, one `FileEnd`.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    Command(Command),
    Record { entity: EntityType, body: Bytes },
    FileStart { id: Uuid, size: u64 },
    FileChunk(Bytes),
    FileEnd { checksum: u32 },
}

impl ParsedFrame {
    /// Wire kind this piece belongs to
    pub fn kind(&self) -> FrameKind {
        match self {
            ParsedFrame::Command(_) => FrameKind::Command,
            ParsedFrame::Record { .. } => FrameKind::Record,
            ParsedFrame::FileStart { .. } | ParsedFrame::FileChunk(_) | ParsedFrame::FileEnd { .. } => {
                FrameKind::File
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Body(FrameHeader),
    FileId { size: u64 },
    FileContent { remaining: u64 },
    FileTrailer,
    Failed,
}

/// Streaming frame decoder.
///
/// Accepts inbound bytes in arbitrary slices and yields every frame that
/// became complete. After the first error the parser stays failed.
pub struct FrameParser {
    buffer: BytesMut,
    state: State,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::Header,
        }
    }

    /// Feed the next inbound chunk
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<ParsedFrame>, ProtocolError> {
        if self.state == State::Failed {
            return Err(ProtocolError::MalformedFrame(
                "parser already failed".to_string(),
            ));
        }
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            match self.step() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => return Ok(frames),
                Err(e) => {
                    self.state = State::Failed;
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }
    }

    /// Signal that no more bytes will arrive.
    ///
    /// Fails if the stream stopped in the middle of a frame.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        match self.state {
            State::Header if self.buffer.is_empty() => Ok(()),
            State::Failed => Ok(()),
            _ => Err(ProtocolError::MalformedFrame(format!(
                "stream closed mid-frame with {} buffered bytes",
                self.buffer.len()
            ))),
        }
    }

    /// True when no partial frame is buffered
    pub fn is_idle(&self) -> bool {
        self.state == State::Header && self.buffer.is_empty()
    }

    fn step(&mut self) -> Result<Option<ParsedFrame>, ProtocolError> {
        match self.state {
            State::Header => {
                if self.buffer.len() < HEADER_LEN {
                    return Ok(None);
                }
                let mut raw = [0u8; HEADER_LEN];
                self.buffer.copy_to_slice(&mut raw);
                let header = FrameHeader::decode(raw)?;
                self.state = match header.kind {
                    FrameKind::File => State::FileId {
                        size: header.length as u64 - FILE_ID_LEN as u64,
                    },
                    _ => State::Body(header),
                };
                self.step()
            }
            State::Body(header) => {
                let length = header.length as usize;
                if self.buffer.len() < length {
                    return Ok(None);
                }
                let mut payload = self.buffer.split_to(length).freeze();
                self.state = State::Header;
                match header.kind {
                    FrameKind::Command => Ok(Some(ParsedFrame::Command(Command::from_payload(
                        &payload,
                    )?))),
                    _ => {
                        let entity = EntityType::try_from(payload.get_u8())?;
                        Ok(Some(ParsedFrame::Record {
                            entity,
                            body: payload,
                        }))
                    }
                }
            }
            State::FileId { size } => {
                if self.buffer.len() < FILE_ID_LEN {
                    return Ok(None);
                }
                let mut raw = [0u8; FILE_ID_LEN];
                self.buffer.copy_to_slice(&mut raw);
                self.state = State::FileContent { remaining: size };
                Ok(Some(ParsedFrame::FileStart {
                    id: Uuid::from_bytes(raw),
                    size,
                }))
            }
            State::FileContent { remaining } => {
                if remaining == 0 {
                    self.state = State::FileTrailer;
                    return self.step();
                }
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let take = remaining.min(self.buffer.len() as u64) as usize;
                let chunk = self.buffer.split_to(take).freeze();
                self.state = State::FileContent {
                    remaining: remaining - take as u64,
                };
                Ok(Some(ParsedFrame::FileChunk(chunk)))
            }
            State::FileTrailer => {
                if self.buffer.len() < CHECKSUM_LEN {
                    return Ok(None);
                }
                let checksum = self.buffer.get_u32();
                self.state = State::Header;
                Ok(Some(ParsedFrame::FileEnd { checksum }))
            }
            State::Failed => Ok(None),
        }
    }
}
