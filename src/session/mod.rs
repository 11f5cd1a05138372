//! Session orchestration: the state every observer sees, and the two roles
//! that drive it.

use std::collections::VecDeque;
use std::fmt;
use tokio::sync::watch;

use crate::network::{Connection, Inbound, TransportError};
use crate::pairing::PairingError;
use crate::protocol::{FrameParser, ParsedFrame, ProtocolError};
use crate::transfer::TransferError;

pub mod destination;
pub mod source;

pub use destination::DestinationSession;
pub use source::{Advert, SourceSession};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Preparing,
    /// Listener bound or client socket prepared
    Ready,
    /// Transport connected, not yet paired
    Connected,
    Transporting { processed: u64, total: u64 },
    Closed,
    Failed(FailureReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed(_))
    }

    fn rank(&self) -> u8 {
        match self {
            SessionState::Preparing => 0,
            SessionState::Ready => 1,
            SessionState::Connected => 2,
            SessionState::Transporting { .. } => 3,
            SessionState::Closed | SessionState::Failed(_) => 4,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Preparing => f.write_str("preparing"),
            SessionState::Ready => f.write_str("ready"),
            SessionState::Connected => f.write_str("connected"),
            SessionState::Transporting { processed, total } => {
                write!(f, "transporting {processed}/{total}")
            }
            SessionState::Closed => f.write_str("closed"),
            SessionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Why a session ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("peer is signed in to a different account")]
    MismatchedUser,

    #[error("pairing code does not match")]
    MismatchedCode,

    #[error("connection closed before the transfer finished")]
    Incomplete,

    #[error(transparent)]
    Transport(TransportError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("i/o failure: {0}")]
    Io(String),
}

impl From<TransportError> for FailureReason {
    fn from(e: TransportError) -> Self {
        FailureReason::Transport(e)
    }
}

impl From<ProtocolError> for FailureReason {
    fn from(e: ProtocolError) -> Self {
        FailureReason::Protocol(e.to_string())
    }
}

impl From<PairingError> for FailureReason {
    fn from(e: PairingError) -> Self {
        match e {
            PairingError::MismatchedUser => FailureReason::MismatchedUser,
            PairingError::MismatchedCode => FailureReason::MismatchedCode,
            PairingError::Protocol(e) => e.into(),
        }
    }
}

impl From<TransferError> for FailureReason {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Transport(e) => e.into(),
            TransferError::Protocol(e) => e.into(),
            TransferError::Store(e) => FailureReason::Storage(e.to_string()),
            other => FailureReason::Io(other.to_string()),
        }
    }
}

/// Single source of truth for a session's state.
///
/// Transitions only move forward, and nothing leaves `Closed` or `Failed`.
pub struct StateMachine {
    tx: watch::Sender<SessionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Preparing);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SessionState {
        self.tx.borrow().clone()
    }

    /// Apply `next` if allowed; returns whether the state changed
    pub fn transition(&self, next: SessionState) -> bool {
        self.tx.send_if_modified(|current| {
            let allowed = !current.is_terminal()
                && (next.rank() > current.rank()
                    || (next.rank() == current.rank() && next != *current));
            if allowed {
                tracing::debug!(from = %current, to = %next, "session state");
                *current = next;
            }
            allowed
        })
    }

    pub fn fail(&self, reason: FailureReason) -> bool {
        self.transition(SessionState::Failed(reason))
    }
}

/// Parsed frames from one connection, in order.
///
/// `next` is cancel safe, so it can sit in a `select!` next to other work.
pub(crate) struct FrameStream {
    parser: FrameParser,
    pending: VecDeque<ParsedFrame>,
}

impl FrameStream {
    pub fn new() -> Self {
        Self {
            parser: FrameParser::new(),
            pending: VecDeque::new(),
        }
    }

    /// Next frame, or `None` once the peer has closed its side
    pub async fn next(
        &mut self,
        connection: &mut Connection,
    ) -> Result<Option<ParsedFrame>, FailureReason> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            match connection.receive().await {
                Inbound::Data(bytes) => self.pending.extend(self.parser.push(&bytes)?),
                Inbound::Closed => {
                    if let Err(e) = self.parser.finish() {
                        tracing::debug!(error = %e, "peer closed mid-frame");
                    }
                    return Ok(None);
                }
                Inbound::Failed(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only() {
        let machine = StateMachine::new();
        let rx = machine.subscribe();
        assert!(machine.transition(SessionState::Ready));
        assert!(machine.transition(SessionState::Connected));
        assert!(!machine.transition(SessionState::Ready));
        assert!(machine.transition(SessionState::Transporting { processed: 0, total: 10 }));
        assert!(machine.transition(SessionState::Transporting { processed: 5, total: 10 }));
        assert!(!machine.transition(SessionState::Transporting { processed: 5, total: 10 }));
        assert_eq!(
            *rx.borrow(),
            SessionState::Transporting { processed: 5, total: 10 }
        );
    }

    #[test]
    fn test_terminal_states_are_final() {
        let machine = StateMachine::new();
        assert!(machine.fail(FailureReason::MismatchedCode));
        assert!(!machine.transition(SessionState::Closed));
        assert!(!machine.fail(FailureReason::Incomplete));
        assert_eq!(
            machine.current(),
            SessionState::Failed(FailureReason::MismatchedCode)
        );

        let machine = StateMachine::new();
        assert!(machine.transition(SessionState::Closed));
        assert!(!machine.fail(FailureReason::Incomplete));
        assert!(!machine.transition(SessionState::Ready));
    }

    #[test]
    fn test_pairing_errors_map_to_reasons() {
        assert_eq!(
            FailureReason::from(PairingError::MismatchedUser),
            FailureReason::MismatchedUser
        );
        assert!(matches!(
            FailureReason::from(PairingError::Protocol(ProtocolError::UnknownEntity(99))),
            FailureReason::Protocol(_)
        ));
    }
}
