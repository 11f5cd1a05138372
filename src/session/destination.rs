use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

use super::{FailureReason, FrameStream, SessionState, StateMachine};
use crate::config::TransferConfig;
use crate::network::{Bind, Dialer, Outbound, TransportError};
use crate::pairing::PairingCode;
use crate::protocol::Command;
use crate::store::RecordSink;
use crate::transfer::{ReceivingEngine, Step};

/// The dialing, receiving side of a transfer
pub struct DestinationSession {
    state: StateMachine,
    user_id: String,
    code: PairingCode,
    remote: SocketAddr,
    sink: Arc<dyn RecordSink>,
    config: TransferConfig,
    dialer: Option<Dialer>,
}

impl DestinationSession {
    pub fn new(
        user_id: impl Into<String>,
        code: PairingCode,
        remote: SocketAddr,
        sink: Arc<dyn RecordSink>,
        config: TransferConfig,
    ) -> Self {
        Self {
            state: StateMachine::new(),
            user_id: user_id.into(),
            code,
            remote,
            sink,
            config,
            dialer: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    /// Bind the client socket to the chosen interface
    pub fn prepare(&mut self, bind: &Bind) -> Result<(), FailureReason> {
        match Dialer::prepare(bind, self.remote) {
            Ok(dialer) => {
                self.dialer = Some(dialer);
                self.state.transition(SessionState::Ready);
                Ok(())
            }
            Err(e) => {
                let reason = FailureReason::from(e);
                self.state.fail(reason.clone());
                Err(reason)
            }
        }
    }

    /// Drive the session to a terminal state
    pub async fn run(mut self) -> SessionState {
        if let Err(reason) = self.drive().await {
            tracing::warn!(%reason, "session failed");
            self.state.fail(reason);
        }
        self.state.current()
    }

    async fn drive(&mut self) -> Result<(), FailureReason> {
        if self.dialer.is_none() {
            let bind = self.config.bind();
            self.prepare(&bind)?;
        }
        let dialer = self
            .dialer
            .take()
            .ok_or(FailureReason::Transport(TransportError::Closed))?;

        let mut connection = dialer.connect().await?;
        self.state.transition(SessionState::Connected);
        let writer = connection.writer();
        writer.send(
            Command::connect(self.user_id.clone(), self.code.value()).to_frame()?,
            Box::new(|_| {}),
        )?;

        let mut engine = ReceivingEngine::new(self.sink.clone(), self.config.progress_every);
        let mut frames = FrameStream::new();
        loop {
            let Some(frame) = frames.next(&mut connection).await? else {
                return Err(FailureReason::Incomplete);
            };
            match engine.handle(frame).await? {
                Step::Continue => {}
                Step::Started { total } => {
                    self.state
                        .transition(SessionState::Transporting { processed: 0, total });
                }
                Step::Progress {
                    processed,
                    total,
                    percent,
                } => {
                    self.state
                        .transition(SessionState::Transporting { processed, total });
                    writer.send(Command::progress(percent).to_frame()?, Box::new(|_| {}))?;
                }
                Step::Finished => {
                    let (done_tx, done_rx) = oneshot::channel();
                    writer.send(
                        Command::finish().to_frame()?,
                        Box::new(move |result| {
                            let _ = done_tx.send(result);
                        }),
                    )?;
                    // A dropped completion means the connection went away first
                    done_rx.await.map_err(|_| TransportError::Closed)??;
                    connection.close("finished");
                    tracing::info!(summary = ?engine.summary(), "import complete");
                    self.state.transition(SessionState::Closed);
                    return Ok(());
                }
            }
        }
    }
}
