use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::{FailureReason, FrameStream, SessionState, StateMachine};
use crate::config::TransferConfig;
use crate::network::{Bind, Connection, Listener, TransportError};
use crate::pairing::{Pairing, PairingCode};
use crate::protocol::{Action, ParsedFrame, ProtocolError};
use crate::store::{RecordSource, TransferFilter};
use crate::transfer::{SenderEvent, SendingEngine};

/// What the destination needs to find this session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advert {
    pub addr: SocketAddr,
    pub code: PairingCode,
}

/// The listening, sending side of a transfer
pub struct SourceSession {
    state: StateMachine,
    pairing: Pairing,
    source: Arc<dyn RecordSource>,
    config: TransferConfig,
    filter: TransferFilter,
    listener: Option<Listener>,
}

impl SourceSession {
    pub fn new(
        user_id: impl Into<String>,
        source: Arc<dyn RecordSource>,
        config: TransferConfig,
    ) -> Self {
        Self {
            state: StateMachine::new(),
            pairing: Pairing::new(user_id, PairingCode::generate()),
            source,
            config,
            filter: TransferFilter::default(),
            listener: None,
        }
    }

    /// Offer only part of the account
    pub fn with_filter(mut self, filter: TransferFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    /// Bind the listener and issue the pairing code
    pub async fn prepare(&mut self, bind: &Bind) -> Result<Advert, FailureReason> {
        match Listener::bind(bind).await {
            Ok(listener) => {
                let advert = Advert {
                    addr: listener.local_addr(),
                    code: self.pairing.code(),
                };
                tracing::info!(addr = %advert.addr, code = %advert.code, "waiting for destination");
                self.listener = Some(listener);
                self.state.transition(SessionState::Ready);
                Ok(advert)
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
        if self.listener.is_none() {
            let bind = self.config.bind();
            self.prepare(&bind).await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or(FailureReason::Transport(TransportError::Closed))?;

        let mut connection = listener.accept().await?;
        self.state.transition(SessionState::Connected);
        let mut frames = FrameStream::new();

        match frames.next(&mut connection).await? {
            Some(ParsedFrame::Command(command)) => {
                if let Err(e) = self.pairing.verify(&command) {
                    tracing::warn!(peer = %connection.peer_addr(), error = %e, "pairing rejected");
                    connection.close("pairing rejected");
                    return Err(e.into());
                }
                tracing::info!(peer = %connection.peer_addr(), "destination paired");
                self.state
                    .transition(SessionState::Transporting { processed: 0, total: 0 });
            }
            Some(other) => return Err(ProtocolError::UnexpectedFrame(other.kind()).into()),
            None => return Err(FailureReason::Incomplete),
        }

        self.transport(connection, frames).await
    }

    async fn transport(
        &mut self,
        mut connection: Connection,
        mut frames: FrameStream,
    ) -> Result<(), FailureReason> {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let engine = SendingEngine::new(
            self.source.clone(),
            Arc::new(connection.writer()),
            &self.config,
        )
        .with_filter(self.filter.clone())
        .with_events(events_tx);
        let sending = engine.run();
        tokio::pin!(sending);

        let mut sent_all = false;
        let mut total = 0;
        loop {
            tokio::select! {
                result = &mut sending, if !sent_all => {
                    let summary = result?;
                    tracing::debug!(?summary, "sender finished, waiting for destination");
                    sent_all = true;
                }
                Some(event) = events.recv() => {
                    if let SenderEvent::Counted { total: counted } = event {
                        total = counted;
                        self.state.transition(SessionState::Transporting { processed: 0, total });
                    }
                }
                frame = frames.next(&mut connection) => match frame? {
                    Some(ParsedFrame::Command(command)) => match command.action {
                        Action::Progress => {
                            let percent = u64::from(command.progress.unwrap_or_default());
                            let processed = total * percent / 100;
                            self.state.transition(SessionState::Transporting { processed, total });
                        }
                        Action::Finish if sent_all => {
                            tracing::info!(peer = %connection.peer_addr(), "destination confirmed finish");
                            connection.close("finished");
                            self.state.transition(SessionState::Closed);
                            return Ok(());
                        }
                        other => return Err(ProtocolError::UnexpectedCommand(other).into()),
                    },
                    Some(other) => return Err(ProtocolError::UnexpectedFrame(other.kind()).into()),
                    None => return Err(FailureReason::Incomplete),
                },
            }
        }
    }
}
