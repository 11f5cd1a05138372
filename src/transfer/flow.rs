use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::IN_FLIGHT_UNITS;
use crate::network::{Outbound, TransportError};

/// Gate that keeps at most [`IN_FLIGHT_UNITS`] units queued on the transport.
///
/// A permit is taken before each submission and released by the transport's
/// write completion, or when the completion is dropped unused.
pub struct SendPermit {
    semaphore: Arc<Semaphore>,
    slow_after: Duration,
}

impl SendPermit {
    pub fn new(slow_after: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(IN_FLIGHT_UNITS)),
            slow_after,
        }
    }

    /// Wait for a free slot.
    ///
    /// Every `slow_after` spent waiting is reported through `on_slow` with the
    /// total time waited so far; waiting continues regardless.
    pub async fn acquire(
        &self,
        mut on_slow: impl FnMut(Duration),
    ) -> Result<OwnedSemaphorePermit, TransportError> {
        let mut waited = Duration::ZERO;
        loop {
            let attempt = self.semaphore.clone().acquire_owned();
            match tokio::time::timeout(self.slow_after, attempt).await {
                Ok(Ok(permit)) => return Ok(permit),
                Ok(Err(_)) => return Err(TransportError::Closed),
                Err(_) => {
                    waited += self.slow_after;
                    tracing::warn!(
                        waited = %humantime::format_duration(waited),
                        "slow consumer: previous unit not yet written"
                    );
                    on_slow(waited);
                }
            }
        }
    }

    /// Acquire a slot, then hand `data` to the transport
    pub async fn submit(
        &self,
        outbound: &dyn Outbound,
        data: Bytes,
        on_slow: impl FnMut(Duration),
    ) -> Result<(), TransportError> {
        if !outbound.is_open() {
            return Err(TransportError::Closed);
        }
        let permit = self.acquire(on_slow).await?;
        outbound.send(
            data,
            Box::new(move |result| {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "unit not written");
                }
                drop(permit);
            }),
        )
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
