//! Consumer loop: claim one message at a time, drive it through a handler,
//! and delete, retry or abort it according to the handler's outcome.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tracing::{Instrument, debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Delivery, Disposition, MessageId, Outcome};
use crate::storage::Storage;
use crate::telemetry::delivery::{record_outcome, start_delivery_span};

/// Sequential consumer over one [`Storage`]. Cloning shares the shutdown signal.
#[derive(Clone)]
pub struct Consumer {
    storage: Arc<Storage>,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
}

impl Consumer {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Ask the loop to stop. Observed while waiting for a message and between
    /// retries; a running handler invocation is never cut short.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Call [`shutdown`](Self::shutdown) once `signal` resolves.
    ///
    /// Typically fed [`ShutdownSignal::recv`](crate::signal::ShutdownSignal::recv).
    pub fn shutdown_on<S>(&self, signal: S) -> tokio::task::JoinHandle<()>
    where
        S: Future + Send + 'static,
    {
        let consumer = self.clone();
        tokio::spawn(async move {
            signal.await;
            info!(consumer_id = %consumer.storage.consumer_id(), "shutdown requested");
            consumer.shutdown();
        })
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Recover in-flight work and release this consumer's working directory.
    pub async fn close(&self) -> Result<()> {
        self.shutdown();
        self.storage.close().await
    }

    /// Run until [`shutdown`](Self::shutdown).
    ///
    /// Messages left claimed by a previous run of this consumer id are put
    /// back first. On the way out, anything still claimed is returned too.
    pub async fn run<T, F, Fut>(&self, mut handler: F) -> Result<()>
    where
        T: DeserializeOwned + Clone,
        F: FnMut(T, Delivery) -> Fut,
        Fut: Future<Output = Outcome>,
    {
        self.storage.recover_in_flight().await?;
        info!(consumer_id = %self.storage.consumer_id(), "consumer started");

        loop {
            match self.process_next(&mut handler).await? {
                Disposition::Completed { id, attempts } => {
                    debug!(message_id = %id, attempts, "message completed");
                }
                Disposition::Aborted { id, attempts } => {
                    debug!(message_id = %id, attempts, "message aborted");
                }
                Disposition::Interrupted => break,
            }
        }

        // A claim can land after its future was dropped by the shutdown branch.
        self.storage.recover_in_flight().await?;
        info!(consumer_id = %self.storage.consumer_id(), "consumer stopped");
        Ok(())
    }

    /// Claim the next message (waiting if none) and see it to a terminal state.
    pub async fn process_next<T, F, Fut>(&self, handler: &mut F) -> Result<Disposition>
    where
        T: DeserializeOwned + Clone,
        F: FnMut(T, Delivery) -> Fut,
        Fut: Future<Output = Outcome>,
    {
        if self.is_stopping() {
            return Ok(Disposition::Interrupted);
        }

        let id = tokio::select! {
            _ = self.shutdown.notified() => return Ok(Disposition::Interrupted),
            claimed = self.storage.claim_next() => claimed?,
        };

        let span = start_delivery_span(&id, self.storage.consumer_id());
        self.deliver(id, handler, &span)
            .instrument(span.clone())
            .await
    }

    async fn deliver<T, F, Fut>(
        &self,
        id: MessageId,
        handler: &mut F,
        span: &tracing::Span,
    ) -> Result<Disposition>
    where
        T: DeserializeOwned + Clone,
        F: FnMut(T, Delivery) -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let body: T = match self.storage.read_claimed(&id).await {
            Ok(body) => body,
            // Decoding will never succeed on retry; park it for inspection.
            Err(Error::Serialization(e)) => {
                warn!(message_id = %id, "undecodable message body: {e}");
                self.storage.move_to_abort(&id).await?;
                return Ok(Disposition::Aborted { id, attempts: 0 });
            }
            Err(e) => return Err(e),
        };
        self.dispatch(id, body, handler, span).await
    }

    /// Invoke the handler until it succeeds or aborts.
    async fn dispatch<T, F, Fut>(
        &self,
        id: MessageId,
        body: T,
        handler: &mut F,
        span: &tracing::Span,
    ) -> Result<Disposition>
    where
        T: Clone,
        F: FnMut(T, Delivery) -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let claimed_at = Utc::now();
        let mut attempt_count = 0u32;

        loop {
            let delivery = Delivery {
                message_id: id,
                attempt_count,
                claimed_at,
            };
            let started = Instant::now();
            let outcome = handler(body.clone(), delivery).await;
            record_outcome(span, attempt_count, &outcome, started.elapsed());

            match outcome {
                Outcome::Success => {
                    self.storage.delete_claimed(&id).await?;
                    return Ok(Disposition::Completed {
                        id,
                        attempts: attempt_count + 1,
                    });
                }
                Outcome::Abort(_) => {
                    self.storage.move_to_abort(&id).await?;
                    return Ok(Disposition::Aborted {
                        id,
                        attempts: attempt_count + 1,
                    });
                }
                Outcome::Retry(_) => {
                    if self.is_stopping() {
                        info!(message_id = %id, "shutdown requested, leaving message for recovery");
                        return Ok(Disposition::Interrupted);
                    }
                    attempt_count = attempt_count.saturating_add(1);
                    // No backoff; just let the rest of the runtime breathe.
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}
