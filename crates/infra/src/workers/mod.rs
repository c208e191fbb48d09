//! Message-driven workers and the receive/process/acknowledge loop they share.
//!
//! Each worker implements [`MessageHandler`]: it gets one decoded
//! [`Notification`] and reports an [`Outcome`] or a [`WorkerError`]. The
//! [`WorkerRuntime`] owns everything channel-related:
//! - decode the raw body (malformed bodies are dropped)
//! - acknowledge on success, re-hide on deferral
//! - leave the delivery unacknowledged on a retryable error
//!
//! Handlers must be idempotent: any delivery may be seen more than once.

pub mod archival;
pub mod completion;
pub mod retrieval;
pub mod thaw;

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use strata_core::JobId;
use strata_events::{ChannelError, DecodeError, Delivery, Notification, NotificationChannel};

use crate::archive::ArchiveError;
use crate::compute::ComputeError;
use crate::config::PollSettings;
use crate::object_store::ObjectStoreError;
use crate::record_store::RecordStoreError;

pub use archival::ArchivalWorker;
pub use completion::CompletionWorker;
pub use retrieval::RetrievalWorker;
pub use thaw::ThawWorker;

/// What the runtime does with a delivery whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Redelivery cannot help: acknowledge and move on.
    Drop,
    /// Leave unacknowledged; the channel redelivers after the visibility timeout.
    Retry,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("malformed message: {0}")]
    Malformed(#[from] DecodeError),

    #[error("unexpected {found} notification on this channel")]
    UnexpectedKind { found: &'static str },

    #[error("record store: {0}")]
    RecordStore(#[from] RecordStoreError),

    #[error("object store: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error("archive tier: {0}")]
    Archive(#[from] ArchiveError),

    #[error("compute: {0}")]
    Compute(#[from] ComputeError),

    #[error("channel: {0}")]
    Channel(#[from] ChannelError),

    /// The message names a job the store does not know (yet).
    #[error("no record for job {0}")]
    MissingRecord(JobId),

    #[error("{failed} of {total} restores failed")]
    PartialRestore { failed: usize, total: usize },
}

impl WorkerError {
    pub fn disposition(&self) -> Disposition {
        match self {
            WorkerError::Malformed(_)
            | WorkerError::UnexpectedKind { .. }
            | WorkerError::RecordStore(RecordStoreError::Rejected { .. }) => Disposition::Drop,
            _ => Disposition::Retry,
        }
    }
}

/// Successful handling result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The message's effect has been applied.
    Done,
    /// Nothing to do: the record is already past (or not in) the state this
    /// message acts on. The reason is logged.
    AlreadyHandled(&'static str),
    /// Not yet actionable; make the delivery visible again after this delay.
    Deferred(Duration),
}

pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle(&self, notification: Notification) -> Result<Outcome, WorkerError>;
}

impl<H> MessageHandler for Arc<H>
where
    H: MessageHandler + ?Sized,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn handle(&self, notification: Notification) -> Result<Outcome, WorkerError> {
        (**self).handle(notification)
    }
}

/// Per-cycle counters returned by [`WorkerRuntime::poll_once`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub received: usize,
    pub acknowledged: usize,
    /// Acknowledged without effect because the message was unusable.
    pub dropped: usize,
    pub deferred: usize,
    /// Left unacknowledged for redelivery.
    pub retried: usize,
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A cycle in progress finishes first; nothing it left unacknowledged is lost.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Wait for the worker thread without requesting shutdown.
    pub fn join(mut self) {
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Binds one handler to the channel it consumes.
pub struct WorkerRuntime<H> {
    channel: Arc<dyn NotificationChannel>,
    handler: H,
    poll: PollSettings,
}

impl<H> core::fmt::Debug for WorkerRuntime<H>
where
    H: MessageHandler,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("worker", &self.handler.name())
            .field("channel", &self.channel.name())
            .field("poll", &self.poll)
            .finish()
    }
}

impl<H> WorkerRuntime<H>
where
    H: MessageHandler,
{
    pub fn new(channel: Arc<dyn NotificationChannel>, handler: H, poll: PollSettings) -> Self {
        Self {
            channel,
            handler,
            poll,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// One receive/process/acknowledge cycle.
    pub fn poll_once(&self) -> Result<PollStats, ChannelError> {
        let deliveries = self
            .channel
            .receive(self.poll.batch_size, self.poll.wait)?;

        let mut stats = PollStats {
            received: deliveries.len(),
            ..PollStats::default()
        };
        for delivery in &deliveries {
            self.process(delivery, &mut stats);
        }
        Ok(stats)
    }

    fn process(&self, delivery: &Delivery, stats: &mut PollStats) {
        let worker = self.handler.name();
        let result = Notification::decode(&delivery.body)
            .map_err(WorkerError::from)
            .and_then(|n| self.handler.handle(n));

        match result {
            Ok(Outcome::Done) => {
                if self.acknowledge(delivery) {
                    stats.acknowledged += 1;
                }
            }
            Ok(Outcome::AlreadyHandled(reason)) => {
                info!(worker, message_id = %delivery.message_id, reason, "message already handled");
                if self.acknowledge(delivery) {
                    stats.acknowledged += 1;
                }
            }
            Ok(Outcome::Deferred(delay)) => {
                debug!(worker, message_id = %delivery.message_id, delay_secs = delay.as_secs(), "message deferred");
                match self.channel.change_visibility(delivery, delay) {
                    Ok(()) => stats.deferred += 1,
                    Err(e) => {
                        // Falls back to the ordinary visibility timeout.
                        warn!(worker, message_id = %delivery.message_id, error = %e, "failed to defer message");
                        stats.retried += 1;
                    }
                }
            }
            Err(err) => match err.disposition() {
                Disposition::Drop => {
                    warn!(worker, message_id = %delivery.message_id, error = %err, "dropping unusable message");
                    if self.acknowledge(delivery) {
                        stats.dropped += 1;
                    }
                }
                Disposition::Retry => {
                    warn!(
                        worker,
                        message_id = %delivery.message_id,
                        receive_count = delivery.receive_count,
                        error = %err,
                        "message left for redelivery"
                    );
                    stats.retried += 1;
                }
            },
        }
    }

    fn acknowledge(&self, delivery: &Delivery) -> bool {
        match self.channel.acknowledge(delivery) {
            Ok(()) => true,
            Err(e) => {
                // Another consumer owns the newer delivery; it will acknowledge.
                warn!(worker = self.handler.name(), message_id = %delivery.message_id, error = %e, "acknowledge failed");
                false
            }
        }
    }
}

impl<H> WorkerRuntime<H>
where
    H: MessageHandler + 'static,
{
    /// Run the loop on a named thread until the handle is shut down.
    pub fn spawn(self) -> std::io::Result<WorkerHandle> {
        let name = self.handler.name();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run(shutdown_rx))?;

        Ok(WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    fn run(self, shutdown_rx: mpsc::Receiver<()>) {
        let worker = self.handler.name();
        info!(worker, channel = self.channel.name(), "worker started");

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
                Err(mpsc::TryRecvError::Empty) => {}
            }

            match self.poll_once() {
                Ok(stats) if stats.received > 0 => {
                    debug!(worker, ?stats, "poll cycle finished");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(worker, error = %e, "receive failed");
                    if shutdown_rx.recv_timeout(self.poll.error_backoff).is_ok() {
                        break;
                    }
                }
            }
        }

        info!(worker, "worker stopped");
    }
}
