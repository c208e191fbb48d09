//! Infrastructure layer: storage backends, the archive tier, configuration
//! and the four message-driven workers.

pub mod archive;
pub mod compute;
pub mod config;
pub mod object_store;
pub mod record_store;
pub mod workers;

mod fault;

#[cfg(test)]
pub(crate) mod test_support;

pub use archive::{ArchiveError, ArchiveTier, InMemoryArchiveTier, RetrievalTier};
pub use compute::{CommandCompute, ComputeError, ComputeOutcome, ComputeStep};
pub use config::{Buckets, ComputeConfig, ConfigError, PollSettings, QueueNames, WorkerConfig};
pub use object_store::{InMemoryObjectStore, ObjectStore, ObjectStoreError};
pub use record_store::{InMemoryRecordStore, RecordStore, RecordStoreError};
pub use workers::{
    ArchivalWorker, CompletionWorker, Disposition, MessageHandler, Outcome, PollStats,
    RetrievalWorker, ThawWorker, WorkerError, WorkerHandle, WorkerRuntime,
};
