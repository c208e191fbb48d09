//! In-memory wiring shared by worker and end-to-end tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use strata_core::{Clock, JobId, JobRecord, JobStatus, ManualClock, UserId, UserRole};
use strata_events::{InMemoryChannel, JobSubmitted, Notification, NotificationChannel};

use crate::archive::InMemoryArchiveTier;
use crate::compute::{ComputeError, ComputeOutcome, ComputeStep};
use crate::config::{PollSettings, WorkerConfig};
use crate::object_store::{InMemoryObjectStore, ObjectStore};
use crate::record_store::{InMemoryRecordStore, RecordStore};
use crate::workers::{
    ArchivalWorker, CompletionWorker, MessageHandler, RetrievalWorker, ThawWorker, WorkerRuntime,
};

pub(crate) const INPUT: &[u8] = b"gattaca";
pub(crate) const RESULT: &[u8] = b"GATTACA";

pub(crate) fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// Uppercases the input; inputs starting with `fail` produce a failed run.
pub(crate) struct UppercaseCompute {
    pub runs: AtomicUsize,
}

impl ComputeStep for UppercaseCompute {
    fn run(&self, _job: &JobRecord, input: &[u8]) -> Result<ComputeOutcome, ComputeError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if input.starts_with(b"fail") {
            return Ok(ComputeOutcome::Failed {
                reason: "annotator exited with status 1".into(),
            });
        }
        Ok(ComputeOutcome::Succeeded(input.to_ascii_uppercase()))
    }
}

pub(crate) struct Harness {
    pub clock: Arc<ManualClock>,
    pub config: WorkerConfig,
    pub records: Arc<InMemoryRecordStore>,
    pub objects: Arc<InMemoryObjectStore>,
    pub archive: Arc<InMemoryArchiveTier>,
    pub compute: Arc<UppercaseCompute>,
    pub submissions: Arc<InMemoryChannel>,
    pub results: Arc<InMemoryChannel>,
    pub restores: Arc<InMemoryChannel>,
    pub thaws: Arc<InMemoryChannel>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let mut config = WorkerConfig::default();
        config.poll = PollSettings {
            batch_size: 10,
            wait: Duration::ZERO,
            error_backoff: Duration::from_millis(10),
        };

        let channel = |name: &str| {
            Arc::new(
                InMemoryChannel::new(name)
                    .with_clock(clock.clone())
                    .with_visibility_timeout(config.visibility_timeout)
                    .with_max_receive_count(config.max_receive_count),
            )
        };
        let submissions = channel(&config.queues.submissions);
        let results = channel(&config.queues.results);
        let restores = channel(&config.queues.restores);
        let thaws = channel(&config.queues.thaws);

        let archive = Arc::new(InMemoryArchiveTier::new().with_clock(clock.clone()));
        archive.register_completion_channel(&config.queues.retrieval_completion, thaws.clone());

        Self {
            clock,
            records: InMemoryRecordStore::arc(),
            objects: InMemoryObjectStore::arc(),
            archive,
            compute: Arc::new(UppercaseCompute {
                runs: AtomicUsize::new(0),
            }),
            submissions,
            results,
            restores,
            thaws,
            config,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn compute_runs(&self) -> usize {
        self.compute.runs.load(Ordering::SeqCst)
    }

    /// Advance past the retention grace period.
    pub fn elapse_grace(&self) {
        let grace = chrono::Duration::from_std(self.config.retention_grace).unwrap();
        self.clock.advance(grace + chrono::Duration::seconds(1));
    }

    /// Advance past the channel visibility timeout so unacknowledged
    /// deliveries become visible again.
    pub fn elapse_visibility(&self) {
        let vt = chrono::Duration::from_std(self.config.visibility_timeout).unwrap();
        self.clock.advance(vt + chrono::Duration::seconds(1));
    }

    pub fn completion_worker(&self) -> CompletionWorker {
        CompletionWorker::new(
            self.records.clone(),
            self.objects.clone(),
            self.compute.clone(),
            self.results.clone(),
            self.config.buckets.clone(),
            self.clock(),
        )
    }

    pub fn archival_worker(&self) -> ArchivalWorker {
        ArchivalWorker::new(
            self.records.clone(),
            self.objects.clone(),
            self.archive.clone(),
            self.config.buckets.clone(),
            self.config.retention_grace,
            self.clock(),
        )
    }

    pub fn retrieval_worker(&self) -> RetrievalWorker {
        RetrievalWorker::new(
            self.records.clone(),
            self.archive.clone(),
            self.config.queues.retrieval_completion.clone(),
        )
    }

    pub fn thaw_worker(&self) -> ThawWorker {
        ThawWorker::new(
            self.records.clone(),
            self.objects.clone(),
            self.archive.clone(),
            self.config.buckets.clone(),
        )
    }

    pub fn runtime<H: MessageHandler>(
        &self,
        channel: &Arc<InMemoryChannel>,
        handler: H,
    ) -> WorkerRuntime<H> {
        WorkerRuntime::new(channel.clone(), handler, self.config.poll.clone())
    }

    /// Store a PENDING record plus its input object and publish the
    /// submission notification.
    pub fn submit(&self, user_id: UserId, role: UserRole, input: &[u8]) -> JobRecord {
        let job_id = JobId::new();
        let input_key = format!("{user_id}/{job_id}.vcf");
        let record = JobRecord::submitted(job_id, user_id, role, &input_key, self.clock.now());

        self.objects
            .put(&self.config.buckets.inputs, &input_key, input.to_vec())
            .unwrap();
        self.records.put(record.clone()).unwrap();
        self.submissions
            .publish_notification(&Notification::JobSubmitted(JobSubmitted {
                job_id,
                input_reference: input_key,
                user_id: Some(user_id),
            }))
            .unwrap();
        record
    }

    /// Store a record that completed now, with its result in the hot store.
    pub fn completed(&self, user_id: UserId, role: UserRole) -> JobRecord {
        let job_id = JobId::new();
        let result_key = self.config.buckets.result_key(user_id, job_id);
        let mut record =
            JobRecord::submitted(job_id, user_id, role, format!("{user_id}/{job_id}.vcf"), self.clock.now());
        record.job_status = JobStatus::Completed;
        record.complete_time = Some(self.clock.now());
        record.result_reference = Some(result_key.clone());

        self.objects
            .put(&self.config.buckets.results, &result_key, RESULT.to_vec())
            .unwrap();
        self.records.put(record.clone()).unwrap();
        record
    }

    pub fn record(&self, job_id: JobId) -> JobRecord {
        self.records.get(job_id).unwrap().unwrap()
    }

    pub fn hot_result_exists(&self, record: &JobRecord) -> bool {
        let key = self.config.buckets.result_key(record.user_id, record.job_id);
        self.objects.contains(&self.config.buckets.results, &key)
    }
}
