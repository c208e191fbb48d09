//! Completion worker: runs submitted jobs and records their outcome.
//!
//! Status only moves forward (`PENDING -> RUNNING -> COMPLETED | FAILED`).
//! Every record write is conditional on the status the worker observed, so a
//! duplicate delivery racing this one cannot move a job backwards.

use std::sync::Arc;

use tracing::{info, warn};

use strata_core::{Clock, JobRecord, JobStatus};
use strata_events::{JobFinished, JobSubmitted, Notification, NotificationChannel};

use crate::compute::{ComputeOutcome, ComputeStep};
use crate::config::Buckets;
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::record_store::{Condition, FieldUpdate, RecordStore, RecordStoreError, RecordUpdate};

use super::{MessageHandler, Outcome, WorkerError};

pub struct CompletionWorker {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    compute: Arc<dyn ComputeStep>,
    /// Where terminal job events go (archival worker, notifier).
    results: Arc<dyn NotificationChannel>,
    buckets: Buckets,
    clock: Arc<dyn Clock>,
}

impl CompletionWorker {
    pub fn new(
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
        compute: Arc<dyn ComputeStep>,
        results: Arc<dyn NotificationChannel>,
        buckets: Buckets,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            records,
            objects,
            compute,
            results,
            buckets,
            clock,
        }
    }

    pub fn complete(&self, msg: &JobSubmitted) -> Result<Outcome, WorkerError> {
        let record = self
            .records
            .get(msg.job_id)?
            .ok_or(WorkerError::MissingRecord(msg.job_id))?;

        if let Some(owner) = msg.user_id
            && owner != record.user_id
        {
            warn!(job_id = %msg.job_id, message_user = %owner, record_user = %record.user_id, "submission user does not match record owner");
        }

        let record = match record.job_status {
            JobStatus::Completed | JobStatus::Failed => {
                // A crash may have landed between the update and the publish.
                self.publish_finished(&record)?;
                return Ok(Outcome::AlreadyHandled("job already terminal"));
            }
            JobStatus::Running => {
                info!(job_id = %record.job_id, "job left RUNNING by an earlier delivery; recomputing");
                record
            }
            JobStatus::Pending => {
                let claim = RecordUpdate::new()
                    .set(FieldUpdate::JobStatus(JobStatus::Running))
                    .when(Condition::StatusIs(JobStatus::Pending));
                match self.records.update(record.job_id, &claim) {
                    Ok(updated) => updated,
                    Err(e) if e.is_condition_failed() => {
                        return Ok(Outcome::AlreadyHandled("job claimed by another delivery"));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let finished = match self.objects.get(&self.buckets.inputs, &msg.input_reference) {
            Ok(input) => self.run_compute(&record, &input)?,
            Err(ObjectStoreError::NotFound { .. }) => {
                warn!(job_id = %record.job_id, input = %msg.input_reference, "input object missing; failing job");
                self.finish(&record, RecordUpdate::new().set(FieldUpdate::JobStatus(JobStatus::Failed)))?
            }
            Err(e) => return Err(e.into()),
        };

        let Some(finished) = finished else {
            return Ok(Outcome::AlreadyHandled("job finished by another delivery"));
        };
        self.publish_finished(&finished)?;
        info!(job_id = %finished.job_id, status = %finished.job_status, "job finished");
        Ok(Outcome::Done)
    }

    fn run_compute(&self, record: &JobRecord, input: &[u8]) -> Result<Option<JobRecord>, WorkerError> {
        match self.compute.run(record, input)? {
            ComputeOutcome::Succeeded(bytes) => {
                let key = self.buckets.result_key(record.user_id, record.job_id);
                // Deterministic key: a recomputation overwrites the same object.
                self.objects.put(&self.buckets.results, &key, bytes)?;
                self.finish(
                    record,
                    RecordUpdate::new()
                        .set(FieldUpdate::JobStatus(JobStatus::Completed))
                        .set(FieldUpdate::ResultReference(key)),
                )
            }
            ComputeOutcome::Failed { reason } => {
                warn!(job_id = %record.job_id, %reason, "compute step failed");
                self.finish(record, RecordUpdate::new().set(FieldUpdate::JobStatus(JobStatus::Failed)))
            }
        }
    }

    /// Apply a terminal update. `None` when a concurrent delivery got there first.
    fn finish(&self, record: &JobRecord, update: RecordUpdate) -> Result<Option<JobRecord>, WorkerError> {
        let update = update
            .set(FieldUpdate::CompleteTime(self.clock.now()))
            .when(Condition::StatusIs(JobStatus::Running));

        match self.records.update(record.job_id, &update) {
            Ok(updated) => Ok(Some(updated)),
            Err(RecordStoreError::ConditionFailed { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn publish_finished(&self, record: &JobRecord) -> Result<(), WorkerError> {
        let event = Notification::JobFinished(JobFinished {
            job_id: record.job_id,
            job_status: record.job_status,
            result_reference: record.result_reference.clone(),
        });
        self.results.publish_notification(&event)?;
        Ok(())
    }
}

impl MessageHandler for CompletionWorker {
    fn name(&self) -> &'static str {
        "completion"
    }

    fn handle(&self, notification: Notification) -> Result<Outcome, WorkerError> {
        match notification {
            Notification::JobSubmitted(msg) => self.complete(&msg),
            other => Err(WorkerError::UnexpectedKind {
                found: other.kind(),
            }),
        }
    }
}
