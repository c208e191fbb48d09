//! Archival worker: moves results of standard accounts to the cold tier
//! once the retention grace period has passed.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use strata_core::{ArchiveRef, ArchiveState, Clock, JobRecord, JobStatus};
use strata_events::{JobFinished, Notification};

use crate::archive::ArchiveTier;
use crate::config::Buckets;
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::record_store::{Condition, FieldUpdate, RecordStore, RecordUpdate};

use super::{MessageHandler, Outcome, WorkerError};

pub struct ArchivalWorker {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    archive: Arc<dyn ArchiveTier>,
    buckets: Buckets,
    retention_grace: Duration,
    clock: Arc<dyn Clock>,
}

impl ArchivalWorker {
    pub fn new(
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
        archive: Arc<dyn ArchiveTier>,
        buckets: Buckets,
        retention_grace: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            records,
            objects,
            archive,
            buckets,
            retention_grace,
            clock,
        }
    }

    pub fn archive(&self, msg: &JobFinished) -> Result<Outcome, WorkerError> {
        let record = self
            .records
            .get(msg.job_id)?
            .ok_or(WorkerError::MissingRecord(msg.job_id))?;

        if record.user_role.is_archival_exempt() {
            debug!(job_id = %record.job_id, role = %record.user_role, "account exempt from archival");
            return Ok(Outcome::AlreadyHandled("account exempt from archival"));
        }
        if record.job_status != JobStatus::Completed {
            return Ok(Outcome::AlreadyHandled("job has no result to archive"));
        }
        let Some(result_key) = record.result_reference.clone() else {
            return Ok(Outcome::AlreadyHandled("job has no result to archive"));
        };

        match record.archive_state() {
            ArchiveState::None => {}
            ArchiveState::Archived => {
                // An earlier delivery may have died before removing the hot copy.
                self.objects.delete(&self.buckets.results, &result_key)?;
                return Ok(Outcome::AlreadyHandled("result already archived"));
            }
            ArchiveState::Retrieving => {
                return Ok(Outcome::AlreadyHandled("result is being retrieved"));
            }
        }

        if record.complete_time.is_none() {
            warn!(job_id = %record.job_id, "completed record has no complete_time; retention grace cannot start");
            return Ok(Outcome::AlreadyHandled("job has no completion time"));
        }
        if let Some(wait) = record.retention_remaining(self.retention_grace, self.clock.now()) {
            debug!(job_id = %record.job_id, wait_secs = wait.as_secs(), "retention grace not yet elapsed");
            return Ok(Outcome::Deferred(wait));
        }

        let bytes = match self.objects.get(&self.buckets.results, &result_key) {
            Ok(bytes) => bytes,
            Err(ObjectStoreError::NotFound { .. }) => {
                warn!(job_id = %record.job_id, key = %result_key, "result object missing from hot store; nothing to archive");
                return Ok(Outcome::AlreadyHandled("result object missing"));
            }
            Err(e) => return Err(e.into()),
        };

        let archive_ref = self.archive.store(bytes)?;
        let update = RecordUpdate::new()
            .set(FieldUpdate::ArchiveReference(Some(archive_ref.clone())))
            .when(Condition::StatusIs(JobStatus::Completed))
            .when(Condition::UserRoleIs(record.user_role))
            .when(Condition::ArchiveReferenceAbsent)
            .when(Condition::RetrievalReferenceAbsent);

        match self.records.update(record.job_id, &update) {
            Ok(_) => {}
            Err(e) if e.is_condition_failed() => {
                info!(job_id = %record.job_id, "record archived or upgraded concurrently; discarding new copy");
                self.discard_copy(&record, &archive_ref);
                return Ok(Outcome::AlreadyHandled("record changed by another worker"));
            }
            Err(e) => {
                self.discard_copy(&record, &archive_ref);
                return Err(e.into());
            }
        }

        self.objects.delete(&self.buckets.results, &result_key)?;
        info!(job_id = %record.job_id, archive_reference = %archive_ref, "result archived");
        Ok(Outcome::Done)
    }

    /// Remove an archive copy no record points at.
    fn discard_copy(&self, record: &JobRecord, archive_ref: &ArchiveRef) {
        if let Err(e) = self.archive.delete(archive_ref) {
            error!(
                job_id = %record.job_id,
                archive_reference = %archive_ref,
                error = %e,
                "orphaned archive copy; needs out-of-band reconciliation"
            );
        }
    }
}

impl MessageHandler for ArchivalWorker {
    fn name(&self) -> &'static str {
        "archival"
    }

    fn handle(&self, notification: Notification) -> Result<Outcome, WorkerError> {
        match notification {
            Notification::JobFinished(msg) => self.archive(&msg),
            other => Err(WorkerError::UnexpectedKind {
                found: other.kind(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use proptest::prelude::*;
    use strata_core::{UserId, UserRole};
    use strata_events::NotificationChannel;

    fn finished(record: &JobRecord) -> JobFinished {
        JobFinished {
            job_id: record.job_id,
            job_status: record.job_status,
            result_reference: record.result_reference.clone(),
        }
    }

    #[test]
    fn standard_result_is_archived_after_grace() {
        let h = Harness::new();
        let job = h.completed(UserId::new(), UserRole::Standard);
        let worker = h.archival_worker();

        assert_eq!(
            worker.archive(&finished(&job)).unwrap(),
            Outcome::Deferred(h.config.retention_grace)
        );
        assert_eq!(h.record(job.job_id).archive_state(), ArchiveState::None);

        h.elapse_grace();
        assert_eq!(worker.archive(&finished(&job)).unwrap(), Outcome::Done);

        let record = h.record(job.job_id);
        assert_eq!(record.archive_state(), ArchiveState::Archived);
        assert!(h.archive.contains(record.archive_reference.as_ref().unwrap()));
        assert!(!h.hot_result_exists(&record));
        assert_eq!(record.result_reference, job.result_reference);
    }

    #[test]
    fn deferral_uses_visibility_delay() {
        let h = Harness::new();
        let job = h.completed(UserId::new(), UserRole::Standard);
        h.results
            .publish_notification(&Notification::JobFinished(finished(&job)))
            .unwrap();
        let runtime = h.runtime(&h.results, h.archival_worker());

        h.clock.advance(chrono::Duration::seconds(100));
        let stats = runtime.poll_once().unwrap();
        assert_eq!(stats.deferred, 1);
        assert_eq!(h.results.len(), 1);

        // Still hidden just before the grace period ends.
        h.clock.advance(chrono::Duration::seconds(199));
        assert_eq!(runtime.poll_once().unwrap().received, 0);

        h.clock.advance(chrono::Duration::seconds(1));
        let stats = runtime.poll_once().unwrap();
        assert_eq!(stats.acknowledged, 1);
        assert!(h.results.is_empty());
        assert_eq!(h.record(job.job_id).archive_state(), ArchiveState::Archived);
    }

    #[test]
    fn privileged_result_is_never_archived() {
        let h = Harness::new();
        let job = h.completed(UserId::new(), UserRole::Privileged);
        let worker = h.archival_worker();

        h.clock.advance(chrono::Duration::days(365));
        assert_eq!(
            worker.archive(&finished(&job)).unwrap(),
            Outcome::AlreadyHandled("account exempt from archival")
        );
        assert_eq!(h.archive.archive_count(), 0);
        assert!(h.hot_result_exists(&job));
    }

    #[test]
    fn redelivery_only_ensures_hot_copy_is_gone() {
        let h = Harness::new();
        let job = h.completed(UserId::new(), UserRole::Standard);
        let worker = h.archival_worker();
        h.elapse_grace();

        h.objects.fail_next_deletes(1);
        assert!(matches!(
            worker.archive(&finished(&job)),
            Err(WorkerError::ObjectStore(_))
        ));
        let archived = h.record(job.job_id);
        assert_eq!(archived.archive_state(), ArchiveState::Archived);
        assert!(h.hot_result_exists(&job));

        assert_eq!(
            worker.archive(&finished(&job)).unwrap(),
            Outcome::AlreadyHandled("result already archived")
        );
        assert!(!h.hot_result_exists(&job));
        assert_eq!(h.record(job.job_id), archived);
        assert_eq!(h.archive.archive_count(), 1);
    }

    #[test]
    fn failed_jobs_are_not_archived() {
        let h = Harness::new();
        let mut job = JobRecord::submitted(
            strata_core::JobId::new(),
            UserId::new(),
            UserRole::Standard,
            "in.vcf",
            h.clock.now(),
        );
        job.job_status = JobStatus::Failed;
        job.complete_time = Some(h.clock.now());
        h.records.put(job.clone()).unwrap();
        h.elapse_grace();

        assert!(matches!(
            h.archival_worker().archive(&finished(&job)).unwrap(),
            Outcome::AlreadyHandled(_)
        ));
        assert_eq!(h.archive.archive_count(), 0);
    }

    #[test]
    fn record_update_failure_removes_new_copy() {
        let h = Harness::new();
        let job = h.completed(UserId::new(), UserRole::Standard);
        let worker = h.archival_worker();
        h.elapse_grace();

        h.records.fail_next_updates(1);
        let err = worker.archive(&finished(&job)).unwrap_err();
        assert!(matches!(err, WorkerError::RecordStore(_)));
        assert_eq!(h.archive.archive_count(), 0);
        assert!(h.hot_result_exists(&job));

        assert_eq!(worker.archive(&finished(&job)).unwrap(), Outcome::Done);
        assert_eq!(h.archive.archive_count(), 1);
    }

    #[test]
    fn archive_tier_outage_leaves_message_for_retry() {
        let h = Harness::new();
        let job = h.completed(UserId::new(), UserRole::Standard);
        h.elapse_grace();
        h.archive.fail_next_stores(1);

        let err = h.archival_worker().archive(&finished(&job)).unwrap_err();
        assert!(matches!(err, WorkerError::Archive(_)));
        assert_eq!(h.record(job.job_id).archive_state(), ArchiveState::None);
        assert!(h.hot_result_exists(&job));
    }

    #[test]
    fn record_without_completion_time_is_left_alone() {
        let h = Harness::new();
        let mut job = JobRecord::submitted(
            strata_core::JobId::new(),
            UserId::new(),
            UserRole::Standard,
            "in.vcf",
            h.clock.now(),
        );
        job.job_status = JobStatus::Completed;
        job.result_reference = Some(h.config.buckets.result_key(job.user_id, job.job_id));
        h.records.put(job.clone()).unwrap();
        h.clock.advance(chrono::Duration::days(30));

        assert_eq!(
            h.archival_worker().archive(&finished(&job)).unwrap(),
            Outcome::AlreadyHandled("job has no completion time")
        );
        assert_eq!(h.archive.archive_count(), 0);
        assert_eq!(h.record(job.job_id), job);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn never_archived_before_grace(elapsed in 0i64..300) {
            let h = Harness::new();
            let job = h.completed(UserId::new(), UserRole::Standard);
            h.clock.advance(chrono::Duration::seconds(elapsed));

            let outcome = h.archival_worker().archive(&finished(&job)).unwrap();
            prop_assert_eq!(
                outcome,
                Outcome::Deferred(Duration::from_secs((300 - elapsed) as u64))
            );
            prop_assert_eq!(h.archive.archive_count(), 0);
            prop_assert!(h.hot_result_exists(&job));
        }

        #[test]
        fn privileged_never_archived(elapsed in 0i64..10_000_000) {
            let h = Harness::new();
            let job = h.completed(UserId::new(), UserRole::Privileged);
            h.clock.advance(chrono::Duration::seconds(elapsed));

            h.archival_worker().archive(&finished(&job)).unwrap();
            prop_assert_eq!(h.record(job.job_id).archive_state(), ArchiveState::None);
            prop_assert!(h.hot_result_exists(&job));
        }
    }
}
