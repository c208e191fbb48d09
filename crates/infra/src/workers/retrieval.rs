//! Retrieval worker: handles the restore request sent when a user's account
//! is upgraded.
//!
//! Every record of the user is raised to the privileged role so its result is
//! never archived again. Each ARCHIVED result is then tried at the expedited
//! tier first and, on a capacity rejection, exactly once more at the standard
//! tier. A record whose retrieval could not be started at either tier is left
//! ARCHIVED; only a new restore request retries it.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use strata_core::{ArchiveRef, ArchiveState, JobRecord, RetrievalRef, UserId, UserRole};
use strata_events::Notification;

use crate::archive::{ArchiveError, ArchiveTier, RetrievalTier};
use crate::record_store::{Condition, FieldUpdate, RecordStore, RecordUpdate};

use super::{MessageHandler, Outcome, WorkerError};

/// What happened to one archived record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreStep {
    Initiated(RetrievalTier),
    /// Both tiers refused for lack of capacity.
    Rejected,
    /// Nothing to do for this record any more.
    Skipped,
}

pub struct RetrievalWorker {
    records: Arc<dyn RecordStore>,
    archive: Arc<dyn ArchiveTier>,
    /// Channel the archive tier reports completions to.
    completion_channel: String,
}

impl RetrievalWorker {
    pub fn new(
        records: Arc<dyn RecordStore>,
        archive: Arc<dyn ArchiveTier>,
        completion_channel: impl Into<String>,
    ) -> Self {
        Self {
            records,
            archive,
            completion_channel: completion_channel.into(),
        }
    }

    pub fn restore(&self, user_id: UserId) -> Result<Outcome, WorkerError> {
        let records = self.records.query_by_user(user_id)?;

        let total = records.len();
        let mut archived = 0;
        let mut upgraded = 0;
        let mut failed = 0;
        let mut rejected = 0;
        for record in &records {
            let step = if record.archive_state() == ArchiveState::Archived {
                archived += 1;
                self.restore_one(record)
            } else {
                Ok(RestoreStep::Skipped)
            };

            match step {
                Ok(RestoreStep::Initiated(tier)) => {
                    info!(job_id = %record.job_id, %tier, "retrieval initiated");
                    continue;
                }
                Ok(RestoreStep::Rejected) => rejected += 1,
                Ok(RestoreStep::Skipped) => {}
                Err(e) => {
                    warn!(job_id = %record.job_id, error = %e, "retrieval not started");
                    failed += 1;
                    continue;
                }
            }

            match self.upgrade_role(record) {
                Ok(true) => upgraded += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(job_id = %record.job_id, error = %e, "role upgrade not recorded");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(WorkerError::PartialRestore { failed, total });
        }
        if rejected > 0 {
            error!(%user_id, rejected, archived, "restore incomplete; a new restore request is required");
        }
        if archived == 0 && upgraded == 0 {
            return Ok(Outcome::AlreadyHandled("no archived results for user"));
        }
        Ok(Outcome::Done)
    }

    /// Raise a record to the privileged role outside a retrieval update.
    /// `false` when it already had it.
    fn upgrade_role(&self, record: &JobRecord) -> Result<bool, WorkerError> {
        if record.user_role.is_archival_exempt() {
            return Ok(false);
        }
        let update = RecordUpdate::new().set(FieldUpdate::UserRole(UserRole::Privileged));
        self.records.update(record.job_id, &update)?;
        debug!(job_id = %record.job_id, "user role upgraded");
        Ok(true)
    }

    /// Start a retrieval for one ARCHIVED record and record its reference.
    pub fn restore_one(&self, record: &JobRecord) -> Result<RestoreStep, WorkerError> {
        let Some(archive_ref) = record.archive_reference.as_ref() else {
            return Ok(RestoreStep::Skipped);
        };
        if record.retrieval_reference.is_some() {
            return Ok(RestoreStep::Skipped);
        }

        let (retrieval_ref, tier) = match self.initiate_with_fallback(record, archive_ref) {
            Ok(Some(started)) => started,
            Ok(None) => return Ok(RestoreStep::Rejected),
            Err(ArchiveError::NotFound(_)) => {
                error!(job_id = %record.job_id, archive_reference = %archive_ref, "archive copy missing; cannot restore");
                return Ok(RestoreStep::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        let update = RecordUpdate::new()
            .set(FieldUpdate::RetrievalReference(Some(retrieval_ref.clone())))
            .set(FieldUpdate::UserRole(UserRole::Privileged))
            .when(Condition::ArchiveReferenceIs(archive_ref.clone()))
            .when(Condition::RetrievalReferenceAbsent);

        match self.records.update(record.job_id, &update) {
            Ok(_) => Ok(RestoreStep::Initiated(tier)),
            Err(e) if e.is_condition_failed() => {
                // Another delivery already started one; its thaw wins.
                debug!(job_id = %record.job_id, retrieval = %retrieval_ref, "retrieval already outstanding");
                Ok(RestoreStep::Skipped)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Expedited first, standard once on a capacity rejection.
    /// `Ok(None)` when both tiers rejected.
    fn initiate_with_fallback(
        &self,
        record: &JobRecord,
        archive_ref: &ArchiveRef,
    ) -> Result<Option<(RetrievalRef, RetrievalTier)>, ArchiveError> {
        let expedited = self.archive.initiate_retrieval(
            archive_ref,
            RetrievalTier::Expedited,
            &self.completion_channel,
        );
        match expedited {
            Ok(r) => return Ok(Some((r, RetrievalTier::Expedited))),
            Err(ArchiveError::InsufficientCapacity(_)) => {
                info!(job_id = %record.job_id, "expedited retrieval rejected; falling back to standard");
            }
            Err(e) => return Err(e),
        }

        match self.archive.initiate_retrieval(
            archive_ref,
            RetrievalTier::Standard,
            &self.completion_channel,
        ) {
            Ok(r) => Ok(Some((r, RetrievalTier::Standard))),
            Err(ArchiveError::InsufficientCapacity(_)) => {
                error!(
                    job_id = %record.job_id,
                    archive_reference = %archive_ref,
                    "standard retrieval also rejected; record stays archived"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl MessageHandler for RetrievalWorker {
    fn name(&self) -> &'static str {
        "retrieval"
    }

    fn handle(&self, notification: Notification) -> Result<Outcome, WorkerError> {
        match notification {
            Notification::RestoreRequested(msg) => self.restore(msg.user_id),
            other => Err(WorkerError::UnexpectedKind {
                found: other.kind(),
            }),
        }
    }
}
