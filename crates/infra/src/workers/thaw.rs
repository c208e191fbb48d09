//! Thaw worker: brings a retrieved archive back into the hot store.
//!
//! Order matters. The hot copy is written before the archive copy is deleted,
//! and the record is cleared last, so a crash at any step leaves either the
//! archive copy or the record still pointing at a readable source.

use std::sync::Arc;

use tracing::{debug, info, warn};

use strata_core::ArchiveState;
use strata_events::{ArchiveRetrievalCompleted, Notification, RetrievalStatus};

use crate::archive::{ArchiveError, ArchiveTier};
use crate::config::Buckets;
use crate::object_store::ObjectStore;
use crate::record_store::{Condition, FieldUpdate, RecordStore, RecordUpdate};

use super::{MessageHandler, Outcome, WorkerError};

pub struct ThawWorker {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    archive: Arc<dyn ArchiveTier>,
    buckets: Buckets,
}

impl ThawWorker {
    pub fn new(
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
        archive: Arc<dyn ArchiveTier>,
        buckets: Buckets,
    ) -> Self {
        Self {
            records,
            objects,
            archive,
            buckets,
        }
    }

    pub fn thaw(&self, msg: &ArchiveRetrievalCompleted) -> Result<Outcome, WorkerError> {
        if msg.status_code != RetrievalStatus::Succeeded {
            warn!(
                retrieval = %msg.retrieval_job_id,
                archive_reference = %msg.archive_reference,
                status = ?msg.status_code,
                "retrieval did not succeed; restore must be re-triggered"
            );
            return Ok(Outcome::AlreadyHandled("retrieval did not succeed"));
        }

        let Some(record) = self
            .records
            .query_by_archive_reference(&msg.archive_reference)?
        else {
            return Ok(Outcome::AlreadyHandled("no record holds this archive reference"));
        };
        if record.archive_state() != ArchiveState::Retrieving {
            debug!(job_id = %record.job_id, state = %record.archive_state(), "record not awaiting a thaw");
            return Ok(Outcome::AlreadyHandled("record not awaiting a thaw"));
        }
        if record.retrieval_reference.as_ref() != Some(&msg.retrieval_job_id) {
            debug!(
                job_id = %record.job_id,
                retrieval = %msg.retrieval_job_id,
                "completion is for a superseded retrieval; restoring from it anyway"
            );
        }

        let key = record
            .result_reference
            .clone()
            .unwrap_or_else(|| self.buckets.result_key(record.user_id, record.job_id));

        let bytes = self.archive.fetch_retrieved(&msg.retrieval_job_id)?;
        self.objects.put(&self.buckets.results, &key, bytes)?;

        match self.archive.delete(&msg.archive_reference) {
            Ok(()) | Err(ArchiveError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let update = RecordUpdate::new()
            .set(FieldUpdate::ArchiveReference(None))
            .set(FieldUpdate::RetrievalReference(None))
            .set(FieldUpdate::ResultReference(key))
            .when(Condition::ArchiveReferenceIs(msg.archive_reference.clone()))
            .when(Condition::RetrievalReferencePresent);

        match self.records.update(record.job_id, &update) {
            Ok(_) => {
                info!(job_id = %record.job_id, archive_reference = %msg.archive_reference, "result restored to hot store");
                Ok(Outcome::Done)
            }
            Err(e) if e.is_condition_failed() => Ok(Outcome::AlreadyHandled("thawed by another delivery")),
            Err(e) => Err(e.into()),
        }
    }
}

impl MessageHandler for ThawWorker {
    fn name(&self) -> &'static str {
        "thaw"
    }

    fn handle(&self, notification: Notification) -> Result<Outcome, WorkerError> {
        match notification {
            Notification::ArchiveRetrievalCompleted(msg) => self.thaw(&msg),
            other => Err(WorkerError::UnexpectedKind {
                found: other.kind(),
            }),
        }
    }
}
