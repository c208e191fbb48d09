//! In-memory record store for tests/dev.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use strata_core::{ArchiveRef, DomainError, DomainResult, JobId, JobRecord, UserId};

use super::{RecordStore, RecordStoreError, RecordUpdate};
use crate::fault::FaultBudget;

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<JobId, JobRecord>,
    by_user: HashMap<UserId, BTreeSet<JobId>>,
    by_archive: HashMap<ArchiveRef, JobId>,
}

impl Tables {
    fn unindex(&mut self, record: &JobRecord) {
        if let Some(ids) = self.by_user.get_mut(&record.user_id) {
            ids.remove(&record.job_id);
        }
        if let Some(r) = &record.archive_reference {
            self.by_archive.remove(r);
        }
    }

    fn index(&mut self, record: &JobRecord) {
        self.by_user
            .entry(record.user_id)
            .or_default()
            .insert(record.job_id);
        if let Some(r) = &record.archive_reference {
            self.by_archive.insert(r.clone(), record.job_id);
        }
    }
}

fn check_transition(current: &JobRecord, next: &JobRecord) -> DomainResult<()> {
    if next.job_status != current.job_status
        && !current.job_status.can_transition_to(next.job_status)
    {
        return Err(DomainError::illegal_transition(current.job_status, next.job_status));
    }
    let (from, to) = (current.archive_state(), next.archive_state());
    if from != to {
        from.ensure_transition(to)?;
    }
    Ok(())
}

/// Record store backed by a `RwLock`ed map with secondary indexes on
/// `user_id` and `archive_reference`.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    tables: RwLock<Tables>,
    update_faults: FaultBudget,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `n` calls to `update` fail with `Unavailable`.
    pub fn fail_next_updates(&self, n: usize) {
        self.update_faults.arm(n);
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, RecordStoreError> {
        self.tables
            .read()
            .map_err(|_| RecordStoreError::Unavailable("lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, RecordStoreError> {
        self.tables
            .write()
            .map_err(|_| RecordStoreError::Unavailable("lock poisoned".into()))
    }
}

impl RecordStore for InMemoryRecordStore {
    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, RecordStoreError> {
        Ok(self.read()?.records.get(&job_id).cloned())
    }

    fn put(&self, record: JobRecord) -> Result<(), RecordStoreError> {
        record
            .check_invariants()
            .map_err(|source| RecordStoreError::Rejected {
                job_id: record.job_id,
                source,
            })?;

        let mut tables = self.write()?;
        if tables.records.contains_key(&record.job_id) {
            return Err(RecordStoreError::AlreadyExists(record.job_id));
        }
        tables.index(&record);
        tables.records.insert(record.job_id, record);
        Ok(())
    }

    fn update(&self, job_id: JobId, update: &RecordUpdate) -> Result<JobRecord, RecordStoreError> {
        if self.update_faults.trip() {
            return Err(RecordStoreError::Unavailable("injected update failure".into()));
        }

        let mut tables = self.write()?;
        let current = tables
            .records
            .get(&job_id)
            .ok_or(RecordStoreError::NotFound(job_id))?;

        if let Some(c) = update.failed_condition(current) {
            return Err(RecordStoreError::ConditionFailed {
                job_id,
                condition: c.to_string(),
            });
        }

        let mut next = current.clone();
        update.apply_to(&mut next);
        check_transition(current, &next)
            .and_then(|()| next.check_invariants())
            .map_err(|source| RecordStoreError::Rejected { job_id, source })?;

        let previous = current.clone();
        tables.unindex(&previous);
        tables.index(&next);
        tables.records.insert(job_id, next.clone());
        Ok(next)
    }

    fn query_by_user(&self, user_id: UserId) -> Result<Vec<JobRecord>, RecordStoreError> {
        let tables = self.read()?;
        let records = tables
            .by_user
            .get(&user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.records.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(records)
    }

    fn query_by_archive_reference(
        &self,
        archive_ref: &ArchiveRef,
    ) -> Result<Option<JobRecord>, RecordStoreError> {
        let tables = self.read()?;
        Ok(tables
            .by_archive
            .get(archive_ref)
            .and_then(|id| tables.records.get(id).cloned()))
    }
}
