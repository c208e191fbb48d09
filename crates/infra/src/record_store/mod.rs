//! Durable job-record storage.
//!
//! Updates are partial and atomic per call, and may carry conditions that
//! are evaluated against the stored record inside the same atomic step
//! (compare-and-set). Workers still perform their own check-then-act guards;
//! the conditions only stop two concurrent deliveries from both winning.
//! Stores also refuse any update that moves `job_status` or the archive
//! sub-state along an edge the lifecycle does not allow.

pub mod in_memory;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use strata_core::{
    ArchiveRef, DomainError, JobId, JobRecord, JobStatus, RetrievalRef, UserId, UserRole,
};

pub use in_memory::InMemoryRecordStore;

/// A single field assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldUpdate {
    JobStatus(JobStatus),
    UserRole(UserRole),
    ResultReference(String),
    CompleteTime(DateTime<Utc>),
    /// `None` removes the attribute.
    ArchiveReference(Option<ArchiveRef>),
    /// `None` removes the attribute.
    RetrievalReference(Option<RetrievalRef>),
}

/// Precondition on the stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    StatusIs(JobStatus),
    UserRoleIs(UserRole),
    ArchiveReferenceAbsent,
    ArchiveReferenceIs(ArchiveRef),
    RetrievalReferenceAbsent,
    RetrievalReferencePresent,
}

impl Condition {
    pub fn holds(&self, record: &JobRecord) -> bool {
        match self {
            Condition::StatusIs(s) => record.job_status == *s,
            Condition::UserRoleIs(r) => record.user_role == *r,
            Condition::ArchiveReferenceAbsent => record.archive_reference.is_none(),
            Condition::ArchiveReferenceIs(r) => record.is_archived_as(r),
            Condition::RetrievalReferenceAbsent => record.retrieval_reference.is_none(),
            Condition::RetrievalReferencePresent => record.retrieval_reference.is_some(),
        }
    }
}

impl core::fmt::Display for Condition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Condition::StatusIs(s) => write!(f, "job_status = {s}"),
            Condition::UserRoleIs(r) => write!(f, "user_role = {r}"),
            Condition::ArchiveReferenceAbsent => f.write_str("archive_reference absent"),
            Condition::ArchiveReferenceIs(r) => write!(f, "archive_reference = {r}"),
            Condition::RetrievalReferenceAbsent => f.write_str("retrieval_reference absent"),
            Condition::RetrievalReferencePresent => f.write_str("retrieval_reference present"),
        }
    }
}

/// A partial, optionally conditional, record update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub set: Vec<FieldUpdate>,
    pub when: Vec<Condition>,
}

impl RecordUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: FieldUpdate) -> Self {
        self.set.push(field);
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.when.push(condition);
        self
    }

    /// First condition that does not hold for `record`, if any.
    pub fn failed_condition(&self, record: &JobRecord) -> Option<&Condition> {
        self.when.iter().find(|c| !c.holds(record))
    }

    pub fn apply_to(&self, record: &mut JobRecord) {
        for field in &self.set {
            match field {
                FieldUpdate::JobStatus(s) => record.job_status = *s,
                FieldUpdate::UserRole(r) => record.user_role = *r,
                FieldUpdate::ResultReference(r) => record.result_reference = Some(r.clone()),
                FieldUpdate::CompleteTime(t) => record.complete_time = Some(*t),
                FieldUpdate::ArchiveReference(r) => record.archive_reference = r.clone(),
                FieldUpdate::RetrievalReference(r) => record.retrieval_reference = r.clone(),
            }
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("condition failed for job {job_id}: {condition}")]
    ConditionFailed { job_id: JobId, condition: String },

    /// The update would leave the record violating a domain invariant or
    /// make an illegal status or archive-state transition.
    #[error("rejected update for job {job_id}: {source}")]
    Rejected {
        job_id: JobId,
        #[source]
        source: DomainError,
    },

    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

impl RecordStoreError {
    pub fn is_condition_failed(&self) -> bool {
        matches!(self, RecordStoreError::ConditionFailed { .. })
    }
}

/// Record store abstraction.
pub trait RecordStore: Send + Sync {
    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, RecordStoreError>;

    /// Create a new record.
    fn put(&self, record: JobRecord) -> Result<(), RecordStoreError>;

    /// Apply a partial update atomically; returns the record as stored afterwards.
    fn update(&self, job_id: JobId, update: &RecordUpdate) -> Result<JobRecord, RecordStoreError>;

    /// All records owned by a user.
    fn query_by_user(&self, user_id: UserId) -> Result<Vec<JobRecord>, RecordStoreError>;

    /// The record currently holding an archive reference.
    fn query_by_archive_reference(
        &self,
        archive_ref: &ArchiveRef,
    ) -> Result<Option<JobRecord>, RecordStoreError>;
}

impl<S> RecordStore for Arc<S>
where
    S: RecordStore + ?Sized,
{
    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, RecordStoreError> {
        (**self).get(job_id)
    }

    fn put(&self, record: JobRecord) -> Result<(), RecordStoreError> {
        (**self).put(record)
    }

    fn update(&self, job_id: JobId, update: &RecordUpdate) -> Result<JobRecord, RecordStoreError> {
        (**self).update(job_id, update)
    }

    fn query_by_user(&self, user_id: UserId) -> Result<Vec<JobRecord>, RecordStoreError> {
        (**self).query_by_user(user_id)
    }

    fn query_by_archive_reference(
        &self,
        archive_ref: &ArchiveRef,
    ) -> Result<Option<JobRecord>, RecordStoreError> {
        (**self).query_by_archive_reference(archive_ref)
    }
}
