//! The durable job record and its transition rules.
//!
//! The serialized field names of [`JobRecord`] are the only contract shared by
//! independently deployed workers; do not rename them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{ArchiveRef, JobId, RetrievalRef, UserId};

/// Job execution status.
///
/// Transitions are monotonic: `PENDING -> RUNNING -> COMPLETED | FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Submitted, waiting for the completion worker
    Pending,
    /// Compute step in progress
    Running,
    /// Result object written
    Completed,
    /// Compute step reported failure
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Account class of the job owner.
///
/// Stamped on the record at submission and raised to `Privileged` on every
/// record of a user once a restore is requested for that user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    /// Results move to the cold tier after the retention grace period.
    #[serde(alias = "free_user")]
    Standard,
    /// Results stay in the hot store indefinitely.
    #[serde(alias = "premium_user")]
    Privileged,
}

impl UserRole {
    pub fn is_archival_exempt(&self) -> bool {
        matches!(self, UserRole::Privileged)
    }
}

impl core::fmt::Display for UserRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            UserRole::Standard => f.write_str("standard"),
            UserRole::Privileged => f.write_str("privileged"),
        }
    }
}

/// Storage sub-state of a job's result object, derived from the record.
///
/// Orthogonal to [`JobStatus`]. The only legal cycle is
/// `None -> Archived -> Retrieving -> None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveState {
    /// Result (if any) lives in the hot store.
    None,
    /// Result lives only in the cold tier.
    Archived,
    /// A cold-tier retrieval is outstanding.
    Retrieving,
}

impl ArchiveState {
    pub fn can_transition_to(&self, next: ArchiveState) -> bool {
        matches!(
            (self, next),
            (ArchiveState::None, ArchiveState::Archived)
                | (ArchiveState::Archived, ArchiveState::Retrieving)
                | (ArchiveState::Retrieving, ArchiveState::None)
        )
    }

    /// Fail with [`DomainError::IllegalTransition`] unless `self -> next` is legal.
    pub fn ensure_transition(&self, next: ArchiveState) -> DomainResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::illegal_transition(self, next))
        }
    }
}

impl core::fmt::Display for ArchiveState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ArchiveState::None => f.write_str("NONE"),
            ArchiveState::Archived => f.write_str("ARCHIVED"),
            ArchiveState::Retrieving => f.write_str("RETRIEVING"),
        }
    }
}

/// Durable state of one computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub user_id: UserId,
    pub user_role: UserRole,
    /// Object-store key of the uploaded input.
    pub input_reference: String,
    pub submit_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_time: Option<DateTime<Utc>>,
    pub job_status: JobStatus,
    /// Object-store key of the result, set once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_reference: Option<ArchiveRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_reference: Option<RetrievalRef>,
}

impl JobRecord {
    /// Create a freshly submitted record in `PENDING`.
    pub fn submitted(
        job_id: JobId,
        user_id: UserId,
        user_role: UserRole,
        input_reference: impl Into<String>,
        submit_time: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            user_id,
            user_role,
            input_reference: input_reference.into(),
            submit_time,
            complete_time: None,
            job_status: JobStatus::Pending,
            result_reference: None,
            archive_reference: None,
            retrieval_reference: None,
        }
    }

    pub fn archive_state(&self) -> ArchiveState {
        match (&self.archive_reference, &self.retrieval_reference) {
            (Some(_), Some(_)) => ArchiveState::Retrieving,
            (Some(_), None) => ArchiveState::Archived,
            (None, _) => ArchiveState::None,
        }
    }

    /// Whether this record carries exactly the given archive reference.
    pub fn is_archived_as(&self, archive_ref: &ArchiveRef) -> bool {
        self.archive_reference.as_ref() == Some(archive_ref)
    }

    /// How much longer the result must stay in the hot store at `now`.
    ///
    /// `None` once the grace period has elapsed. A record without a
    /// completion time has not started its grace period and gets all of it.
    pub fn retention_remaining(
        &self,
        grace: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Option<std::time::Duration> {
        let Some(completed) = self.complete_time else {
            return Some(grace).filter(|d| !d.is_zero());
        };
        let elapsed = (now - completed)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        grace.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    /// Check the structural invariants of the record.
    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.retrieval_reference.is_some() && self.archive_reference.is_none() {
            return Err(DomainError::invariant(
                "retrieval_reference set without archive_reference",
            ));
        }
        if self.job_status == JobStatus::Completed && self.result_reference.is_none() {
            return Err(DomainError::invariant("COMPLETED without result_reference"));
        }
        if self.archive_reference.is_some() && self.job_status != JobStatus::Completed {
            return Err(DomainError::invariant(
                "archive_reference set on a job that never completed",
            ));
        }
        if self.input_reference.trim().is_empty() {
            return Err(DomainError::validation("input_reference is empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use chrono::Duration;

    fn record() -> JobRecord {
        JobRecord::submitted(
            JobId::new(),
            UserId::new(),
            UserRole::Standard,
            "inputs/sample.vcf",
            Utc::now(),
        )
    }

    #[test]
    fn serialized_field_names_are_stable() {
        let mut rec = record();
        rec.job_status = JobStatus::Completed;
        rec.result_reference = Some("results/x".into());
        rec.archive_reference = Some(ArchiveRef::new("a-1").unwrap());

        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["job_status"], "COMPLETED");
        assert_eq!(v["user_role"], "standard");
        assert_eq!(v["archive_reference"], "a-1");
        assert!(v.get("retrieval_reference").is_none());
        assert!(v.get("complete_time").is_none());
    }

    #[test]
    fn legacy_role_names_are_accepted() {
        let role: UserRole = serde_json::from_str("\"premium_user\"").unwrap();
        assert_eq!(role, UserRole::Privileged);
        let role: UserRole = serde_json::from_str("\"free_user\"").unwrap();
        assert_eq!(role, UserRole::Standard);
    }

    #[test]
    fn archive_state_is_derived_from_references() {
        let mut rec = record();
        assert_eq!(rec.archive_state(), ArchiveState::None);

        rec.archive_reference = Some(ArchiveRef::new("a-1").unwrap());
        assert_eq!(rec.archive_state(), ArchiveState::Archived);

        rec.retrieval_reference = Some(RetrievalRef::new("r-1").unwrap());
        assert_eq!(rec.archive_state(), ArchiveState::Retrieving);
    }

    #[test]
    fn dangling_retrieval_reference_violates_invariants() {
        let mut rec = record();
        rec.retrieval_reference = Some(RetrievalRef::new("r-1").unwrap());
        assert!(matches!(
            rec.check_invariants(),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn retention_remaining_counts_down_from_completion() {
        let grace = std::time::Duration::from_secs(300);
        let mut rec = record();
        let done = Utc::now();
        assert_eq!(rec.retention_remaining(grace, done), Some(grace));
        assert!(rec.retention_remaining(std::time::Duration::ZERO, done).is_none());

        rec.complete_time = Some(done);
        assert_eq!(rec.retention_remaining(grace, done), Some(grace));
        assert_eq!(
            rec.retention_remaining(grace, done + Duration::seconds(120)),
            Some(std::time::Duration::from_secs(180))
        );
        assert!(rec.retention_remaining(grace, done + Duration::seconds(300)).is_none());
        // Clock skew before completion counts as no time elapsed.
        assert_eq!(
            rec.retention_remaining(grace, done - Duration::seconds(5)),
            Some(grace)
        );
    }

    #[test]
    fn status_transitions_are_monotonic() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    fn any_archive_state() -> impl Strategy<Value = ArchiveState> {
        prop_oneof![
            Just(ArchiveState::None),
            Just(ArchiveState::Archived),
            Just(ArchiveState::Retrieving),
        ]
    }

    proptest! {
        #[test]
        fn only_the_archive_cycle_is_legal(from in any_archive_state(), to in any_archive_state()) {
            let legal = matches!(
                (from, to),
                (ArchiveState::None, ArchiveState::Archived)
                    | (ArchiveState::Archived, ArchiveState::Retrieving)
                    | (ArchiveState::Retrieving, ArchiveState::None)
            );
            prop_assert_eq!(from.can_transition_to(to), legal);
            prop_assert_eq!(from.ensure_transition(to).is_ok(), legal);
        }

        #[test]
        fn walking_legal_transitions_returns_to_none(steps in 0usize..30) {
            let mut state = ArchiveState::None;
            for _ in 0..steps {
                state = match state {
                    ArchiveState::None => ArchiveState::Archived,
                    ArchiveState::Archived => ArchiveState::Retrieving,
                    ArchiveState::Retrieving => ArchiveState::None,
                };
            }
            prop_assert_eq!(state == ArchiveState::None, steps % 3 == 0);
        }
    }
}
