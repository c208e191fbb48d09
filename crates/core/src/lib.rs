//! `strata-core`: job lifecycle domain primitives.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, the durable job record, and the transition rules every
//! worker checks before mutating a record.

pub mod clock;
pub mod error;
pub mod id;
pub mod record;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{ArchiveRef, JobId, RetrievalRef, UserId};
pub use record::{ArchiveState, JobRecord, JobStatus, UserRole};
