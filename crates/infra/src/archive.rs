//! Cold archive tier: write-once storage with asynchronous, tiered retrieval.
//!
//! Retrieval is a two-step protocol. `initiate_retrieval` returns a retrieval
//! reference immediately; some time later the tier publishes an
//! [`ArchiveRetrievalCompleted`] notification to the channel named in the
//! request, after which `fetch_retrieved` returns the bytes. Retrieved
//! output stays readable for a limited time, even after the archive itself
//! is deleted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use strata_core::{ArchiveRef, Clock, RetrievalRef, SystemClock};
use strata_events::{
    ArchiveRetrievalCompleted, Notification, NotificationChannel, RetrievalStatus,
};

use crate::fault::FaultBudget;

/// How long a completed retrieval's output can be fetched.
pub const DEFAULT_OUTPUT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

const REQUEST_LOG_CAPACITY: usize = 1024;

/// Speed/cost class of a retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetrievalTier {
    Expedited,
    Standard,
}

impl core::fmt::Display for RetrievalTier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RetrievalTier::Expedited => f.write_str("Expedited"),
            RetrievalTier::Standard => f.write_str("Standard"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArchiveError {
    /// The tier has no capacity for this retrieval class right now.
    #[error("insufficient capacity for {0} retrieval")]
    InsufficientCapacity(RetrievalTier),

    #[error("archive object not found: {0}")]
    NotFound(String),

    #[error("retrieval {0} has not completed")]
    NotReady(RetrievalRef),

    #[error("archive tier unavailable: {0}")]
    Unavailable(String),
}

pub trait ArchiveTier: Send + Sync {
    fn store(&self, bytes: Vec<u8>) -> Result<ArchiveRef, ArchiveError>;

    fn initiate_retrieval(
        &self,
        archive_ref: &ArchiveRef,
        tier: RetrievalTier,
        completion_channel: &str,
    ) -> Result<RetrievalRef, ArchiveError>;

    fn fetch_retrieved(&self, retrieval: &RetrievalRef) -> Result<Vec<u8>, ArchiveError>;

    fn delete(&self, archive_ref: &ArchiveRef) -> Result<(), ArchiveError>;
}

impl<A> ArchiveTier for Arc<A>
where
    A: ArchiveTier + ?Sized,
{
    fn store(&self, bytes: Vec<u8>) -> Result<ArchiveRef, ArchiveError> {
        (**self).store(bytes)
    }

    fn initiate_retrieval(
        &self,
        archive_ref: &ArchiveRef,
        tier: RetrievalTier,
        completion_channel: &str,
    ) -> Result<RetrievalRef, ArchiveError> {
        (**self).initiate_retrieval(archive_ref, tier, completion_channel)
    }

    fn fetch_retrieved(&self, retrieval: &RetrievalRef) -> Result<Vec<u8>, ArchiveError> {
        (**self).fetch_retrieved(retrieval)
    }

    fn delete(&self, archive_ref: &ArchiveRef) -> Result<(), ArchiveError> {
        (**self).delete(archive_ref)
    }
}

#[derive(Debug, Clone)]
struct RetrievalJob {
    archive_ref: ArchiveRef,
    tier: RetrievalTier,
    channel: String,
    /// Snapshot taken when the retrieval completes; survives archive deletion.
    output: Option<Vec<u8>>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Vault {
    archives: HashMap<ArchiveRef, Vec<u8>>,
    retrievals: HashMap<RetrievalRef, RetrievalJob>,
    channels: HashMap<String, Arc<dyn NotificationChannel>>,
    rejections: HashMap<RetrievalTier, usize>,
    requests: VecDeque<(ArchiveRef, RetrievalTier)>,
}

impl Vault {
    fn purge_expired_output(&mut self, cutoff: DateTime<Utc>) {
        self.retrievals
            .retain(|_, job| job.completed_at.is_none_or(|at| at > cutoff));
    }
}

/// In-memory archive tier for tests/dev.
pub struct InMemoryArchiveTier {
    vault: Mutex<Vault>,
    fetches: AtomicUsize,
    store_faults: FaultBudget,
    delete_faults: FaultBudget,
    clock: Arc<dyn Clock>,
    output_retention: Duration,
}

impl Default for InMemoryArchiveTier {
    fn default() -> Self {
        Self {
            vault: Mutex::default(),
            fetches: AtomicUsize::new(0),
            store_faults: FaultBudget::default(),
            delete_faults: FaultBudget::default(),
            clock: Arc::new(SystemClock),
            output_retention: DEFAULT_OUTPUT_RETENTION,
        }
    }
}

impl core::fmt::Debug for InMemoryArchiveTier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryArchiveTier")
            .field("fetches", &self.fetches)
            .field("output_retention", &self.output_retention)
            .finish_non_exhaustive()
    }
}

impl InMemoryArchiveTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_output_retention(mut self, retention: Duration) -> Self {
        self.output_retention = retention;
        self
    }

    /// Route completion notifications for `name` to `channel`.
    pub fn register_completion_channel(
        &self,
        name: impl Into<String>,
        channel: Arc<dyn NotificationChannel>,
    ) {
        if let Ok(mut v) = self.vault.lock() {
            v.channels.insert(name.into(), channel);
        }
    }

    /// Reject the next `n` retrieval requests at `tier` for lack of capacity.
    pub fn reject_capacity(&self, tier: RetrievalTier, n: usize) {
        if let Ok(mut v) = self.vault.lock() {
            v.rejections.insert(tier, n);
        }
    }

    pub fn fail_next_stores(&self, n: usize) {
        self.store_faults.arm(n);
    }

    pub fn fail_next_deletes(&self, n: usize) {
        self.delete_faults.arm(n);
    }

    pub fn contains(&self, archive_ref: &ArchiveRef) -> bool {
        self.vault
            .lock()
            .map(|v| v.archives.contains_key(archive_ref))
            .unwrap_or(false)
    }

    pub fn archive_count(&self) -> usize {
        self.vault.lock().map(|v| v.archives.len()).unwrap_or(0)
    }

    /// Every retrieval request seen, accepted or rejected, in order.
    pub fn retrieval_requests(&self) -> Vec<(ArchiveRef, RetrievalTier)> {
        self.vault
            .lock()
            .map(|v| v.requests.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Retrievals still tracked, pending or with readable output.
    pub fn retrieval_count(&self) -> usize {
        self.vault.lock().map(|v| v.retrievals.len()).unwrap_or(0)
    }

    /// Number of successful `fetch_retrieved` calls.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Finish every outstanding retrieval and publish its completion
    /// notification. Returns how many were completed.
    pub fn complete_retrievals(&self) -> usize {
        let now = self.clock.now();
        let cutoff = self.output_cutoff(now);
        let mut vault = match self.vault.lock() {
            Ok(v) => v,
            Err(_) => return 0,
        };
        vault.purge_expired_output(cutoff);
        let Vault {
            archives,
            retrievals,
            channels,
            ..
        } = &mut *vault;

        let mut completed = 0;
        let mut failed = Vec::new();
        for (retrieval_ref, job) in retrievals.iter_mut().filter(|(_, j)| j.output.is_none()) {
            let Some(channel) = channels.get(&job.channel) else {
                warn!(channel = %job.channel, "no completion channel registered; retrieval left pending");
                continue;
            };

            let status = match archives.get(&job.archive_ref) {
                Some(bytes) => {
                    job.output = Some(bytes.clone());
                    job.completed_at = Some(now);
                    RetrievalStatus::Succeeded
                }
                None => RetrievalStatus::Failed,
            };

            let notification = Notification::ArchiveRetrievalCompleted(ArchiveRetrievalCompleted {
                retrieval_job_id: retrieval_ref.clone(),
                archive_reference: job.archive_ref.clone(),
                status_code: status,
                vault: None,
            });
            if let Err(e) = channel.publish_notification(&notification) {
                warn!(retrieval = %retrieval_ref, error = %e, "failed to publish retrieval completion");
                job.output = None;
                job.completed_at = None;
                continue;
            }
            debug!(retrieval = %retrieval_ref, tier = %job.tier, ?status, "retrieval completed");
            if status == RetrievalStatus::Failed {
                failed.push(retrieval_ref.clone());
            }
            completed += 1;
        }
        for retrieval_ref in &failed {
            retrievals.remove(retrieval_ref);
        }
        completed
    }

    fn output_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.output_retention)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vault>, ArchiveError> {
        self.vault
            .lock()
            .map_err(|_| ArchiveError::Unavailable("lock poisoned".into()))
    }
}

impl ArchiveTier for InMemoryArchiveTier {
    fn store(&self, bytes: Vec<u8>) -> Result<ArchiveRef, ArchiveError> {
        if self.store_faults.trip() {
            return Err(ArchiveError::Unavailable("injected store failure".into()));
        }
        let archive_ref = ArchiveRef::new(Uuid::now_v7().simple().to_string())
            .map_err(|e| ArchiveError::Unavailable(e.to_string()))?;
        self.lock()?.archives.insert(archive_ref.clone(), bytes);
        Ok(archive_ref)
    }

    fn initiate_retrieval(
        &self,
        archive_ref: &ArchiveRef,
        tier: RetrievalTier,
        completion_channel: &str,
    ) -> Result<RetrievalRef, ArchiveError> {
        let mut vault = self.lock()?;
        if vault.requests.len() == REQUEST_LOG_CAPACITY {
            vault.requests.pop_front();
        }
        vault.requests.push_back((archive_ref.clone(), tier));

        if let Some(left) = vault.rejections.get_mut(&tier)
            && *left > 0
        {
            *left -= 1;
            return Err(ArchiveError::InsufficientCapacity(tier));
        }
        if !vault.archives.contains_key(archive_ref) {
            return Err(ArchiveError::NotFound(archive_ref.to_string()));
        }

        let retrieval_ref = RetrievalRef::new(Uuid::now_v7().simple().to_string())
            .map_err(|e| ArchiveError::Unavailable(e.to_string()))?;
        vault.retrievals.insert(
            retrieval_ref.clone(),
            RetrievalJob {
                archive_ref: archive_ref.clone(),
                tier,
                channel: completion_channel.to_string(),
                output: None,
                completed_at: None,
            },
        );
        Ok(retrieval_ref)
    }

    fn fetch_retrieved(&self, retrieval: &RetrievalRef) -> Result<Vec<u8>, ArchiveError> {
        let vault = self.lock()?;
        let job = vault
            .retrievals
            .get(retrieval)
            .ok_or_else(|| ArchiveError::NotFound(retrieval.to_string()))?;
        let bytes = job
            .output
            .clone()
            .ok_or_else(|| ArchiveError::NotReady(retrieval.clone()))?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(bytes)
    }

    fn delete(&self, archive_ref: &ArchiveRef) -> Result<(), ArchiveError> {
        if self.delete_faults.trip() {
            return Err(ArchiveError::Unavailable("injected delete failure".into()));
        }
        let cutoff = self.output_cutoff(self.clock.now());
        let mut vault = self.lock()?;
        let removed = vault.archives.remove(archive_ref);
        // Pending retrievals of this archive could only report failure now;
        // completed ones keep their output until it expires.
        vault
            .retrievals
            .retain(|_, job| job.archive_ref != *archive_ref || job.output.is_some());
        vault.purge_expired_output(cutoff);
        match removed {
            Some(_) => Ok(()),
            None => Err(ArchiveError::NotFound(archive_ref.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::ManualClock;
    use strata_events::InMemoryChannel;

    #[test]
    fn retrieval_completes_asynchronously() {
        let tier = InMemoryArchiveTier::new();
        let channel = InMemoryChannel::arc("thaw");
        tier.register_completion_channel("thaw", channel.clone());

        let archive_ref = tier.store(b"payload".to_vec()).unwrap();
        let retrieval = tier
            .initiate_retrieval(&archive_ref, RetrievalTier::Expedited, "thaw")
            .unwrap();
        assert_eq!(
            tier.fetch_retrieved(&retrieval),
            Err(ArchiveError::NotReady(retrieval.clone()))
        );

        assert_eq!(tier.complete_retrievals(), 1);
        assert_eq!(tier.fetch_retrieved(&retrieval).unwrap(), b"payload");

        let delivered = channel.receive(10, Duration::ZERO).unwrap();
        assert_eq!(delivered.len(), 1);
        let Notification::ArchiveRetrievalCompleted(c) = Notification::decode(&delivered[0].body).unwrap()
        else {
            panic!("wrong notification");
        };
        assert_eq!(c.retrieval_job_id, retrieval);
        assert_eq!(c.archive_reference, archive_ref);
        assert_eq!(c.status_code, RetrievalStatus::Succeeded);
    }

    #[test]
    fn retrieved_output_outlives_archive_deletion() {
        let tier = InMemoryArchiveTier::new();
        tier.register_completion_channel("thaw", InMemoryChannel::arc("thaw"));
        let archive_ref = tier.store(vec![7]).unwrap();
        let retrieval = tier
            .initiate_retrieval(&archive_ref, RetrievalTier::Standard, "thaw")
            .unwrap();
        tier.complete_retrievals();

        tier.delete(&archive_ref).unwrap();
        assert_eq!(tier.fetch_retrieved(&retrieval).unwrap(), vec![7]);
        assert!(matches!(tier.delete(&archive_ref), Err(ArchiveError::NotFound(_))));
    }

    #[test]
    fn delete_forgets_pending_retrievals() {
        let tier = InMemoryArchiveTier::new();
        let archive_ref = tier.store(vec![1]).unwrap();
        let kept = tier.store(vec![2]).unwrap();
        tier.initiate_retrieval(&archive_ref, RetrievalTier::Standard, "c")
            .unwrap();
        tier.initiate_retrieval(&kept, RetrievalTier::Standard, "c").unwrap();
        assert_eq!(tier.retrieval_count(), 2);

        tier.delete(&archive_ref).unwrap();
        assert_eq!(tier.retrieval_count(), 1);
    }

    #[test]
    fn retrieved_output_expires_after_retention() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tier = InMemoryArchiveTier::new()
            .with_clock(clock.clone())
            .with_output_retention(Duration::from_secs(3600));
        tier.register_completion_channel("thaw", InMemoryChannel::arc("thaw"));
        let archive_ref = tier.store(vec![7]).unwrap();
        let retrieval = tier
            .initiate_retrieval(&archive_ref, RetrievalTier::Expedited, "thaw")
            .unwrap();
        tier.complete_retrievals();
        tier.delete(&archive_ref).unwrap();

        clock.advance(chrono::Duration::minutes(59));
        assert_eq!(tier.complete_retrievals(), 0);
        assert_eq!(tier.fetch_retrieved(&retrieval).unwrap(), vec![7]);

        clock.advance(chrono::Duration::minutes(2));
        tier.complete_retrievals();
        assert_eq!(tier.retrieval_count(), 0);
        assert!(matches!(
            tier.fetch_retrieved(&retrieval),
            Err(ArchiveError::NotFound(_))
        ));
    }

    #[test]
    fn capacity_rejections_are_per_tier() {
        let tier = InMemoryArchiveTier::new();
        let archive_ref = tier.store(vec![1]).unwrap();
        tier.reject_capacity(RetrievalTier::Expedited, 1);

        assert_eq!(
            tier.initiate_retrieval(&archive_ref, RetrievalTier::Expedited, "c"),
            Err(ArchiveError::InsufficientCapacity(RetrievalTier::Expedited))
        );
        assert!(tier
            .initiate_retrieval(&archive_ref, RetrievalTier::Standard, "c")
            .is_ok());
        assert!(tier
            .initiate_retrieval(&archive_ref, RetrievalTier::Expedited, "c")
            .is_ok());
        assert_eq!(tier.retrieval_requests().len(), 3);
    }
}
