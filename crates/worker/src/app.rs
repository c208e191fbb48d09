//! Process wiring: backends are built once and handed to each worker as
//! shared read-only handles. They live in this process only, so every worker
//! runs here too.

use std::collections::BTreeSet;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info};

use strata_core::{Clock, JobId, JobRecord, SystemClock, UserId, UserRole};
use strata_events::{
    InMemoryChannel, JobSubmitted, Notification, NotificationChannel, RestoreRequested,
};
use strata_infra::{
    ArchivalWorker, CommandCompute, CompletionWorker, ComputeError, ComputeOutcome, ComputeStep,
    InMemoryArchiveTier, InMemoryObjectStore, InMemoryRecordStore, ObjectStore, RecordStore,
    RetrievalWorker, ThawWorker, WorkerConfig, WorkerHandle, WorkerRuntime,
};

pub struct Backends {
    pub clock: Arc<dyn Clock>,
    pub records: Arc<InMemoryRecordStore>,
    pub objects: Arc<InMemoryObjectStore>,
    pub archive: Arc<InMemoryArchiveTier>,
    pub submissions: Arc<InMemoryChannel>,
    pub results: Arc<InMemoryChannel>,
    pub restores: Arc<InMemoryChannel>,
    pub thaws: Arc<InMemoryChannel>,
}

impl Backends {
    pub fn in_memory(config: &WorkerConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
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
            submissions,
            results,
            restores,
            thaws,
        }
    }
}

/// The configured external program, or a pass-through step for dev runs.
pub fn compute_step(config: &WorkerConfig) -> Arc<dyn ComputeStep> {
    match &config.compute {
        Some(c) => Arc::new(
            CommandCompute::new(c.program.clone(), c.work_dir.clone()).with_args(c.args.clone()),
        ),
        None => Arc::new(
            |_: &JobRecord, input: &[u8]| -> Result<ComputeOutcome, ComputeError> {
                Ok(ComputeOutcome::Succeeded(input.to_vec()))
            },
        ),
    }
}

/// Spawn the four workers, each on its own thread.
pub fn spawn_workers(config: &WorkerConfig, backends: &Backends) -> anyhow::Result<Vec<WorkerHandle>> {
    let completion = CompletionWorker::new(
        backends.records.clone(),
        backends.objects.clone(),
        compute_step(config),
        backends.results.clone(),
        config.buckets.clone(),
        backends.clock.clone(),
    );
    let archival = ArchivalWorker::new(
        backends.records.clone(),
        backends.objects.clone(),
        backends.archive.clone(),
        config.buckets.clone(),
        config.retention_grace,
        backends.clock.clone(),
    );
    let retrieval = RetrievalWorker::new(
        backends.records.clone(),
        backends.archive.clone(),
        config.queues.retrieval_completion.clone(),
    );
    let thaw = ThawWorker::new(
        backends.records.clone(),
        backends.objects.clone(),
        backends.archive.clone(),
        config.buckets.clone(),
    );

    Ok(vec![
        WorkerRuntime::new(backends.submissions.clone(), completion, config.poll.clone())
            .spawn()
            .context("spawning completion worker")?,
        WorkerRuntime::new(backends.results.clone(), archival, config.poll.clone())
            .spawn()
            .context("spawning archival worker")?,
        WorkerRuntime::new(backends.restores.clone(), retrieval, config.poll.clone())
            .spawn()
            .context("spawning retrieval worker")?,
        WorkerRuntime::new(backends.thaws.clone(), thaw, config.poll.clone())
            .spawn()
            .context("spawning thaw worker")?,
    ])
}

/// Create `n` PENDING jobs with inputs and publish their submissions.
pub fn seed_jobs(
    n: usize,
    config: &WorkerConfig,
    backends: &Backends,
) -> anyhow::Result<Vec<JobRecord>> {
    let mut seeded = Vec::with_capacity(n);
    for i in 0..n {
        let user_id = UserId::new();
        let role = if i % 2 == 0 {
            UserRole::Standard
        } else {
            UserRole::Privileged
        };
        let job_id = JobId::new();
        let input_key = format!("{user_id}/{job_id}.vcf");

        backends
            .objects
            .put(&config.buckets.inputs, &input_key, format!("demo input {i}\n").into_bytes())
            .context("storing demo input")?;
        let record = JobRecord::submitted(job_id, user_id, role, &input_key, backends.clock.now());
        backends
            .records
            .put(record.clone())
            .context("creating demo record")?;
        backends
            .submissions
            .publish_notification(&Notification::JobSubmitted(JobSubmitted {
                job_id,
                input_reference: input_key,
                user_id: Some(user_id),
            }))
            .context("publishing demo submission")?;

        debug!(%job_id, %user_id, %role, "seeded job");
        seeded.push(record);
    }
    info!(count = n, "seeded demo jobs");
    Ok(seeded)
}

/// Publish one restore request per standard-class owner among `jobs`, as the
/// account service does on an upgrade. Returns the number of users.
pub fn request_restores(jobs: &[JobRecord], backends: &Backends) -> anyhow::Result<usize> {
    let users: BTreeSet<UserId> = jobs
        .iter()
        .filter(|j| !j.user_role.is_archival_exempt())
        .map(|j| j.user_id)
        .collect();
    for &user_id in &users {
        backends
            .restores
            .publish_notification(&Notification::RestoreRequested(RestoreRequested { user_id }))
            .context("publishing restore request")?;
        debug!(%user_id, "restore requested");
    }
    info!(users = users.len(), "requested restores for upgraded users");
    Ok(users.len())
}

/// Background thread standing in for the archive tier finishing retrievals.
#[derive(Debug)]
pub struct ArchiveTicker {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ArchiveTicker {
    pub fn spawn(archive: Arc<InMemoryArchiveTier>, every: Duration) -> anyhow::Result<Self> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("archive-tier".to_string())
            .spawn(move || {
                while let Err(mpsc::RecvTimeoutError::Timeout) = shutdown_rx.recv_timeout(every) {
                    let completed = archive.complete_retrievals();
                    if completed > 0 {
                        info!(completed, "archive retrievals completed");
                    }
                }
            })
            .context("spawning archive tier thread")?;

        Ok(Self {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}
