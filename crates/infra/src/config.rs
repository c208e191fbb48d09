//! Worker configuration loaded from `STRATA_*` environment variables.
//!
//! Every value has a default so a bare process starts in dev mode.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Maximum batch a single receive may return.
pub const MAX_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Channel names each worker consumes from or publishes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    /// Job submissions (completion worker input).
    pub submissions: String,
    /// Terminal job events (completion worker output, archival worker input).
    pub results: String,
    /// Restore requests after an account upgrade (retrieval worker input).
    pub restores: String,
    /// Archive retrieval completions (thaw worker input).
    pub thaws: String,
    /// Name passed to the archive tier for retrieval completion notifications.
    pub retrieval_completion: String,
}

/// Where input and result objects live in the hot store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buckets {
    pub inputs: String,
    pub results: String,
    pub results_prefix: String,
}

impl Buckets {
    /// Deterministic result key for a job, so recomputation overwrites.
    pub fn result_key(&self, user_id: impl core::fmt::Display, job_id: impl core::fmt::Display) -> String {
        format!("{}{}/{}.result", self.results_prefix, user_id, job_id)
    }
}

/// Receive-loop tuning shared by all workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    /// Messages per receive, 1..=10.
    pub batch_size: usize,
    /// Long-poll wait per receive.
    pub wait: Duration,
    /// Pause after a failed receive.
    pub error_backoff: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            wait: Duration::from_secs(20),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// External compute program (see `CommandCompute`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub queues: QueueNames,
    pub buckets: Buckets,
    /// Time a standard account's result stays hot after completion.
    pub retention_grace: Duration,
    pub poll: PollSettings,
    pub visibility_timeout: Duration,
    /// Deliveries before a message is dead-lettered.
    pub max_receive_count: u32,
    pub compute: Option<ComputeConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: QueueNames {
                submissions: "job-submissions".into(),
                results: "job-results".into(),
                restores: "job-restores".into(),
                thaws: "archive-thaws".into(),
                retrieval_completion: "archive-thaws".into(),
            },
            buckets: Buckets {
                inputs: "inputs".into(),
                results: "results".into(),
                results_prefix: "results/".into(),
            },
            retention_grace: Duration::from_secs(300),
            poll: PollSettings::default(),
            visibility_timeout: Duration::from_secs(30),
            max_receive_count: 5,
            compute: None,
        }
    }
}

impl WorkerConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup (tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut c = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("STRATA_SUBMISSIONS_QUEUE") {
            c.queues.submissions = v;
        }
        if let Some(v) = get("STRATA_RESULTS_QUEUE") {
            c.queues.results = v;
        }
        if let Some(v) = get("STRATA_RESTORE_QUEUE") {
            c.queues.restores = v;
        }
        if let Some(v) = get("STRATA_THAW_QUEUE") {
            c.queues.retrieval_completion = v.clone();
            c.queues.thaws = v;
        }
        if let Some(v) = get("STRATA_RETRIEVAL_COMPLETION_CHANNEL") {
            c.queues.retrieval_completion = v;
        }
        if let Some(v) = get("STRATA_INPUTS_BUCKET") {
            c.buckets.inputs = v;
        }
        if let Some(v) = get("STRATA_RESULTS_BUCKET") {
            c.buckets.results = v;
        }
        if let Some(v) = get("STRATA_RESULTS_PREFIX") {
            c.buckets.results_prefix = v;
        }
        if let Some(v) = get("STRATA_RETENTION_GRACE_SECS") {
            c.retention_grace = Duration::from_secs(parse("STRATA_RETENTION_GRACE_SECS", &v)?);
        }
        if let Some(v) = get("STRATA_BATCH_SIZE") {
            let n: usize = parse("STRATA_BATCH_SIZE", &v)?;
            c.poll.batch_size = n.clamp(1, MAX_BATCH_SIZE);
        }
        if let Some(v) = get("STRATA_WAIT_SECS") {
            c.poll.wait = Duration::from_secs(parse("STRATA_WAIT_SECS", &v)?);
        }
        if let Some(v) = get("STRATA_VISIBILITY_TIMEOUT_SECS") {
            c.visibility_timeout = Duration::from_secs(parse("STRATA_VISIBILITY_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("STRATA_MAX_RECEIVE_COUNT") {
            c.max_receive_count = parse("STRATA_MAX_RECEIVE_COUNT", &v)?;
        }
        if let Some(program) = get("STRATA_COMPUTE_PROGRAM") {
            c.compute = Some(ComputeConfig {
                program: PathBuf::from(program),
                args: get("STRATA_COMPUTE_ARGS")
                    .map(|a| a.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
                work_dir: get("STRATA_WORK_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| std::env::temp_dir().join("strata")),
            });
        }

        Ok(c)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}
