//! The compute step invoked on a job's input.
//!
//! The computation itself is a black box. It receives the input bytes and
//! either produces result bytes or reports a failed run. Recomputing the same
//! input must produce the same result, because redelivery may run it twice.

use std::path::PathBuf;
use std::process::Command;

use thiserror::Error;
use tracing::{debug, warn};

use strata_core::JobRecord;

/// Result of running the compute step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeOutcome {
    /// Result bytes to store as the job's result object.
    Succeeded(Vec<u8>),
    /// The computation ran and reported failure; the job becomes FAILED.
    Failed { reason: String },
}

/// The compute step could not be run at all (retry later).
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("compute io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("compute step unavailable: {0}")]
    Unavailable(String),
}

pub trait ComputeStep: Send + Sync {
    fn run(&self, job: &JobRecord, input: &[u8]) -> Result<ComputeOutcome, ComputeError>;
}

impl<F> ComputeStep for F
where
    F: Fn(&JobRecord, &[u8]) -> Result<ComputeOutcome, ComputeError> + Send + Sync,
{
    fn run(&self, job: &JobRecord, input: &[u8]) -> Result<ComputeOutcome, ComputeError> {
        self(job, input)
    }
}

/// Runs an external program as `program [args..] <input-path> <job-id>`.
///
/// Exit status 0 means success and the program must leave its output at
/// `<work-dir>/<job-id>.result`. Any other exit status is a failed run.
#[derive(Debug, Clone)]
pub struct CommandCompute {
    program: PathBuf,
    args: Vec<String>,
    work_dir: PathBuf,
}

impl CommandCompute {
    pub fn new(program: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: work_dir.into(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn cleanup(paths: &[&PathBuf]) {
        for p in paths {
            if let Err(e) = std::fs::remove_file(p)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %p.display(), error = %e, "failed to remove compute scratch file");
            }
        }
    }
}

impl ComputeStep for CommandCompute {
    fn run(&self, job: &JobRecord, input: &[u8]) -> Result<ComputeOutcome, ComputeError> {
        std::fs::create_dir_all(&self.work_dir)?;
        let input_path = self.work_dir.join(format!("{}.input", job.job_id));
        let output_path = self.work_dir.join(format!("{}.result", job.job_id));
        std::fs::write(&input_path, input)?;

        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(&input_path)
            .arg(job.job_id.to_string())
            .status()
            .map_err(|e| {
                Self::cleanup(&[&input_path]);
                ComputeError::Unavailable(format!("{}: {e}", self.program.display()))
            })?;
        debug!(job_id = %job.job_id, ?status, "compute program exited");

        let outcome = if status.success() {
            match std::fs::read(&output_path) {
                Ok(bytes) => ComputeOutcome::Succeeded(bytes),
                Err(e) => ComputeOutcome::Failed {
                    reason: format!("program succeeded but produced no output: {e}"),
                },
            }
        } else {
            ComputeOutcome::Failed {
                reason: format!("program exited with {status}"),
            }
        };

        Self::cleanup(&[&input_path, &output_path]);
        Ok(outcome)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use chrono::Utc;
    use strata_core::{JobId, UserId, UserRole};

    fn job() -> JobRecord {
        JobRecord::submitted(JobId::new(), UserId::new(), UserRole::Standard, "in/x", Utc::now())
    }

    #[test]
    fn successful_program_output_becomes_result() {
        let dir = tempfile::tempdir().unwrap();
        let compute = CommandCompute::new("sh", dir.path())
            .with_args(["-c", "tr a-z A-Z < \"$0\" > \"$(dirname \"$0\")/$1.result\""]);

        let outcome = compute.run(&job(), b"variants").unwrap();
        assert_eq!(outcome, ComputeOutcome::Succeeded(b"VARIANTS".to_vec()));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn non_zero_exit_is_a_failed_run() {
        let dir = tempfile::tempdir().unwrap();
        let compute = CommandCompute::new("sh", dir.path()).with_args(["-c", "exit 3"]);

        let outcome = compute.run(&job(), b"x").unwrap();
        assert!(matches!(outcome, ComputeOutcome::Failed { .. }));
    }

    #[test]
    fn missing_program_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let compute = CommandCompute::new("/nonexistent/strata-compute", dir.path());
        assert!(matches!(
            compute.run(&job(), b"x"),
            Err(ComputeError::Unavailable(_))
        ));
    }

    #[test]
    fn closures_are_compute_steps() {
        let step = |_: &JobRecord, input: &[u8]| -> Result<ComputeOutcome, ComputeError> {
            Ok(ComputeOutcome::Succeeded(input.iter().rev().copied().collect()))
        };
        assert_eq!(
            step.run(&job(), b"abc").unwrap(),
            ComputeOutcome::Succeeded(b"cba".to_vec())
        );
    }
}
