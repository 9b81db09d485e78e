pub mod htcondor;
pub mod slurm;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::PicoError;
use crate::models::{BatchJob, BatchKind};
use crate::runner::{format_command, CommandRunner};

pub use htcondor::HTCondor;
pub use slurm::Slurm;

/// Everything needed to submit one job array for a sample.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    /// Submission script, relative to the base directory.
    pub script: String,
    pub name: String,
    /// Argument list with one job command line per chunk.
    pub joblist: String,
    pub jobdir: String,
    pub logdir: String,
    pub njobs: usize,
    pub queue: Option<String>,
    /// Wall time limit, e.g. "04:20:00".
    pub time: Option<String>,
    /// Memory limit in MB.
    pub mem: Option<String>,
    /// Extra options passed verbatim to the submit command.
    pub opts: Vec<String>,
    pub dry: bool,
}

#[async_trait]
pub trait BatchSystem: Send + Sync {
    fn kind(&self) -> BatchKind;

    /// Default submission script shipped in `python/batch/`.
    fn script(&self) -> &'static str;

    /// Program and arguments of the submit command.
    fn submit_command(&self, request: &SubmitRequest) -> (String, Vec<String>);

    /// Submit a job array and return the job ids reported by the batch system.
    /// A dry run prints the command and returns no ids.
    async fn submit(&self, request: &SubmitRequest) -> Result<Vec<u64>, PicoError>;

    /// List the user's jobs, restricted to the given job ids when not empty.
    async fn jobs(&self, job_ids: &[u64]) -> Result<Vec<BatchJob>, PicoError>;

    /// Recover the job command line a job runs with.
    fn chunk_args(&self, job: &BatchJob, joblist: &Path) -> Result<String, PicoError>;
}

/// Create the batch system adapter for the configured kind.
pub fn from_kind(kind: BatchKind, runner: Arc<dyn CommandRunner>) -> Box<dyn BatchSystem> {
    let user = current_user();
    match kind {
        BatchKind::Slurm => Box::new(Slurm::new(runner, &user)),
        BatchKind::HTCondor => Box::new(HTCondor::new(runner, &user)),
    }
}

pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_default()
}

/// Run a submit command and collect job ids with the backend's extractor.
pub(crate) async fn run_submit(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
    dry: bool,
    extract: impl Fn(&str) -> Vec<u64> + Send,
) -> Result<Vec<u64>, PicoError> {
    let line = format_command(program, args);
    if dry {
        println!("Dry run: {}", line);
        return Ok(Vec::new());
    }
    tracing::info!("Submitting: {}", line);
    let out = runner.run(program, args).await?;
    let text = format!("{}\n{}", out.stdout, out.stderr);
    let failed = !out.success() || text.lines().any(|l| l.to_lowercase().contains("error"));
    let ids = extract(&text);
    if failed {
        tracing::warn!("Submission failed!\n{}", text.trim_end());
    }
    if ids.is_empty() && !out.success() {
        return Err(PicoError::Batch(format!(
            "'{}' failed with exit code {}: {}",
            program,
            out.code,
            out.stderr.trim()
        )));
    }
    Ok(ids)
}

/// Read line `index` (0-based) of a job argument list.
pub fn getline(joblist: &Path, index: usize) -> Result<String, PicoError> {
    let content = std::fs::read_to_string(joblist).map_err(|e| {
        PicoError::Integrity(format!(
            "Cannot read job argument list {}: {}",
            joblist.display(),
            e
        ))
    })?;
    content
        .lines()
        .nth(index)
        .map(str::to_string)
        .ok_or_else(|| {
            PicoError::Integrity(format!(
                "Job argument list {} has no line {}",
                joblist.display(),
                index + 1
            ))
        })
}
