use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::PicoError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BatchKind {
    #[serde(rename = "SLURM")]
    Slurm,
    #[serde(rename = "HTCondor")]
    HTCondor,
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchKind::Slurm => write!(f, "SLURM"),
            BatchKind::HTCondor => write!(f, "HTCondor"),
        }
    }
}

impl FromStr for BatchKind {
    type Err = PicoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "slurm" => Ok(BatchKind::Slurm),
            "htcondor" | "condor" => Ok(BatchKind::HTCondor),
            other => Err(PicoError::Validation(format!(
                "Batch system '{}' has not been implemented (yet)",
                other
            ))),
        }
    }
}

/// Job state normalized across batch systems.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Queued and running jobs still own their chunk.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn letter(self) -> char {
        match self {
            JobStatus::Queued => 'q',
            JobStatus::Running => 'r',
            JobStatus::Completed => 'c',
            JobStatus::Failed => 'f',
        }
    }
}

/// A job as reported by the batch system. Read-only from our side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    pub user: String,
    pub job_id: u64,
    /// Array task index (Slurm) or process id (HTCondor); -1 when absent.
    pub task_id: i64,
    pub status: JobStatus,
    pub args: String,
}

impl fmt::Display for BatchJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.task_id >= 0 {
            write!(f, "{}.{}", self.job_id, self.task_id)
        } else {
            write!(f, "{}", self.job_id)
        }
    }
}
