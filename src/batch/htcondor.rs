use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::batch::{run_submit, BatchSystem, SubmitRequest};
use crate::errors::PicoError;
use crate::models::{BatchJob, BatchKind, JobStatus};
use crate::runner::CommandRunner;

/// HTCondor adapter driving `condor_submit` and `condor_q`.
pub struct HTCondor {
    runner: Arc<dyn CommandRunner>,
    user: String,
}

impl HTCondor {
    pub fn new(runner: Arc<dyn CommandRunner>, user: &str) -> Self {
        Self {
            runner,
            user: user.to_string(),
        }
    }

    fn status(code: &str) -> Option<JobStatus> {
        match code {
            "1" => Some(JobStatus::Queued),
            "2" => Some(JobStatus::Running),
            "4" => Some(JobStatus::Completed),
            "3" | "5" | "6" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn parse_job_ids(output: &str) -> Vec<u64> {
        let Ok(re) = Regex::new(r"submitted to cluster (\d+)") else {
            return Vec::new();
        };
        re.captures_iter(output)
            .filter_map(|c| c[1].parse().ok())
            .collect()
    }

    /// Parse `condor_q -af Owner ClusterId ProcId JobStatus Args` rows.
    pub fn parse_jobs(output: &str) -> Vec<BatchJob> {
        let mut jobs = Vec::new();
        for line in output.lines() {
            let mut fields = line.split_whitespace();
            let (Some(user), Some(cluster), Some(proc_id), Some(code)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(job_id) = cluster.parse::<u64>() else {
                continue;
            };
            let Some(status) = Self::status(code) else {
                tracing::debug!("Ignoring job {}.{} with status {}", job_id, proc_id, code);
                continue;
            };
            jobs.push(BatchJob {
                user: user.to_string(),
                job_id,
                task_id: proc_id.parse().unwrap_or(-1),
                status,
                args: fields.collect::<Vec<_>>().join(" "),
            });
        }
        jobs
    }
}

#[async_trait]
impl BatchSystem for HTCondor {
    fn kind(&self) -> BatchKind {
        BatchKind::HTCondor
    }

    fn script(&self) -> &'static str {
        "python/batch/submit_HTCondor.sub"
    }

    fn submit_command(&self, request: &SubmitRequest) -> (String, Vec<String>) {
        let mut args = Vec::new();
        if !request.name.is_empty() {
            args.extend(["-batch-name".to_string(), request.name.clone()]);
        }
        let appends = [
            format!("initialdir={}", request.jobdir),
            format!(
                "mylogfile=log/{}.$(ClusterId).$(ProcId).log",
                request.name
            ),
        ];
        for append in appends {
            args.extend(["-append".to_string(), append]);
        }
        if let Some(queue) = &request.queue {
            args.extend(["-append".to_string(), format!("+JobFlavour=\"{}\"", queue)]);
        }
        if let Some(time) = &request.time {
            args.extend(["-append".to_string(), format!("+MaxRuntime={}", time)]);
        }
        if let Some(mem) = &request.mem {
            args.extend(["-append".to_string(), format!("request_memory={}", mem)]);
        }
        args.extend(request.opts.iter().cloned());
        args.push(request.script.clone());
        args.extend([
            "-queue".to_string(),
            format!("arg from {}", request.joblist),
        ]);
        ("condor_submit".to_string(), args)
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<Vec<u64>, PicoError> {
        let (program, args) = self.submit_command(request);
        run_submit(
            self.runner.as_ref(),
            &program,
            &args,
            request.dry,
            Self::parse_job_ids,
        )
        .await
    }

    async fn jobs(&self, job_ids: &[u64]) -> Result<Vec<BatchJob>, PicoError> {
        let mut args: Vec<String> = job_ids.iter().map(u64::to_string).collect();
        if job_ids.is_empty() && !self.user.is_empty() {
            args.push(self.user.clone());
        }
        args.extend(
            ["-af", "Owner", "ClusterId", "ProcId", "JobStatus", "Args"]
                .iter()
                .map(|s| s.to_string()),
        );
        let out = self.runner.run("condor_q", &args).await?;
        if !out.success() {
            return Err(PicoError::Batch(format!(
                "condor_q failed with exit code {}: {}",
                out.code,
                out.stderr.trim()
            )));
        }
        Ok(Self::parse_jobs(&out.stdout))
    }

    /// Arguments are reported inline by condor_q.
    fn chunk_args(&self, job: &BatchJob, _joblist: &Path) -> Result<String, PicoError> {
        Ok(job.args.clone())
    }
}
