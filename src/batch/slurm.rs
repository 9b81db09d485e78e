use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::batch::{getline, run_submit, BatchSystem, SubmitRequest};
use crate::errors::PicoError;
use crate::models::{BatchJob, BatchKind, JobStatus};
use crate::runner::CommandRunner;

/// Slurm adapter driving `sbatch` and `squeue`.
pub struct Slurm {
    runner: Arc<dyn CommandRunner>,
    user: String,
}

impl Slurm {
    pub fn new(runner: Arc<dyn CommandRunner>, user: &str) -> Self {
        Self {
            runner,
            user: user.to_string(),
        }
    }

    fn status(code: &str) -> Option<JobStatus> {
        match code {
            "PD" => Some(JobStatus::Queued),
            "R" => Some(JobStatus::Running),
            "CD" => Some(JobStatus::Completed),
            "F" | "NF" | "CA" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn parse_job_ids(output: &str) -> Vec<u64> {
        let Ok(re) = Regex::new(r"Submitted batch job (\d+)") else {
            return Vec::new();
        };
        re.captures_iter(output)
            .filter_map(|c| c[1].parse().ok())
            .collect()
    }

    /// Parse `squeue -o '%10u %14F %14K %5t %o'` rows: user, array job id,
    /// array task id, state and command.
    pub fn parse_jobs(output: &str) -> Vec<BatchJob> {
        let mut jobs = Vec::new();
        for line in output.lines() {
            let mut fields = line.split_whitespace();
            let (Some(user), Some(job_id), Some(task_id), Some(code)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(job_id) = job_id.parse::<u64>() else {
                continue; // header
            };
            let Some(status) = Self::status(code) else {
                tracing::debug!("Ignoring job {} with state {}", job_id, code);
                continue;
            };
            jobs.push(BatchJob {
                user: user.to_string(),
                job_id,
                task_id: task_id.parse().unwrap_or(-1),
                status,
                args: fields.collect::<Vec<_>>().join(" "),
            });
        }
        jobs
    }
}

#[async_trait]
impl BatchSystem for Slurm {
    fn kind(&self) -> BatchKind {
        BatchKind::Slurm
    }

    fn script(&self) -> &'static str {
        "python/batch/submit_SLURM.sh"
    }

    fn submit_command(&self, request: &SubmitRequest) -> (String, Vec<String>) {
        let mut args = Vec::new();
        if !request.name.is_empty() {
            args.extend(["-J".to_string(), request.name.clone()]);
        }
        if request.njobs > 0 {
            args.extend(["-a".to_string(), format!("1-{}", request.njobs)]);
        }
        if let Some(queue) = &request.queue {
            args.extend(["--partition".to_string(), queue.clone()]);
        }
        let logfile = Path::new(&request.logdir).join("%x.%A.%a");
        args.extend(["-o".to_string(), logfile.to_string_lossy().to_string()]);
        if let Some(time) = &request.time {
            args.push(format!("--time={}", time));
        }
        if let Some(mem) = &request.mem {
            args.push(format!("--mem={}M", mem));
        }
        args.extend(request.opts.iter().cloned());
        args.push(request.script.clone());
        args.push(request.joblist.clone());
        ("sbatch".to_string(), args)
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
        let mut args = Vec::new();
        if !self.user.is_empty() {
            args.extend(["-u".to_string(), self.user.clone()]);
        }
        if !job_ids.is_empty() {
            let ids: Vec<String> = job_ids.iter().map(u64::to_string).collect();
            args.extend(["-j".to_string(), ids.join(",")]);
        }
        args.extend([
            "--array".to_string(),
            "-o".to_string(),
            "%10u %14F %14K %5t %o".to_string(),
        ]);
        let out = self.runner.run("squeue", &args).await?;
        if !out.success() {
            // squeue fails for job ids that left the queue
            tracing::debug!("squeue exited with {}: {}", out.code, out.stderr.trim());
        }
        Ok(Self::parse_jobs(&out.stdout))
    }

    /// Array task N runs line N of the argument list.
    fn chunk_args(&self, job: &BatchJob, joblist: &Path) -> Result<String, PicoError> {
        if job.task_id < 1 {
            return Err(PicoError::Integrity(format!(
                "Job {} has no array task id to look up in {}",
                job,
                joblist.display()
            )));
        }
        getline(joblist, (job.task_id - 1) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, ScriptedRunner};
    use tempfile::TempDir;

    const SQUEUE: &str = "\
USER         ARRAY_JOB_ID   ARRAY_TASK_ID  ST    COMMAND
ineuteli     4815162        1              R     python/batch/submit_SLURM.sh output/config/jobarglist_mutau_try1.txt
ineuteli     4815162        2              PD    python/batch/submit_SLURM.sh output/config/jobarglist_mutau_try1.txt
ineuteli     4815162        3              CG    python/batch/submit_SLURM.sh output/config/jobarglist_mutau_try1.txt
ineuteli     4815163        N/A            CA    other.sh
";

    fn request() -> SubmitRequest {
        SubmitRequest {
            script: "python/batch/submit_SLURM.sh".to_string(),
            name: "DYJets_mutau".to_string(),
            joblist: "output/config/jobarglist_mutau_try1.txt".to_string(),
            jobdir: "output".to_string(),
            logdir: "output/log".to_string(),
            njobs: 3,
            queue: Some("short".to_string()),
            time: Some("04:20:00".to_string()),
            mem: None,
            opts: vec!["--exclusive".to_string()],
            dry: false,
        }
    }

    #[test]
    fn test_parse_jobs() {
        let jobs = Slurm::parse_jobs(SQUEUE);
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].job_id, 4815162);
        assert_eq!(jobs[0].task_id, 1);
        assert_eq!(jobs[0].status, JobStatus::Running);
        assert_eq!(jobs[1].status, JobStatus::Queued);
        assert_eq!(
            jobs[1].args,
            "python/batch/submit_SLURM.sh output/config/jobarglist_mutau_try1.txt"
        );
        assert_eq!(jobs[2].task_id, -1);
        assert_eq!(jobs[2].status, JobStatus::Failed);
    }

    #[test]
    fn test_parse_job_ids() {
        assert_eq!(
            Slurm::parse_job_ids("Submitted batch job 4815162\n"),
            vec![4815162]
        );
        assert!(Slurm::parse_job_ids("sbatch: error: Batch job submission failed").is_empty());
    }

    #[test]
    fn test_submit_command() {
        let slurm = Slurm::new(Arc::new(ScriptedRunner::new()), "ineuteli");
        let (program, args) = slurm.submit_command(&request());
        assert_eq!(program, "sbatch");
        assert_eq!(
            args,
            vec![
                "-J",
                "DYJets_mutau",
                "-a",
                "1-3",
                "--partition",
                "short",
                "-o",
                "output/log/%x.%A.%a",
                "--time=04:20:00",
                "--exclusive",
                "python/batch/submit_SLURM.sh",
                "output/config/jobarglist_mutau_try1.txt",
            ]
        );
    }

    #[tokio::test]
    async fn test_submit_returns_job_id() {
        let runner = ScriptedRunner::new()
            .respond("sbatch", CommandOutput::ok("Submitted batch job 4815162\n"));
        let slurm = Slurm::new(Arc::new(runner.clone()), "ineuteli");
        let ids = slurm.submit(&request()).await.expect("submit");
        assert_eq!(ids, vec![4815162]);
        assert_eq!(runner.calls_to("sbatch").len(), 1);
    }

    #[tokio::test]
    async fn test_jobs_queries_user_and_ids() {
        let runner = ScriptedRunner::new().respond("squeue", CommandOutput::ok(SQUEUE));
        let slurm = Slurm::new(Arc::new(runner.clone()), "ineuteli");
        let jobs = slurm.jobs(&[4815162, 4815163]).await.expect("jobs");
        assert_eq!(jobs.len(), 3);
        let call = &runner.calls_to("squeue")[0];
        assert_eq!(call[1..5], ["-u", "ineuteli", "-j", "4815162,4815163"]);
        assert!(call.contains(&"--array".to_string()));
    }

    #[test]
    fn test_chunk_args_reads_task_line() {
        let tmp = TempDir::new().expect("tmp");
        let joblist = tmp.path().join("jobarglist.txt");
        std::fs::write(&joblist, "picojob.py -t _mutau_0\npicojob.py -t _mutau_1\n").expect("write");
        let slurm = Slurm::new(Arc::new(ScriptedRunner::new()), "ineuteli");
        let mut job = Slurm::parse_jobs(SQUEUE).remove(1);
        assert_eq!(
            slurm.chunk_args(&job, &joblist).expect("args"),
            "picojob.py -t _mutau_1"
        );
        job.task_id = -1;
        assert!(slurm.chunk_args(&job, &joblist).is_err());
    }
}
