//! Reconcile a sample's chunk map with the batch queue and its job output.

use std::path::Path;

use regex::Regex;

use crate::batch::BatchSystem;
use crate::chunks::{ChannelKind, ChunkStatus};
use crate::color::{color, Color};
use crate::das::Das;
use crate::errors::PicoError;
use crate::inspect::OutputInspector;
use crate::models::sample::default_instance;
use crate::models::{BatchJob, ChunkMap, JobConfig};
use crate::storage::StorageSystem;

/// How the batch queue is consulted for pending jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCheck {
    /// Do not look at the queue.
    Never,
    /// List all jobs of the user once and reuse the listing for every sample.
    Once,
    /// List the sample's jobs anew for every sample.
    Every,
}

impl QueueCheck {
    /// Map the `--getjobs` value: 0 never, negative every sample, else once.
    pub fn from_getjobs(value: i64) -> Self {
        match value {
            0 => QueueCheck::Never,
            v if v < 0 => QueueCheck::Every,
            _ => QueueCheck::Once,
        }
    }
}

/// Classification of every chunk of one sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub good: Vec<usize>,
    pub pending: Vec<usize>,
    pub bad: Vec<usize>,
    pub missing: Vec<usize>,
    /// Input files of bad and missing chunks, each exactly once.
    pub resubfiles: Vec<String>,
    /// Good and pending chunks, to be carried into the next try.
    pub chunkdict: ChunkMap,
    /// Number of chunks before reconciliation.
    pub nchunks: usize,
    pub nprocevents: i64,
    /// Expected events from DAS; 0 when unknown.
    pub ndasevents: u64,
}

impl Reconciliation {
    pub fn status(&self, index: usize) -> Option<ChunkStatus> {
        if self.good.contains(&index) {
            Some(ChunkStatus::Good)
        } else if self.pending.contains(&index) {
            Some(ChunkStatus::Pending)
        } else if self.bad.contains(&index) {
            Some(ChunkStatus::Bad)
        } else if self.missing.contains(&index) {
            Some(ChunkStatus::Missing)
        } else {
            None
        }
    }

    pub fn needs_resubmission(&self) -> bool {
        !self.resubfiles.is_empty()
    }

    fn line(&self, chunks: &[usize], label: &str, text: &str, col: Color, show: bool) -> Option<String> {
        if chunks.is_empty() {
            return None;
        }
        let ratio = color(&format!("{:4}/{}", chunks.len(), self.nchunks), col, false);
        let label = color(label, col, true);
        let list = if show {
            let indices: Vec<String> = chunks.iter().map(usize::to_string).collect();
            format!(": {}", indices.join(", "))
        } else {
            String::new()
        };
        Some(format!(">>> {} {} - {}{}", ratio, label, text, list))
    }

    /// Colored summary lines, one per non-empty category.
    pub fn summary(&self) -> Vec<String> {
        let mut events = String::new();
        if self.ndasevents > 0 {
            let pct = 100.0 * self.nprocevents as f64 / self.ndasevents as f64;
            let col = if pct > 90.0 {
                Color::Green
            } else if pct > 80.0 {
                Color::Yellow
            } else {
                Color::Red
            };
            events = format!(
                ": {}",
                color(
                    &format!("{}/{} ({}%)", self.nprocevents, self.ndasevents, pct as i64),
                    col,
                    true
                )
            );
        }
        let success = format!("Chunks with output in outdir{}", events);
        [
            self.line(&self.good, "SUCCESS", &success, Color::Green, false),
            self.line(&self.pending, "PEND", "Chunks with pending or running jobs", Color::White, true),
            self.line(&self.bad, "FAIL", "Chunks with corrupted output in outdir", Color::Red, true),
            self.line(&self.missing, "MISS", "Chunks with no output in outdir", Color::Red, true),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn print(&self) {
        for line in self.summary() {
            println!("{}", line);
        }
    }
}

/// Cross-references chunk maps with the batch queue and job output.
///
/// One reconciler serves a whole `status`, `resubmit` or `hadd` invocation so
/// that a global job listing is fetched at most once.
pub struct Reconciler<'a> {
    batch: &'a dyn BatchSystem,
    inspector: &'a dyn OutputInspector,
    das: Option<&'a Das>,
    queue_check: QueueCheck,
    listing: Option<Vec<BatchJob>>,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        batch: &'a dyn BatchSystem,
        inspector: &'a dyn OutputInspector,
        queue_check: QueueCheck,
    ) -> Self {
        Self {
            batch,
            inspector,
            das: None,
            queue_check,
            listing: None,
        }
    }

    /// Fill in unknown expected event counts from DAS.
    pub fn with_das(mut self, das: &'a Das) -> Self {
        self.das = Some(das);
        self
    }

    async fn sample_jobs(&mut self, job_ids: &[u64]) -> Result<Vec<BatchJob>, PicoError> {
        let jobs = match self.queue_check {
            QueueCheck::Never => return Ok(Vec::new()),
            QueueCheck::Once => {
                if self.listing.is_none() {
                    let listing = self.batch.jobs(&[]).await?;
                    tracing::debug!("Fetched {} jobs from the batch system", listing.len());
                    self.listing = Some(listing);
                }
                self.listing.clone().unwrap_or_default()
            }
            QueueCheck::Every => {
                if job_ids.is_empty() {
                    return Ok(Vec::new());
                }
                self.batch.jobs(job_ids).await?
            }
        };
        Ok(jobs
            .into_iter()
            .filter(|job| job_ids.contains(&job.job_id))
            .collect())
    }

    /// Classify every chunk of the job configuration.
    ///
    /// The configuration is left untouched apart from caching the expected
    /// event count; the pruned chunk map is returned instead. Any sign that
    /// the bookkeeping and the batch system or output directory disagree is
    /// returned as an integrity error.
    pub async fn reconcile(
        &mut self,
        jobcfg: &mut JobConfig,
        storage: &dyn StorageSystem,
    ) -> Result<Reconciliation, PicoError> {
        if let Some(das) = self.das {
            if jobcfg.nevents == 0 {
                let instance = default_instance(&jobcfg.paths);
                match das.total_nevents(&jobcfg.paths, instance).await {
                    Ok(nevents) => jobcfg.nevents = nevents,
                    Err(e) => tracing::warn!("Could not get the number of events of {}: {}", jobcfg.name, e),
                }
            }
        }
        tracing::debug!("ndasevents = {}", jobcfg.nevents);

        let kind = ChannelKind::of(&jobcfg.channel);
        let chunkdict = &jobcfg.chunkdict;
        let parser = kind.parser()?;

        let mut result = Reconciliation {
            nchunks: chunkdict.len(),
            ndasevents: jobcfg.nevents,
            ..Default::default()
        };

        for job in self.sample_jobs(&jobcfg.jobids).await? {
            if !job.status.is_active() {
                continue;
            }
            let joblist = jobcfg.joblist_for(job.job_id);
            let args = self.batch.chunk_args(&job, Path::new(joblist))?;
            let index = parser.parse_chunk_from_args(&args, chunkdict)?;
            tracing::debug!("Job {} ({}) runs chunk {}", job, job.status.letter(), index);
            result.pending.push(index);
        }

        let pattern = kind.output_pattern(&jobcfg.postfix);
        let fnames = storage.getfiles(&pattern, !storage.is_local()).await?;
        tracing::debug!("Found {} output files matching {} in {}", fnames.len(), pattern, storage.path());

        match kind {
            ChannelKind::Skim => self.check_skim(jobcfg, &fnames, &mut result).await?,
            ChannelKind::Analysis => self.check_analysis(jobcfg, &fnames, &mut result).await?,
        }

        for index in chunkdict.keys() {
            let count = [&result.good, &result.pending, &result.bad]
                .iter()
                .map(|set| set.iter().filter(|i| *i == index).count())
                .sum::<usize>();
            if count > 1 {
                return Err(PicoError::Integrity(format!(
                    "Found chunk {} {} times (good={}, pending={}, bad={}) for {}. \
                     Possible overcounting or conflicting job output file format!",
                    index,
                    count,
                    result.good.contains(index),
                    result.pending.iter().filter(|i| *i == index).count(),
                    result.bad.contains(index),
                    jobcfg.name
                )));
            }
        }

        result.good.sort_unstable();
        result.pending.sort_unstable();
        result.bad.sort_unstable();
        result.missing.sort_unstable();
        let kept: ChunkMap = chunkdict
            .iter()
            .filter(|(i, _)| result.good.contains(*i) || result.pending.contains(*i))
            .map(|(i, files)| (*i, files.clone()))
            .collect();
        result.chunkdict = kept;
        Ok(result)
    }

    /// One output file per input file, named `<input stem><postfix>.root`.
    async fn check_skim(
        &self,
        jobcfg: &JobConfig,
        fnames: &[String],
        result: &mut Reconciliation,
    ) -> Result<(), PicoError> {
        let chunkdict = &jobcfg.chunkdict;
        let suffix = format!("{}.root", jobcfg.postfix);
        let mut goodfiles: Vec<&str> = Vec::new();
        let mut badfiles: Vec<&str> = Vec::new();

        for fname in fnames {
            let input = fname.replace(&suffix, ".root");
            let infile = basename(&input);
            let found = chunkdict.iter().find_map(|(i, files)| {
                files
                    .iter()
                    .find(|f| basename(f) == infile)
                    .map(|f| (*i, f.as_str()))
            });
            let Some((index, fmatch)) = found else {
                tracing::debug!("No chunk for output {}", fname);
                continue;
            };
            if result.pending.contains(&index) {
                tracing::debug!("Output {} belongs to pending chunk {}", fname, index);
                continue;
            }
            let validity = self.inspector.inspect(fname).await?;
            if validity.is_valid() {
                result.nprocevents += validity.events();
                goodfiles.push(fmatch);
            } else {
                badfiles.push(fmatch);
            }
        }

        for (index, files) in chunkdict {
            if result.pending.contains(index) {
                continue;
            }
            if files.iter().all(|f| goodfiles.contains(&f.as_str())) {
                result.good.push(*index);
                continue;
            }
            let mut isbad = false;
            for fname in files {
                if badfiles.contains(&fname.as_str()) {
                    isbad = true;
                } else if goodfiles.contains(&fname.as_str()) {
                    continue;
                }
                push_resubfile(&mut result.resubfiles, *index, fname)?;
            }
            if isbad {
                result.bad.push(*index);
            } else {
                result.missing.push(*index);
            }
        }
        Ok(())
    }

    /// One output file per chunk, named `<...><postfix>_<index>.root`.
    async fn check_analysis(
        &self,
        jobcfg: &JobConfig,
        fnames: &[String],
        result: &mut Reconciliation,
    ) -> Result<(), PicoError> {
        let chunkdict = &jobcfg.chunkdict;
        let chunkexp = Regex::new(&format!(r".+{}_(\d+)\.root$", regex::escape(&jobcfg.postfix)))
            .map_err(|e| PicoError::Validation(format!("Invalid postfix {:?}: {}", jobcfg.postfix, e)))?;

        for fname in fnames {
            let Some(index) = chunkexp
                .captures(fname)
                .and_then(|caps| caps[1].parse::<usize>().ok())
            else {
                tracing::debug!("Did not recognize output file {}", fname);
                continue;
            };
            if !chunkdict.contains_key(&index) {
                return Err(PicoError::Integrity(format!(
                    "Found an impossible chunk {} for file {}! \
                     Possible overcounting or conflicting job output file format!",
                    index, fname
                )));
            }
            if result.pending.contains(&index) {
                continue;
            }
            let validity = self.inspector.inspect(fname).await?;
            if validity.is_valid() {
                tracing::debug!("Good output {} with {:?}", fname, validity);
                result.nprocevents += validity.events();
                result.good.push(index);
            } else {
                result.bad.push(index);
            }
        }

        for (index, files) in chunkdict {
            let resolved = result.good.contains(index) || result.pending.contains(index);
            if resolved && !result.bad.contains(index) {
                continue;
            }
            if !result.bad.contains(index) {
                result.missing.push(*index);
            }
            for fname in files {
                push_resubfile(&mut result.resubfiles, *index, fname)?;
            }
        }
        Ok(())
    }
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

fn push_resubfile(resubfiles: &mut Vec<String>, index: usize, fname: &str) -> Result<(), PicoError> {
    if resubfiles.iter().any(|f| f == fname) {
        return Err(PicoError::Integrity(format!(
            "Found file for chunk {} more than once: {}. \
             Possible overcounting or conflicting job output file format!",
            index, fname
        )));
    }
    resubfiles.push(fname.to_string());
    Ok(())
}
