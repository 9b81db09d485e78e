//! Job preparation: chunk a sample's input files and write one job command
//! line per chunk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::batch::{BatchSystem, SubmitRequest};
use crate::chunks::{assign_chunks, chunkify, Reconciler};
use crate::color::bold;
use crate::errors::PicoError;
use crate::models::config::repkey;
use crate::models::{BatchKind, ChunkMap, DataType, JobConfig, PicoConfig, Sample};
use crate::samples::{getcfgsamples, getsamples, Discovery, SampleQuery};
use crate::storage::{getstorage, resubmission_configs, SampleLock};

/// Script processing the input files of a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Processor {
    pub channel: String,
    pub module: String,
    pub script: PathBuf,
    /// Options given after the script name in a skim channel's definition.
    pub opts: String,
    pub skim: bool,
}

impl Processor {
    /// Skim channels name their processor script (plus options) directly;
    /// analysis channels run `picojob.py` with a module from `python/analysis/`.
    pub fn resolve(config: &PicoConfig, channel: &str, basedir: &Path) -> Result<Self, PicoError> {
        let module = config.module(channel)?.trim().to_string();
        let skim = PicoConfig::is_skim(channel);
        let (script, opts) = if skim {
            let mut parts = module.split_whitespace();
            let script = parts.next().unwrap_or_default().to_string();
            (script, parts.collect::<Vec<_>>().join(" "))
        } else {
            let modfile = basedir
                .join("python/analysis")
                .join(format!("{}.py", module.replace('.', "/")));
            if !modfile.is_file() {
                return Err(PicoError::NotFound(format!(
                    "Module '{}' does not exist in {}",
                    module,
                    modfile.display()
                )));
            }
            ("picojob.py".to_string(), String::new())
        };
        let procpath = basedir.join("python/processors").join(&script);
        if !procpath.is_file() {
            return Err(PicoError::NotFound(format!(
                "Processor '{}' does not exist in '{}'...",
                script,
                procpath.display()
            )));
        }
        Ok(Self {
            channel: channel.to_string(),
            module,
            script: procpath,
            opts,
            skim,
        })
    }

    fn head(&self) -> String {
        let mut cmd = self.script.to_string_lossy().to_string();
        if !self.opts.is_empty() {
            cmd.push(' ');
            cmd.push_str(&self.opts);
        }
        cmd
    }
}

/// Settings of one `submit` or `resubmit` invocation.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub resubmit: bool,
    pub tag: String,
    pub query: SampleQuery,
    /// Look up expected event counts in DAS.
    pub checkdas: bool,
    pub extraopts: Vec<String>,
    pub prefetch: bool,
    /// Overrides the configured number of files per job.
    pub nfilesperjob: Option<usize>,
    /// Divide the number of files per job by this factor.
    pub split: usize,
    /// Events per job in a test run of two samples with two files; 0 for a real run.
    pub testrun: u64,
}

/// Files per job: a positive sample setting wins over the default, then the
/// result is divided by `split` without going below one.
pub fn files_per_job(sample_nfpj: i64, default: usize, split: usize) -> usize {
    let nfpj = if sample_nfpj > 0 {
        sample_nfpj as usize
    } else {
        default
    };
    if split > 1 {
        (nfpj / split).max(1)
    } else {
        nfpj.max(1)
    }
}

/// Job name: the sample name plus the job tag, without the try suffix on the
/// first try.
pub fn job_name(sample: &str, postfix: &str, subtry: u32) -> String {
    if subtry <= 1 {
        format!("{}{}", sample, postfix)
    } else {
        format!("{}{}_try{}", sample, postfix, subtry)
    }
}

/// Command line of one batch job.
#[allow(clippy::too_many_arguments)]
pub fn job_command(
    processor: &Processor,
    era: &str,
    dtype: DataType,
    outdir: &str,
    filetag: &str,
    prefetch: bool,
    testrun: u64,
    extraopts: &[String],
    files: &[String],
) -> String {
    let mut cmd = processor.head();
    if processor.skim {
        cmd.push_str(&format!(
            " -y {} -d '{}' --copydir {} -t {}",
            era, dtype, outdir, filetag
        ));
    } else {
        cmd.push_str(&format!(
            " -y {} -d '{}' -c {} -M {} --copydir {} -t {}",
            era, dtype, processor.channel, processor.module, outdir, filetag
        ));
    }
    if prefetch {
        cmd.push_str(" -p");
    }
    if testrun > 0 {
        cmd.push_str(&format!(" -m {}", testrun));
    }
    if !extraopts.is_empty() {
        cmd.push_str(&format!(" --opt '{}'", extraopts.join("' '")));
    }
    cmd.push_str(&format!(" -i {}", files.join(" ")));
    cmd
}

/// Command line of a local run.
#[allow(clippy::too_many_arguments)]
pub fn run_command(
    processor: &Processor,
    era: &str,
    outdir: &str,
    dtype: Option<DataType>,
    filetag: &str,
    maxevts: u64,
    files: &[String],
    extraopts: &[String],
) -> String {
    let mut cmd = processor.head();
    if processor.skim {
        cmd.push_str(&format!(" -y {} -o {}", era, outdir));
    } else {
        cmd.push_str(&format!(
            " -y {} -c {} -M {} -o {}",
            era, processor.channel, processor.module, outdir
        ));
    }
    if let Some(dtype) = dtype {
        cmd.push_str(&format!(" -d '{}'", dtype));
    }
    if !filetag.is_empty() {
        cmd.push_str(&format!(" -t '{}'", filetag));
    }
    if maxevts > 0 {
        cmd.push_str(&format!(" -m {}", maxevts));
    }
    if !files.is_empty() {
        cmd.push_str(&format!(" -i {}", files.join(" ")));
    }
    if !extraopts.is_empty() {
        cmd.push_str(&format!(" --opt '{}'", extraopts.join("' '")));
    }
    cmd
}

/// A job configuration ready for submission. The sample's job directory
/// stays locked until this is dropped.
pub struct PreparedJob {
    pub jobcfg: JobConfig,
    _lock: SampleLock,
}

/// Prepares the (re)submission of every sample of an era and channel.
pub struct JobPreparer<'a> {
    config: &'a PicoConfig,
    options: &'a JobOptions,
    discovery: &'a Discovery,
    reconciler: Reconciler<'a>,
}

impl<'a> JobPreparer<'a> {
    pub fn new(
        config: &'a PicoConfig,
        options: &'a JobOptions,
        discovery: &'a Discovery,
        reconciler: Reconciler<'a>,
    ) -> Self {
        Self {
            config,
            options,
            discovery,
            reconciler,
        }
    }

    /// Samples to process: from the sample list on a first submission, from
    /// the latest job configurations on resubmission.
    pub fn samples(&self, era: &str, channel: &str) -> Result<Vec<Sample>> {
        let tag = &self.options.tag;
        let mut samples = if self.options.resubmit {
            getcfgsamples(self.config, era, channel, tag, &self.options.query)?
        } else {
            getsamples(self.config, era, channel, tag, &self.options.query)?
        };
        samples.retain(|s| s.has_channel(channel));
        if self.options.testrun > 0 {
            samples.truncate(2);
        }
        tracing::debug!(
            "Found samples: {}",
            samples.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ")
        );
        Ok(samples)
    }

    /// Build the job configuration and argument list of one sample.
    pub async fn prepare(&mut self, era: &str, processor: &Processor, sample: &mut Sample) -> Result<PreparedJob> {
        let options = self.options;
        let channel = processor.channel.as_str();
        let tag = options.tag.as_str();
        println!(">>> {}", bold(&sample.name));
        for path in &sample.paths {
            println!(">>> {}", bold(path));
        }

        let subtry = if options.resubmit { sample.subtry + 1 } else { 1 };
        let oldcfg = sample.jobcfg.clone();
        let jobids = oldcfg.as_ref().map(|c| c.jobids.clone()).unwrap_or_default();
        let postfix = format!("_{}{}", channel, tag);
        let jobtag = format!("{}_try{}", postfix, subtry);
        let jobname = job_name(&sample.name, &postfix, subtry);
        let mut extraopts = options.extraopts.clone();
        extraopts.extend(sample.extraopts.iter().cloned());
        let nfilesperjob = files_per_job(
            sample.nfilesperjob,
            options.nfilesperjob.unwrap_or(self.config.nfilesperjob),
            options.split,
        );

        let das = sample.paths[0].trim_matches('/').to_string();
        let keys = [
            ("ERA", era),
            ("CHANNEL", channel),
            ("TAG", tag),
            ("SAMPLE", sample.name.as_str()),
            ("DAS", das.as_str()),
            ("GROUP", sample.group.as_str()),
        ];
        let outdirformat = if processor.skim {
            &self.config.nanodir
        } else {
            &self.config.outdir
        };
        let outdir = repkey(outdirformat, &keys);
        let jobdir = repkey(&self.config.jobdir, &keys);
        let cfgdir = format!("{}/config", jobdir);
        let logdir = format!("{}/log", jobdir);
        for dir in [&cfgdir, &logdir] {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create directory {}", dir))?;
        }
        let cfgname = format!("{}/jobconfig{}.json", cfgdir, jobtag);
        let joblist = format!("{}/jobarglist{}.txt", cfgdir, jobtag);
        tracing::info!("cfgname = {}", cfgname);
        tracing::info!("joblist = {}", joblist);
        tracing::debug!(
            "Preparing job {}submission for '{}': jobname={} jobtag={} outdir={} try={} jobids={:?}",
            if options.resubmit { "re" } else { "" },
            sample.name,
            jobname,
            jobtag,
            outdir,
            subtry,
            jobids
        );

        if Path::new(&cfgname).is_file() {
            tracing::warn!(
                "Job configuration {:?} already exists and will be overwritten! Beware of conflicting job output!",
                cfgname
            );
        }
        if !options.resubmit {
            let cfgnames = resubmission_configs(&cfgname)?;
            if !cfgnames.is_empty() {
                let list: Vec<String> = cfgnames.iter().map(|p| p.display().to_string()).collect();
                tracing::warn!(
                    "Job configurations for resubmission already exist! This can cause conflicting job output! \
                     If you are sure you want to submit from scratch, please remove these files:\n>>>   {}",
                    list.join("\n>>>   ")
                );
            }
        }

        let lock = SampleLock::acquire(Path::new(&jobdir))?;
        let storage = getstorage(&outdir, self.discovery.runner());
        storage.ensure_dir().await?;

        let (mut infiles, mut chunkdict, nevents, jobarglists) = match oldcfg {
            Some(mut oldcfg) if options.resubmit => {
                let result = self.reconciler.reconcile(&mut oldcfg, storage.as_ref()).await?;
                result.print();
                (result.resubfiles, result.chunkdict, oldcfg.nevents, oldcfg.jobarglists)
            }
            _ => {
                let files = self.discovery.getfiles(sample, false, true).await?;
                let nevents = if options.checkdas {
                    self.discovery.getnevents(sample, false).await?
                } else {
                    0
                };
                (files, ChunkMap::new(), nevents, Default::default())
            }
        };
        if options.testrun > 0 {
            infiles.truncate(2);
        }
        infiles.sort();
        tracing::info!("nfilesperjob = {}, nfiles = {}", nfilesperjob, infiles.len());
        tracing::debug!("infiles = {:?}, nevents = {}", infiles, nevents);

        let fchunks = chunkify(&infiles, nfilesperjob);
        let nchunks = fchunks.len();
        let chunks = assign_chunks(&mut chunkdict, fchunks);
        tracing::info!("nchunks = {}", nchunks);

        if !chunks.is_empty() {
            let mut lines = Vec::with_capacity(chunks.len());
            for ichunk in &chunks {
                let filetag = if processor.skim {
                    postfix.clone()
                } else {
                    format!("{}_{}", postfix, ichunk)
                };
                let files = chunkdict.get(ichunk).map(Vec::as_slice).unwrap_or_default();
                let jobcmd = job_command(
                    processor,
                    era,
                    sample.dtype(),
                    &outdir,
                    &filetag,
                    options.prefetch,
                    options.testrun,
                    &extraopts,
                    files,
                );
                tracing::info!("{}", jobcmd);
                lines.push(jobcmd);
            }
            tracing::info!("Creating job list {}...", joblist);
            let mut content = lines.join("\n");
            content.push('\n');
            std::fs::write(&joblist, content).with_context(|| format!("Failed to write job list {}", joblist))?;
        }

        let jobcfg = JobConfig {
            time: JobConfig::timestamp(),
            group: sample.group.clone(),
            name: sample.name.clone(),
            paths: sample.paths.clone(),
            nevents,
            dtype: sample.dtype(),
            channel: channel.to_string(),
            module: processor.module.clone(),
            extraopts,
            jobname,
            jobtag,
            tag: tag.to_string(),
            postfix,
            subtry,
            jobids,
            outdir,
            jobdir,
            cfgdir,
            logdir,
            cfgname,
            joblist,
            nfiles: infiles.len(),
            files: infiles,
            nfilesperjob,
            nchunks,
            chunks,
            chunkdict,
            jobarglists,
            path: None,
        };
        Ok(PreparedJob { jobcfg, _lock: lock })
    }
}

/// Submission of a prepared job configuration as one job array.
pub fn submit_request(
    batch: &dyn BatchSystem,
    jobcfg: &JobConfig,
    queue: Option<String>,
    opts: Vec<String>,
    testrun: bool,
    dry: bool,
) -> SubmitRequest {
    let queue = match queue {
        None if testrun && batch.kind() == BatchKind::HTCondor => Some("espresso".to_string()),
        queue => queue,
    };
    SubmitRequest {
        script: batch.script().to_string(),
        name: jobcfg.jobname.clone(),
        joblist: jobcfg.joblist.clone(),
        jobdir: jobcfg.jobdir.clone(),
        logdir: jobcfg.logdir.clone(),
        njobs: jobcfg.nchunks,
        queue,
        time: None,
        mem: None,
        opts,
        dry,
    }
}

/// Record submitted job ids and write the job configuration. Nothing is
/// written when no job id came back.
pub fn record_submission(jobcfg: &mut JobConfig, job_ids: &[u64]) -> Result<Option<PathBuf>, PicoError> {
    if job_ids.is_empty() {
        return Ok(None);
    }
    for job_id in job_ids {
        jobcfg.add_job(*job_id);
    }
    tracing::info!("Creating config file '{}'...", jobcfg.cfgname);
    jobcfg.save().map(Some)
}
