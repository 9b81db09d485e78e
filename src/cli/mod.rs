pub mod config;
pub mod run;
pub mod status;
pub mod submit;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};

use crate::batch;
use crate::chunks::QueueCheck;
use crate::errors::PicoError;
use crate::inspect::RootInspector;
use crate::jobs::JobOptions;
use crate::models::{DataType, PicoConfig};
use crate::runner::{CommandRunner, ProcessRunner};
use crate::samples::{Discovery, SampleQuery};

/// PicoProducer - Process nanoAOD samples into pico ntuples on a batch system
#[derive(Parser, Debug)]
#[command(
    name = "pico",
    version,
    about = "PicoProducer - Process nanoAOD samples into pico ntuples on a batch system",
    infer_subcommands = true
)]
pub struct Cli {
    /// Verbosity level (repeat for more output)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Base directory with the processors and sample lists (default: current directory)
    #[arg(long, global = true)]
    pub basedir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Sample selection and common options.
#[derive(Args, Debug, Clone, Default)]
pub struct SampleArgs {
    /// Eras to process
    #[arg(short = 'y', short_alias = 'e', long = "era", num_args = 1..)]
    pub eras: Vec<String>,

    /// Channels to process
    #[arg(short = 'c', long = "channel", num_args = 1..)]
    pub channels: Vec<String>,

    /// Only use samples matching these patterns (glob or regex)
    #[arg(short = 's', long = "sample", num_args = 1..)]
    pub samples: Vec<String>,

    /// Exclude samples matching these patterns
    #[arg(short = 'x', long = "veto", num_args = 1..)]
    pub vetoes: Vec<String>,

    /// Only use samples of these data types (mc, data, embed)
    #[arg(long = "dtype", num_args = 1..)]
    pub dtypes: Vec<DataType>,

    /// Compare processed events to the number of events in DAS
    #[arg(short = 'D', long = "das")]
    pub das: bool,

    /// Tag appended to output names (prefixed with '_' if missing)
    #[arg(short = 't', long = "tag", default_value = "", value_parser = normalize_tag)]
    pub tag: String,

    /// Force the action despite warnings
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Dry run: print commands without executing them
    #[arg(short = 'd', long = "dry")]
    pub dry: bool,

    /// Extra key=value options passed to the processor
    #[arg(short = 'E', long = "opts", num_args = 1..)]
    pub extraopts: Vec<String>,
}

impl SampleArgs {
    pub fn query(&self) -> SampleQuery {
        SampleQuery {
            filters: self.samples.clone(),
            vetoes: self.vetoes.clone(),
            dtypes: self.dtypes.clone(),
        }
    }
}

/// Options of submit and resubmit.
#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    #[command(flatten)]
    pub sample: SampleArgs,

    /// Prefetch input files to the worker node
    #[arg(short = 'p', long)]
    pub prefetch: bool,

    /// Test run with two samples of two files, with N events per job
    #[arg(short = 'T', long = "test", num_args = 0..=1, default_value_t = 0, default_missing_value = "10000")]
    pub testrun: u64,

    /// Check the batch queue for pending jobs: 0 never, 1 once, -1 for every sample
    #[arg(long, num_args = 0..=1, default_value_t = -1, default_missing_value = "1", allow_negative_numbers = true)]
    pub getjobs: i64,

    /// Batch queue or partition
    #[arg(short = 'q', long)]
    pub queue: Option<String>,

    /// Ask before every submission
    #[arg(short = 'P', long)]
    pub prompt: bool,

    /// Extra options for the batch submit command
    #[arg(short = 'B', long = "batch-opts")]
    pub batch_opts: Option<String>,

    /// Wall time limit per job, e.g. 04:20:00
    #[arg(long)]
    pub time: Option<String>,

    /// Memory limit per job in MB
    #[arg(long)]
    pub mem: Option<String>,

    /// Number of files per job (default: from the configuration)
    #[arg(short = 'n', long = "filesperjob")]
    pub nfilesperjob: Option<usize>,

    /// Divide the number of files per job by N
    #[arg(long, num_args = 0..=1, default_value_t = 1, default_missing_value = "2")]
    pub split: usize,
}

/// Options of status and hadd.
#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub sample: SampleArgs,

    /// Check the batch queue for pending jobs: 0 never, 1 once, -1 for every sample
    #[arg(long, num_args = 0..=1, default_value_t = -1, default_missing_value = "1", allow_negative_numbers = true)]
    pub getjobs: i64,
}

/// Options of the local run.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub sample: SampleArgs,

    /// Maximum number of events to process
    #[arg(short = 'm', long = "maxevts")]
    pub maxevts: Option<u64>,

    /// Number of files per sample to process
    #[arg(short = 'n', long = "nfiles", default_value_t = 1)]
    pub nfiles: usize,

    /// Number of samples to process
    #[arg(short = 'S', long = "nsamples", default_value_t = 1)]
    pub nsamples: usize,

    /// Input files, instead of the files of a sample
    #[arg(short = 'i', long = "input", num_args = 1..)]
    pub infiles: Vec<String>,

    /// Output directory
    #[arg(short = 'o', long, default_value = "output")]
    pub outdir: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the configuration
    List,

    /// Get information on samples, their files, or a configuration variable
    Get {
        /// samples, files, or a configuration variable
        variable: String,

        #[command(flatten)]
        sample: SampleArgs,

        /// Write the file lists to a text file (default: the configured filelistdir)
        #[arg(short = 'w', long, num_args = 0..=1)]
        write: Option<Option<String>>,
    },

    /// Set a configuration variable, or link a channel or era key: set <variable> [key] <value>
    Set {
        /// Variable to change in the configuration
        variable: String,

        /// Optional channel or era key, followed by the value
        #[arg(num_args = 1..=2, required = true, value_names = ["KEY", "VALUE"])]
        values: Vec<String>,
    },

    /// Remove a configuration variable, or a channel or era key
    Rm {
        /// Variable to remove from the configuration
        variable: String,

        /// Channel or era key to remove
        key: Option<String>,
    },

    /// Link a channel to an analysis module or skim processor
    Channel {
        /// Channel key
        key: String,

        /// Module linked to the channel
        module: String,
    },

    /// Link an era to a sample list
    Era {
        /// Era key
        key: String,

        /// Sample list linked to the era
        samplelist: String,
    },

    /// Run a processor locally
    Run(RunArgs),

    /// Submit jobs to the batch system
    Submit(JobArgs),

    /// Resubmit failed and missing chunks
    Resubmit(JobArgs),

    /// Check the status of submitted jobs
    Status(StatusArgs),

    /// Merge the job output of each sample into one file
    Hadd {
        #[command(flatten)]
        status: StatusArgs,

        /// Remove job output, configurations and logs after merging
        #[arg(short = 'r', long)]
        clean: bool,
    },
}

/// Prefix a non-empty tag with '_'.
pub fn normalize_tag(tag: &str) -> Result<String, String> {
    if tag.is_empty() || tag.starts_with('_') {
        Ok(tag.to_string())
    } else {
        Ok(format!("_{}", tag))
    }
}

/// Check that the requested eras and channels are configured. Unless
/// `optional`, at least one of each must be given.
pub fn check_selection(config: &PicoConfig, sample: &SampleArgs, optional: bool) -> Result<(), PicoError> {
    if !optional && sample.eras.is_empty() {
        return Err(PicoError::Validation("Please specify at least one era (-y).".to_string()));
    }
    if !optional && sample.channels.is_empty() {
        return Err(PicoError::Validation("Please specify at least one channel (-c).".to_string()));
    }
    for era in &sample.eras {
        if !config.eras.contains_key(era) {
            let known: Vec<&str> = config.eras.keys().map(String::as_str).collect();
            return Err(PicoError::Validation(format!(
                "Era '{}' is not configured; choose from {}",
                era,
                known.join(", ")
            )));
        }
    }
    for channel in &sample.channels {
        if !config.channels.contains_key(channel) {
            let known: Vec<&str> = config.channels.keys().map(String::as_str).collect();
            return Err(PicoError::Validation(format!(
                "Channel '{}' is not configured; choose from {}",
                channel,
                known.join(", ")
            )));
        }
    }
    Ok(())
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Dispatch the CLI command to the appropriate handler.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    let Some(command) = &cli.command else {
        // No subcommand provided -- print help
        use clap::CommandFactory;
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let basedir = match &cli.basedir {
        Some(dir) => absolute(dir)?,
        None => std::env::current_dir()?,
    };
    let config_path = match &cli.config {
        Some(path) => absolute(path)?,
        None => config::resolve_config_path(None, &basedir),
    };
    let mut cfg = config::load_config(&config_path, cli.config.is_some())?;
    // Job, output and sample list paths are relative to the base directory.
    if cli.basedir.is_some() {
        std::env::set_current_dir(&basedir)
            .with_context(|| format!("Failed to enter base directory {}", basedir.display()))?;
    }
    tracing::debug!("basedir = {}, config = {}", basedir.display(), config_path.display());

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new(cfg.command_timeout_secs));
    let discovery = Discovery::new(runner.clone());

    match command {
        Commands::List => config::cmd_list(&cfg, &config_path),
        Commands::Get {
            variable,
            sample,
            write,
        } => {
            check_selection(&cfg, sample, true)?;
            let query = sample.query();
            let write = write
                .as_ref()
                .map(|w| w.clone().unwrap_or_else(|| cfg.filelistdir.clone()));
            let opts = config::GetOptions {
                eras: &sample.eras,
                channels: &sample.channels,
                tag: &sample.tag,
                query: &query,
                checkdas: sample.das,
                write: write.as_deref(),
            };
            config::cmd_get(&cfg, &discovery, variable, &opts).await
        }
        Commands::Set { variable, values } => {
            let (key, value) = match values.as_slice() {
                [key, value] => (Some(key.as_str()), value.as_str()),
                [value] => (None, value.as_str()),
                _ => anyhow::bail!("Usage: pico set <variable> [key] <value>"),
            };
            config::cmd_set(&mut cfg, &config_path, variable, key, value)
        }
        Commands::Rm { variable, key } => config::cmd_rm(&mut cfg, &config_path, variable, key.as_deref()),
        Commands::Channel { key, module } => config::cmd_link(&mut cfg, &config_path, "channel", key, module),
        Commands::Era { key, samplelist } => config::cmd_link(&mut cfg, &config_path, "era", key, samplelist),
        Commands::Run(args) => {
            check_selection(&cfg, &args.sample, true)?;
            let query = args.sample.query();
            let opts = run::RunOptions {
                eras: &args.sample.eras,
                channels: &args.sample.channels,
                tag: &args.sample.tag,
                query: &query,
                outdir: &args.outdir,
                extraopts: &args.sample.extraopts,
                maxevts: args.maxevts.unwrap_or(0),
                infiles: &args.infiles,
                nfiles: args.nfiles,
                nsamples: args.nsamples,
                dry: args.sample.dry,
            };
            run::cmd_run(&cfg, &basedir, &discovery, runner.as_ref(), &opts).await
        }
        Commands::Submit(args) | Commands::Resubmit(args) => {
            check_selection(&cfg, &args.sample, false)?;
            let resubmit = matches!(command, Commands::Resubmit(_));
            let batch = batch::from_kind(cfg.batch, runner.clone());
            let inspector = RootInspector::new(cfg.inspect_cmd.clone(), runner.clone());
            let job_options = JobOptions {
                resubmit,
                tag: args.sample.tag.clone(),
                query: args.sample.query(),
                checkdas: args.sample.das,
                extraopts: args.sample.extraopts.clone(),
                prefetch: args.prefetch,
                nfilesperjob: args.nfilesperjob,
                split: args.split,
                testrun: args.testrun,
            };
            let opts = submit::SubmitOptions {
                eras: &args.sample.eras,
                channels: &args.sample.channels,
                queue_check: QueueCheck::from_getjobs(args.getjobs),
                queue: args.queue.clone(),
                batch_opts: args
                    .batch_opts
                    .as_deref()
                    .map(|o| o.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
                time: args.time.clone(),
                mem: args.mem.clone(),
                prompt: args.prompt,
                dry: args.sample.dry,
            };
            submit::cmd_submit(
                &cfg,
                &basedir,
                batch.as_ref(),
                &inspector,
                &discovery,
                &job_options,
                &opts,
            )
            .await
        }
        Commands::Status(args) => track_jobs(&cfg, &discovery, runner, args, false, false).await,
        Commands::Hadd { status: args, clean } => track_jobs(&cfg, &discovery, runner, args, true, *clean).await,
    }
}

async fn track_jobs(
    cfg: &PicoConfig,
    discovery: &Discovery,
    runner: Arc<dyn CommandRunner>,
    args: &StatusArgs,
    hadd: bool,
    clean: bool,
) -> anyhow::Result<()> {
    check_selection(cfg, &args.sample, false)?;
    let batch = batch::from_kind(cfg.batch, runner.clone());
    let inspector = RootInspector::new(cfg.inspect_cmd.clone(), runner.clone());
    let query = args.sample.query();
    let opts = status::StatusOptions {
        eras: &args.sample.eras,
        channels: &args.sample.channels,
        tag: &args.sample.tag,
        query: &query,
        checkdas: args.sample.das,
        queue_check: QueueCheck::from_getjobs(args.getjobs),
        hadd,
        clean,
        force: args.sample.force,
        dry: args.sample.dry,
    };
    status::cmd_status(cfg, batch.as_ref(), &inspector, discovery, runner, &opts).await
}
