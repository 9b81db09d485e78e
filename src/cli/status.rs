// CLI job monitoring: status, hadd

use std::sync::Arc;

use anyhow::Result;

use crate::batch::BatchSystem;
use crate::chunks::{QueueCheck, Reconciler};
use crate::color::bold;
use crate::inspect::OutputInspector;
use crate::models::config::repkey;
use crate::models::{JobConfig, PicoConfig};
use crate::runner::CommandRunner;
use crate::samples::{getcfgsamples, Discovery, SampleQuery};
use crate::storage::{expand_glob, getstorage, SampleLock};

/// Options of `pico status` and `pico hadd`.
pub struct StatusOptions<'a> {
    pub eras: &'a [String],
    pub channels: &'a [String],
    pub tag: &'a str,
    pub query: &'a SampleQuery,
    pub checkdas: bool,
    pub queue_check: QueueCheck,
    pub hadd: bool,
    /// Remove job output, configurations and logs after merging.
    pub clean: bool,
    pub force: bool,
    pub dry: bool,
}

/// Files belonging to the jobs of one sample, as glob patterns.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFiles {
    pub infiles: String,
    pub cfgfiles: String,
    pub logfiles: String,
}

impl JobFiles {
    pub fn of(jobcfg: &JobConfig) -> Self {
        Self {
            infiles: format!("{}/*{}_[0-9]*.root", jobcfg.outdir, jobcfg.postfix),
            cfgfiles: format!("{}/job*{}_try[0-9]*.*", jobcfg.cfgdir, jobcfg.postfix),
            logfiles: format!("{}/*{}_try[0-9]*.*.*.log", jobcfg.logdir, jobcfg.postfix),
        }
    }
}

/// pico status / pico hadd
pub async fn cmd_status(
    config: &PicoConfig,
    batch: &dyn BatchSystem,
    inspector: &dyn OutputInspector,
    discovery: &Discovery,
    runner: Arc<dyn CommandRunner>,
    opts: &StatusOptions<'_>,
) -> Result<()> {
    let mut reconciler = Reconciler::new(batch, inspector, opts.queue_check);
    if opts.checkdas {
        reconciler = reconciler.with_das(discovery.das());
    }

    for era in opts.eras {
        for channel in opts.channels {
            println!(">>> {}", bold(&format!("{}, {}", era, channel)));
            let samples = getcfgsamples(config, era, channel, opts.tag, opts.query)?;
            tracing::debug!(
                "Found samples: {}",
                samples.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ")
            );
            if opts.hadd && PicoConfig::is_skim(channel) {
                tracing::warn!("Hadding into one file not available for skimming...");
                println!();
                continue;
            }
            if samples.is_empty() {
                println!(">>> Did not find any samples.");
            }

            for sample in samples {
                let Some(mut jobcfg) = sample.jobcfg.clone() else {
                    continue;
                };
                println!(">>> {}", bold(&sample.name));
                for path in &sample.paths {
                    println!(">>> {}", bold(path));
                }
                let _lock = SampleLock::acquire(std::path::Path::new(&jobcfg.jobdir))?;
                let outdir = getstorage(&jobcfg.outdir, runner.clone());
                tracing::info!("jobdir = {}, outdir = {}, logdir = {}", jobcfg.jobdir, jobcfg.outdir, jobcfg.logdir);
                let result = reconciler.reconcile(&mut jobcfg, outdir.as_ref()).await?;
                result.print();
                if !opts.hadd {
                    println!();
                    continue;
                }

                if result.needs_resubmission() && !opts.force {
                    tracing::warn!(
                        "Cannot hadd job output because {} chunks need to be resubmitted... \
                         Please use -f or --force to hadd anyway.",
                        result.bad.len() + result.missing.len()
                    );
                    println!();
                    continue;
                }
                let das = sample.paths[0].trim_matches('/').to_string();
                let storedir = repkey(
                    &config.picodir,
                    &[
                        ("ERA", era),
                        ("CHANNEL", channel),
                        ("TAG", opts.tag),
                        ("SAMPLE", sample.name.as_str()),
                        ("DAS", das.as_str()),
                        ("GROUP", sample.group.as_str()),
                    ],
                );
                let storage = getstorage(&storedir, runner.clone());
                let outfile = format!("{}_{}{}.root", sample.name, channel, opts.tag);
                let files = JobFiles::of(&jobcfg);
                println!(">>> Hadd'ing job output for '{}' into {}/{}", sample.name, storedir, outfile);
                let infiles: Vec<String> = expand_glob(&files.infiles)
                    .into_iter()
                    .map(|p| p.to_string_lossy().to_string())
                    .collect();
                storage.hadd(&infiles, &outfile, opts.dry).await?;

                if opts.clean {
                    let mut rmfiles = infiles;
                    for pattern in [&files.cfgfiles, &files.logfiles] {
                        rmfiles.extend(expand_glob(pattern).into_iter().map(|p| p.to_string_lossy().to_string()));
                    }
                    tracing::debug!("rmfiles = {:?}", rmfiles);
                    outdir.remove(&rmfiles, opts.dry).await?;
                }
                println!();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_files_patterns() {
        let jobcfg: JobConfig = serde_json::from_value(serde_json::json!({
            "time": "", "group": "DY", "name": "DYJets",
            "paths": ["/DYJets/RunIIAutumn18NanoAODv6/NANOAODSIM"], "dtype": "mc",
            "channel": "mutau", "extraopts": [], "try": 2, "chunkdict": {},
            "postfix": "_mutau_test", "outdir": "output/2018/mutau/DYJets",
            "cfgdir": "output/2018/mutau/DYJets/config", "logdir": "output/2018/mutau/DYJets/log",
        }))
        .expect("jobcfg");
        let files = JobFiles::of(&jobcfg);
        assert_eq!(files.infiles, "output/2018/mutau/DYJets/*_mutau_test_[0-9]*.root");
        assert_eq!(files.cfgfiles, "output/2018/mutau/DYJets/config/job*_mutau_test_try[0-9]*.*");
        assert_eq!(files.logfiles, "output/2018/mutau/DYJets/log/*_mutau_test_try[0-9]*.*.*.log");
    }
}
