// CLI local processing: run

use std::path::Path;

use anyhow::Result;

use crate::color::bold;
use crate::jobs::{run_command, Processor};
use crate::models::{DataType, PicoConfig, Sample};
use crate::runner::CommandRunner;
use crate::samples::{getsamples, Discovery, SampleQuery};

/// Options of `pico run`.
pub struct RunOptions<'a> {
    pub eras: &'a [String],
    pub channels: &'a [String],
    pub tag: &'a str,
    pub query: &'a SampleQuery,
    pub outdir: &'a str,
    pub extraopts: &'a [String],
    pub maxevts: u64,
    /// User-given input files; no samples are looked up when set.
    pub infiles: &'a [String],
    pub nfiles: usize,
    pub nsamples: usize,
    pub dry: bool,
}

/// pico run
pub async fn cmd_run(
    config: &PicoConfig,
    basedir: &Path,
    discovery: &Discovery,
    runner: &dyn CommandRunner,
    opts: &RunOptions<'_>,
) -> Result<()> {
    if opts.eras.is_empty() {
        println!(">>> Please specify a valid era (-y).");
    }
    if opts.channels.is_empty() {
        println!(">>> Please specify a valid channel (-c).");
    }
    let query = opts.query;
    let use_samples = opts.infiles.is_empty()
        && (!query.filters.is_empty() || !query.vetoes.is_empty() || !query.dtypes.is_empty());

    for era in opts.eras {
        for channel in opts.channels {
            println!(">>> {}", bold(&format!("{}, {}", era, channel)));
            let processor = Processor::resolve(config, channel, basedir)?;
            let outdir = opts.outdir;
            std::fs::create_dir_all(outdir)?;
            tracing::info!("Running {:?} with processor {}", channel, processor.script.display());

            let samples: Vec<Option<Sample>> = if use_samples {
                let mut samples = getsamples(config, era, channel, opts.tag, query)?;
                if opts.nsamples > 0 {
                    samples.truncate(opts.nsamples);
                }
                if samples.is_empty() {
                    println!(">>> Did not find any samples.");
                }
                samples.into_iter().map(Some).collect()
            } else {
                vec![None]
            };

            for sample in samples {
                let mut filetag = opts.tag.to_string();
                let mut extraopts = opts.extraopts.to_vec();
                let mut dtype: Option<DataType> = None;
                let mut infiles = opts.infiles.to_vec();
                if let Some(mut sample) = sample {
                    println!(">>> {}", bold(&sample.name));
                    filetag.push_str(&format!("_{}_{}", era, sample.name));
                    extraopts.extend(sample.extraopts.iter().cloned());
                    if infiles.is_empty() {
                        infiles = discovery.getfiles(&mut sample, false, true).await?;
                        if opts.nfiles > 0 {
                            infiles.truncate(opts.nfiles);
                        }
                        dtype = Some(sample.dtype());
                    }
                }
                tracing::debug!("filetag = {:?}, extraopts = {:?}, infiles = {:?}", filetag, extraopts, infiles);

                let runcmd = run_command(
                    &processor,
                    era,
                    outdir,
                    dtype,
                    &filetag,
                    opts.maxevts,
                    &infiles,
                    &extraopts,
                );
                println!(">>> Executing: {}", bold(&runcmd));
                if !opts.dry {
                    let code = runner
                        .run_streaming("sh", &["-c".to_string(), runcmd])
                        .await?;
                    if code != 0 {
                        tracing::warn!("Processor exited with code {}", code);
                    }
                }
                println!();
            }
        }
    }
    Ok(())
}
