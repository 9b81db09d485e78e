// CLI job submission: submit, resubmit

use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::Result;

use crate::batch::BatchSystem;
use crate::chunks::{QueueCheck, Reconciler};
use crate::color::bold;
use crate::inspect::OutputInspector;
use crate::jobs::{record_submission, submit_request, JobOptions, JobPreparer, Processor};
use crate::models::PicoConfig;
use crate::samples::Discovery;

/// Options of `pico submit` and `pico resubmit` beyond job preparation.
pub struct SubmitOptions<'a> {
    pub eras: &'a [String],
    pub channels: &'a [String],
    pub queue_check: QueueCheck,
    pub queue: Option<String>,
    pub batch_opts: Vec<String>,
    pub time: Option<String>,
    pub mem: Option<String>,
    pub prompt: bool,
    pub dry: bool,
}

/// Answer to the submission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Yes,
    No,
    /// Submit this and every following sample without asking.
    All,
    Quit,
    Invalid,
}

pub fn parse_answer(input: &str) -> Answer {
    let input = input.trim().to_lowercase();
    if input.contains('q') || input.contains("exit") {
        Answer::Quit
    } else if input.contains('f') || input.contains("all") {
        Answer::All
    } else if input.contains('y') {
        Answer::Yes
    } else if input.contains('n') {
        Answer::No
    } else {
        Answer::Invalid
    }
}

fn ask(njobs: usize) -> Result<Answer> {
    let stdin = io::stdin();
    loop {
        print!(">>> Do you want to submit {} jobs to the batch system? [y/n] ", njobs);
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(Answer::Quit);
        }
        match parse_answer(&line) {
            Answer::Invalid => println!(">>> '{}' is not a valid answer, please choose y/n.", line.trim()),
            answer => return Ok(answer),
        }
    }
}

/// pico submit / pico resubmit
pub async fn cmd_submit(
    config: &PicoConfig,
    basedir: &Path,
    batch: &dyn BatchSystem,
    inspector: &dyn OutputInspector,
    discovery: &Discovery,
    job_options: &JobOptions,
    opts: &SubmitOptions<'_>,
) -> Result<()> {
    let verb = if job_options.resubmit { "re" } else { "" };
    let mut prompt = opts.prompt;
    let mut reconciler = Reconciler::new(batch, inspector, opts.queue_check);
    if job_options.checkdas {
        reconciler = reconciler.with_das(discovery.das());
    }
    let mut preparer = JobPreparer::new(config, job_options, discovery, reconciler);

    for era in opts.eras {
        for channel in opts.channels {
            println!(">>> {}", bold(&format!("{}, {}", era, channel)));
            let processor = Processor::resolve(config, channel, basedir)?;
            tracing::debug!("processor = {}", processor.script.display());
            let mut samples = preparer.samples(era, channel)?;
            if samples.is_empty() {
                println!(">>> Did not find any samples.");
                tracing::info!("filters = {:?}, vetoes = {:?}", job_options.query.filters, job_options.query.vetoes);
            }

            for sample in samples.iter_mut() {
                let mut prepared = preparer.prepare(era, &processor, sample).await?;
                let jobcfg = &mut prepared.jobcfg;
                if jobcfg.nchunks == 0 {
                    println!(">>>   Nothing to {}submit!", verb);
                    println!();
                    continue;
                }
                let mut request = submit_request(
                    batch,
                    jobcfg,
                    opts.queue.clone(),
                    opts.batch_opts.clone(),
                    job_options.testrun > 0,
                    opts.dry,
                );
                request.time = opts.time.clone();
                request.mem = opts.mem.clone();

                let submit = if prompt {
                    match ask(jobcfg.nchunks)? {
                        Answer::Quit => {
                            println!(">>> Quitting...");
                            return Ok(());
                        }
                        Answer::All => {
                            println!(">>> Force submission...");
                            prompt = false;
                            true
                        }
                        Answer::Yes => true,
                        _ => {
                            println!(">>> Not submitting.");
                            false
                        }
                    }
                } else {
                    true
                };
                if submit {
                    let job_ids = batch.submit(&request).await?;
                    if let Some(path) = record_submission(jobcfg, &job_ids)? {
                        println!(">>> Submitted job {:?}, config {}", job_ids, path.display());
                    }
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
    fn test_parse_answer() {
        assert_eq!(parse_answer("y\n"), Answer::Yes);
        assert_eq!(parse_answer("Yes"), Answer::Yes);
        assert_eq!(parse_answer("n"), Answer::No);
        assert_eq!(parse_answer("force"), Answer::All);
        assert_eq!(parse_answer("all"), Answer::All);
        assert_eq!(parse_answer("q"), Answer::Quit);
        assert_eq!(parse_answer("exit"), Answer::Quit);
        assert_eq!(parse_answer("maybe"), Answer::Yes);
        assert_eq!(parse_answer("ok"), Answer::Invalid);
    }
}
