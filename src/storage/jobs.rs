use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;

use crate::models::config::repkey;
use crate::models::JobConfig;
use crate::storage::expand_glob;

/// Finds the job configurations written by earlier submissions.
pub struct JobConfigStore {
    pattern: String,
}

impl JobConfigStore {
    /// Store over every sample's job directory for one era, channel and tag.
    pub fn new(jobdir: &str, era: &str, channel: &str, tag: &str) -> Self {
        let jobdir = repkey(
            jobdir,
            &[
                ("ERA", era),
                ("CHANNEL", channel),
                ("TAG", tag),
                ("SAMPLE", "*"),
                ("GROUP", "*"),
                ("DAS", "*"),
            ],
        );
        let pattern = Path::new(&jobdir)
            .join("config")
            .join(format!("jobconfig_{}{}_try[0-9]*.json", channel, tag));
        Self {
            pattern: pattern.to_string_lossy().to_string(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Load the latest try of every sample. Unreadable configurations are
    /// skipped with a warning.
    pub fn latest(&self) -> Result<Vec<JobConfig>> {
        let mut latest: BTreeMap<String, JobConfig> = BTreeMap::new();
        for path in expand_glob(&self.pattern) {
            let jobcfg = match JobConfig::load(&path) {
                Ok(jobcfg) => jobcfg,
                Err(e) => {
                    tracing::warn!("Skipping job configuration {}: {}", path.display(), e);
                    continue;
                }
            };
            let newer = latest
                .get(&jobcfg.name)
                .map(|old| jobcfg.subtry > old.subtry)
                .unwrap_or(true);
            if newer {
                latest.insert(jobcfg.name.clone(), jobcfg);
            }
        }
        tracing::debug!("Found {} job configurations in {}", latest.len(), self.pattern);
        Ok(latest.into_values().collect())
    }
}

/// Configurations of later tries next to a first-try configuration.
pub fn resubmission_configs(cfgname: &str) -> Result<Vec<PathBuf>> {
    let re = Regex::new(r"try\d+\.json$").context("Invalid try pattern")?;
    let pattern = re.replace(cfgname, "try*.json");
    Ok(expand_glob(&pattern)
        .into_iter()
        .filter(|path| !path.to_string_lossy().ends_with("_try1.json"))
        .collect())
}

/// Exclusive advisory lock on a sample's job directory, released on drop.
pub struct SampleLock {
    _file: File,
    path: PathBuf,
}

impl SampleLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        let path = dir.join(".pico.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;
        tracing::debug!("Locking {}", path.display());
        fs4::fs_std::FileExt::lock_exclusive(&file)
            .with_context(|| format!("Failed to lock {}", path.display()))?;
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
