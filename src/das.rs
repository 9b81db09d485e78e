use std::sync::Arc;

use regex::Regex;

use crate::errors::PicoError;
use crate::runner::CommandRunner;

/// Client for the CMS data aggregation service, reached through `dasgoclient`.
pub struct Das {
    runner: Arc<dyn CommandRunner>,
}

impl Das {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn failure(query: &str, reason: &str) -> PicoError {
        PicoError::Das(format!(
            "Failed to call 'dasgoclient --query=\"{}\"' ({}). Please make sure:\n  \
             1) 'dasgoclient' command exists.\n  \
             2) You have a valid VOMS proxy. Use 'voms-proxy-init -voms cms -valid 200:0' or 'source utils/setupVOMS.sh'.\n  \
             3) The DAS dataset exists!",
            query, reason
        ))
    }

    pub async fn query(&self, query: &str) -> Result<String, PicoError> {
        tracing::debug!("dasgoclient --query={:?}", query);
        let args = vec![format!("--query={}", query)];
        let out = self
            .runner
            .run("dasgoclient", &args)
            .await
            .map_err(|e| Self::failure(query, &e.to_string()))?;
        if !out.success() {
            let reason = format!("exit code {}: {}", out.code, out.stderr.trim());
            return Err(Self::failure(query, &reason));
        }
        Ok(out.stdout)
    }

    /// Logical file names of a dataset.
    pub async fn files(&self, path: &str, instance: &str) -> Result<Vec<String>, PicoError> {
        let out = self
            .query(&format!("file dataset={} instance={}", path, instance))
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| line.ends_with(".root"))
            .map(str::to_string)
            .collect())
    }

    /// Number of events of a dataset; 0 with a warning when DAS does not report it.
    pub async fn nevents(&self, path: &str, instance: &str) -> Result<u64, PicoError> {
        let out = self
            .query(&format!("summary dataset={} instance={}", path, instance))
            .await?;
        match parse_nevents(&out) {
            Some(nevents) => Ok(nevents),
            None => {
                tracing::warn!("Could not get number of events from DAS for {:?}.", path);
                Ok(0)
            }
        }
    }

    /// Sum of events over all dataset paths of a sample.
    pub async fn total_nevents(&self, paths: &[String], instance: &str) -> Result<u64, PicoError> {
        let mut nevents = 0;
        for path in paths {
            nevents += self.nevents(path, instance).await?;
        }
        Ok(nevents)
    }
}

fn parse_nevents(summary: &str) -> Option<u64> {
    let re = Regex::new(r#""nevents":\s*(\d+)"#).ok()?;
    re.captures(summary).and_then(|c| c[1].parse().ok())
}
