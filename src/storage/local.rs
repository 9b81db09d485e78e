use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::PicoError;
use crate::models::sample::glob_regex;
use crate::runner::CommandRunner;
use crate::storage::{run_hadd, with_url, StorageSystem};

/// A directory on a locally mounted file system (including FUSE-mounted EOS).
pub struct LocalStorage {
    path: String,
    fileurl: Option<String>,
    runner: Arc<dyn CommandRunner>,
}

impl LocalStorage {
    pub fn new(path: &str, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            path: path.to_string(),
            fileurl: None,
            runner,
        }
    }

    pub fn with_url(path: &str, fileurl: &str, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            path: path.to_string(),
            fileurl: Some(fileurl.to_string()),
            runner,
        }
    }
}

#[async_trait]
impl StorageSystem for LocalStorage {
    fn path(&self) -> &str {
        &self.path
    }

    fn fileurl(&self) -> Option<&str> {
        self.fileurl.as_deref()
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn ensure_dir(&self) -> Result<(), PicoError> {
        tokio::fs::create_dir_all(&self.path).await.map_err(|e| {
            PicoError::Storage(format!("Failed to create directory {}: {}", self.path, e))
        })
    }

    async fn getfiles(&self, filter: &str, url: bool) -> Result<Vec<String>, PicoError> {
        let mut entries = match tokio::fs::read_dir(&self.path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Directory {} does not exist yet", self.path);
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(PicoError::Storage(format!(
                    "Failed to list {}: {}",
                    self.path, e
                )))
            }
        };
        let re = glob_regex(filter)
            .ok_or_else(|| PicoError::Validation(format!("Invalid file filter '{}'", filter)))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if re.is_match(&name) {
                let file = Path::new(&self.path).join(&name).to_string_lossy().to_string();
                files.push(if url {
                    with_url(self.fileurl(), &file)
                } else {
                    file
                });
            }
        }
        files.sort();
        Ok(files)
    }

    async fn remove(&self, files: &[String], dry: bool) -> Result<(), PicoError> {
        for file in files {
            if dry {
                println!("Dry run: rm {}", file);
                continue;
            }
            match tokio::fs::remove_file(file).await {
                Ok(()) => tracing::debug!("Removed {}", file),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!("{} already removed", file)
                }
                Err(e) => {
                    return Err(PicoError::Storage(format!(
                        "Failed to remove {}: {}",
                        file, e
                    )))
                }
            }
        }
        Ok(())
    }

    async fn hadd(&self, sources: &[String], target: &str, dry: bool) -> Result<(), PicoError> {
        let target = Path::new(&self.path).join(target);
        if !dry {
            self.ensure_dir().await?;
        }
        run_hadd(
            self.runner.as_ref(),
            sources,
            &target.to_string_lossy(),
            dry,
        )
        .await
    }
}
