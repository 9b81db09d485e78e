use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::PicoError;
use crate::models::sample::glob_regex;
use crate::runner::{format_command, CommandRunner};
use crate::storage::{run_hadd, with_url, StorageSystem};

/// A remote storage element reached through `xrdfs`.
pub struct XrootdStorage {
    path: String,
    host: String,
    fileurl: String,
    runner: Arc<dyn CommandRunner>,
}

impl XrootdStorage {
    pub fn new(path: &str, host: &str, fileurl: &str, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            path: path.to_string(),
            host: host.to_string(),
            fileurl: fileurl.to_string(),
            runner,
        }
    }

    async fn xrdfs(&self, args: &[&str]) -> Result<String, PicoError> {
        let mut full = vec![self.host.clone()];
        full.extend(args.iter().map(|s| s.to_string()));
        let out = self.runner.run("xrdfs", &full).await?;
        if !out.success() {
            return Err(PicoError::Storage(format!(
                "'{}' failed with exit code {}: {}",
                format_command("xrdfs", &full),
                out.code,
                out.stderr.trim()
            )));
        }
        Ok(out.stdout)
    }
}

#[async_trait]
impl StorageSystem for XrootdStorage {
    fn path(&self) -> &str {
        &self.path
    }

    fn fileurl(&self) -> Option<&str> {
        Some(&self.fileurl)
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn ensure_dir(&self) -> Result<(), PicoError> {
        self.xrdfs(&["mkdir", "-p", self.path.as_str()]).await.map(|_| ())
    }

    async fn getfiles(&self, filter: &str, url: bool) -> Result<Vec<String>, PicoError> {
        let re = glob_regex(filter)
            .ok_or_else(|| PicoError::Validation(format!("Invalid file filter '{}'", filter)))?;
        let listing = self.xrdfs(&["ls", self.path.as_str()]).await?;
        let mut files: Vec<String> = listing
            .lines()
            .map(str::trim)
            .filter(|line| {
                Path::new(line)
                    .file_name()
                    .map(|name| re.is_match(&name.to_string_lossy()))
                    .unwrap_or(false)
            })
            .map(|line| {
                if url {
                    with_url(Some(&self.fileurl), line)
                } else {
                    line.to_string()
                }
            })
            .collect();
        files.sort();
        Ok(files)
    }

    async fn remove(&self, files: &[String], dry: bool) -> Result<(), PicoError> {
        for file in files {
            let file = file.strip_prefix(&self.fileurl).unwrap_or(file);
            if dry {
                println!("Dry run: xrdfs {} rm {}", self.host, file);
                continue;
            }
            self.xrdfs(&["rm", file]).await?;
        }
        Ok(())
    }

    async fn hadd(&self, sources: &[String], target: &str, dry: bool) -> Result<(), PicoError> {
        let target = Path::new(&self.path).join(target);
        let target = with_url(Some(&self.fileurl), &target.to_string_lossy());
        run_hadd(self.runner.as_ref(), sources, &target, dry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, ScriptedRunner};

    const DIR: &str = "/pnfs/psi.ch/cms/trivcat/store/user/ineuteli/nano/DY";

    fn storage(runner: &ScriptedRunner) -> XrootdStorage {
        XrootdStorage::new(
            DIR,
            "t3dcachedb03.psi.ch",
            "root://t3dcachedb03.psi.ch:1094/",
            Arc::new(runner.clone()),
        )
    }

    #[tokio::test]
    async fn test_getfiles_lists_remote() {
        let listing = format!(
            "{dir}/nano_2_skim.root\n{dir}/nano_1_skim.root\n{dir}/log.txt\n",
            dir = DIR
        );
        let runner = ScriptedRunner::new().respond("xrdfs", CommandOutput::ok(&listing));
        let files = storage(&runner)
            .getfiles("*_skim.root", true)
            .await
            .expect("getfiles");
        assert_eq!(files.len(), 2);
        assert_eq!(
            files[0],
            format!("root://t3dcachedb03.psi.ch:1094/{}/nano_1_skim.root", DIR)
        );
        assert_eq!(runner.calls()[0], vec!["xrdfs", "t3dcachedb03.psi.ch", "ls", DIR]);
    }

    #[tokio::test]
    async fn test_remove_strips_url() {
        let runner = ScriptedRunner::new();
        let file = format!("root://t3dcachedb03.psi.ch:1094/{}/nano_1_skim.root", DIR);
        storage(&runner).remove(&[file], false).await.expect("remove");
        let call = &runner.calls()[0];
        assert_eq!(call[2], "rm");
        assert_eq!(call[3], format!("{}/nano_1_skim.root", DIR));
    }

    #[tokio::test]
    async fn test_listing_failure() {
        let runner =
            ScriptedRunner::new().respond("xrdfs", CommandOutput::failed(54, "No such file"));
        let err = storage(&runner)
            .getfiles("*.root", false)
            .await
            .expect_err("should fail");
        assert!(matches!(err, PicoError::Storage(_)));
    }
}
