pub mod jobs;
pub mod local;
pub mod xrootd;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::PicoError;
use crate::models::sample::glob_regex;
use crate::runner::{format_command, CommandRunner};

pub use jobs::{resubmission_configs, JobConfigStore, SampleLock};
pub use local::LocalStorage;
pub use xrootd::XrootdStorage;

/// A directory on some storage element holding job input or output.
#[async_trait]
pub trait StorageSystem: Send + Sync {
    fn path(&self) -> &str;

    /// Redirector prepended to file names for remote access.
    fn fileurl(&self) -> Option<&str>;

    /// Whether listed paths can be opened directly from this machine.
    fn is_local(&self) -> bool;

    async fn ensure_dir(&self) -> Result<(), PicoError>;

    /// Files matching a glob filter, sorted, optionally prefixed with the redirector.
    async fn getfiles(&self, filter: &str, url: bool) -> Result<Vec<String>, PicoError>;

    async fn remove(&self, files: &[String], dry: bool) -> Result<(), PicoError>;

    /// Merge `sources` into `target` inside this storage directory.
    async fn hadd(&self, sources: &[String], target: &str, dry: bool) -> Result<(), PicoError>;
}

/// Pick the storage system for a path.
pub fn getstorage(path: &str, runner: Arc<dyn CommandRunner>) -> Box<dyn StorageSystem> {
    if path.starts_with("/eos/") {
        Box::new(LocalStorage::with_url(path, "root://eosuser.cern.ch/", runner))
    } else if path.starts_with("/pnfs/psi.ch/") {
        Box::new(XrootdStorage::new(
            path,
            "t3dcachedb03.psi.ch",
            "root://t3dcachedb03.psi.ch:1094/",
            runner,
        ))
    } else {
        Box::new(LocalStorage::new(path, runner))
    }
}

/// Prefix a file name with a redirector unless it already is a URL.
pub fn with_url(url: Option<&str>, file: &str) -> String {
    match url {
        Some(url) if !file.contains("root://") => format!("{}{}", url, file),
        _ => file.to_string(),
    }
}

pub(crate) async fn run_hadd(
    runner: &dyn CommandRunner,
    sources: &[String],
    target: &str,
    dry: bool,
) -> Result<(), PicoError> {
    if sources.is_empty() {
        return Err(PicoError::NotFound(format!("No files to hadd into {}", target)));
    }
    let mut args = vec!["-f".to_string(), target.to_string()];
    args.extend(sources.iter().cloned());
    if dry {
        println!("Dry run: {}", format_command("hadd", &args));
        return Ok(());
    }
    let code = runner.run_streaming("hadd", &args).await?;
    if code != 0 {
        return Err(PicoError::Storage(format!(
            "hadd into {} failed with exit code {}",
            target, code
        )));
    }
    Ok(())
}

fn has_wildcard(part: &str) -> bool {
    part.contains('*') || part.contains('?') || part.contains('[')
}

/// Expand a path pattern with shell wildcards in any component. Hidden
/// entries are skipped. Returns existing paths, sorted.
pub fn expand_glob(pattern: &str) -> Vec<PathBuf> {
    let path = Path::new(pattern);
    let mut current = vec![PathBuf::new()];
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                if has_wildcard(&part) {
                    let Some(re) = glob_regex(&part) else {
                        return Vec::new();
                    };
                    let mut next = Vec::new();
                    for dir in &current {
                        let listed = if dir.as_os_str().is_empty() {
                            Path::new(".")
                        } else {
                            dir.as_path()
                        };
                        let Ok(entries) = std::fs::read_dir(listed) else {
                            continue;
                        };
                        for entry in entries.flatten() {
                            let name = entry.file_name().to_string_lossy().to_string();
                            if !name.starts_with('.') && re.is_match(&name) {
                                next.push(dir.join(&name));
                            }
                        }
                    }
                    current = next;
                } else {
                    for dir in &mut current {
                        dir.push(part.as_ref());
                    }
                }
            }
            other => {
                for dir in &mut current {
                    dir.push(other.as_os_str());
                }
            }
        }
    }
    current.retain(|p| p.exists());
    current.sort();
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ScriptedRunner;
    use tempfile::TempDir;

    #[test]
    fn test_getstorage_by_prefix() {
        let runner: Arc<dyn CommandRunner> = Arc::new(ScriptedRunner::new());
        let eos = getstorage("/eos/user/i/ineuteli/nano", runner.clone());
        assert_eq!(eos.fileurl(), Some("root://eosuser.cern.ch/"));
        let t3 = getstorage("/pnfs/psi.ch/cms/trivcat/store/user/x", runner.clone());
        assert_eq!(t3.fileurl(), Some("root://t3dcachedb03.psi.ch:1094/"));
        let local = getstorage("output/2018/mutau/DY", runner);
        assert_eq!(local.fileurl(), None);
        assert_eq!(local.path(), "output/2018/mutau/DY");
    }

    #[test]
    fn test_with_url() {
        assert_eq!(
            with_url(Some("root://cms-xrd-global.cern.ch/"), "/store/mc/a.root"),
            "root://cms-xrd-global.cern.ch//store/mc/a.root"
        );
        assert_eq!(
            with_url(Some("root://eosuser.cern.ch/"), "root://other//a.root"),
            "root://other//a.root"
        );
        assert_eq!(with_url(None, "/store/a.root"), "/store/a.root");
    }

    #[test]
    fn test_expand_glob_across_directories() {
        let tmp = TempDir::new().expect("tmp");
        for sample in ["DYJets", "TTbar", "WJets"] {
            let cfgdir = tmp.path().join(sample).join("config");
            std::fs::create_dir_all(&cfgdir).expect("mkdir");
            std::fs::write(cfgdir.join("jobconfig_mutau_try1.json"), "{}").expect("write");
        }
        std::fs::write(
            tmp.path().join("TTbar/config/jobconfig_mutau_try2.json"),
            "{}",
        )
        .expect("write");
        std::fs::write(tmp.path().join("TTbar/config/jobconfig_etau_try1.json"), "{}")
            .expect("write");

        let pattern = format!(
            "{}/*/config/jobconfig_mutau_try[0-9]*.json",
            tmp.path().display()
        );
        let found = expand_glob(&pattern);
        assert_eq!(found.len(), 4);
        assert!(found[0].ends_with("DYJets/config/jobconfig_mutau_try1.json"));
        assert!(found[2].ends_with("TTbar/config/jobconfig_mutau_try2.json"));
    }

    #[test]
    fn test_expand_glob_no_match() {
        let tmp = TempDir::new().expect("tmp");
        let pattern = format!("{}/nothing/*.json", tmp.path().display());
        assert!(expand_glob(&pattern).is_empty());
    }

    #[tokio::test]
    async fn test_run_hadd_requires_sources() {
        let runner = ScriptedRunner::new();
        let err = run_hadd(&runner, &[], "out.root", false)
            .await
            .expect_err("no sources");
        assert!(matches!(err, PicoError::NotFound(_)));
    }
}
