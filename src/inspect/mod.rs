pub mod rootfile;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::PicoError;
use crate::runner::{format_command, CommandRunner};

pub use rootfile::{read_keys, KeyEntry};

/// Outcome of checking one job output file.
#[derive(Debug, Clone, PartialEq)]
pub enum Validity {
    /// The file closed properly; holds the number of processed events.
    Valid(i64),
    Invalid(String),
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validity::Valid(_))
    }

    /// Processed events counted toward the total. Suspicious non-positive
    /// counts contribute nothing.
    pub fn events(&self) -> i64 {
        match self {
            Validity::Valid(n) => (*n).max(0),
            Validity::Invalid(_) => 0,
        }
    }
}

/// Checks whether a job output file is complete.
///
/// An `Err` means the file could not be judged at all, e.g. because the
/// inspection helper is broken; callers must not treat that as bad output.
#[async_trait]
pub trait OutputInspector: Send + Sync {
    async fn inspect(&self, fname: &str) -> Result<Validity, PicoError>;
}

/// Exit code with which the inspection helper reports a file it cannot open.
/// Any other failure means the helper itself did not work.
pub const HELPER_UNREADABLE_EXIT: i32 = 4;

/// What the inspection helper prints on stdout.
#[derive(Debug, Default, Deserialize)]
struct HelperReport {
    #[serde(default)]
    keys: Vec<String>,
    /// First bin of the `cutflow` histogram.
    #[serde(default)]
    cutflow: Option<f64>,
    /// Entries of the `Events` tree.
    #[serde(default)]
    entries: Option<i64>,
}

/// Failure of one helper invocation.
#[derive(Debug)]
enum HelperError {
    /// The helper opened nothing: the file is unreadable or corrupt.
    Unreadable(String),
    /// The helper could not run (missing, timed out, crashed, garbled output).
    Unavailable(String),
}

/// Decide validity from the top-level object names and counts. An `Events`
/// tree takes precedence over the `tree` + `cutflow` layout.
pub fn classify(fname: &str, keys: &[String], cutflow: Option<f64>, entries: Option<i64>) -> Validity {
    let has = |name: &str| keys.iter().any(|k| k == name);
    if has("Events") {
        let nevents = entries.unwrap_or(0);
        if entries.is_some() && nevents <= 0 {
            tracing::warn!("'Events' tree of file {} has nevts={}<=0...", fname, nevents);
        }
        Validity::Valid(nevents)
    } else if has("tree") && has("cutflow") {
        let nevents = cutflow.map(|c| c as i64).unwrap_or(0);
        if cutflow.is_some() && nevents <= 0 {
            tracing::warn!("Cutflow of file {} has nevts={}<=0...", fname, nevents);
        }
        Validity::Valid(nevents)
    } else {
        Validity::Invalid(format!(
            "{} has neither an 'Events' tree nor 'tree' and 'cutflow'",
            fname
        ))
    }
}

/// Top-level key names of a local ROOT file. The file is memory-mapped, so
/// only the header and key list pages are read.
fn local_keys(fname: &str) -> Result<Vec<String>, String> {
    let file = std::fs::File::open(fname).map_err(|e| format!("Cannot open {}: {}", fname, e))?;
    // SAFETY: read-only mapping; job output is not rewritten while inspected.
    let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| format!("Cannot map {}: {}", fname, e))?;
    let keys = read_keys(&mmap).map_err(|e| format!("{}: {}", fname, e))?;
    Ok(keys.into_iter().map(|k| k.name).collect())
}

/// Inspector for ROOT files.
///
/// Local files are opened natively to verify the header and key list. Event
/// counts, and everything for remote `root://` files, come from an external
/// helper printing `{"keys": [...], "cutflow": x, "entries": n}` and exiting
/// with [`HELPER_UNREADABLE_EXIT`] when the file cannot be opened. With no
/// helper configured only the key list of local files is checked.
pub struct RootInspector {
    helper: Vec<String>,
    runner: Arc<dyn CommandRunner>,
}

impl RootInspector {
    pub fn new(helper: Vec<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { helper, runner }
    }

    async fn run_helper(&self, fname: &str) -> Result<HelperReport, HelperError> {
        let Some((program, rest)) = self.helper.split_first() else {
            return Err(HelperError::Unavailable("no inspection helper configured".to_string()));
        };
        let mut args = rest.to_vec();
        args.push(fname.to_string());
        let out = self
            .runner
            .run(program, &args)
            .await
            .map_err(|e| HelperError::Unavailable(e.to_string()))?;
        if out.code == HELPER_UNREADABLE_EXIT {
            return Err(HelperError::Unreadable(format!("{}: {}", fname, out.stderr.trim())));
        }
        if !out.success() {
            return Err(HelperError::Unavailable(format!(
                "'{}' failed with exit code {}: {}",
                format_command(program, &args),
                out.code,
                out.stderr.trim()
            )));
        }
        let line = out
            .stdout
            .lines()
            .rev()
            .find(|l| l.trim_start().starts_with('{'))
            .unwrap_or("");
        serde_json::from_str(line).map_err(|e| {
            HelperError::Unavailable(format!("Unexpected output of inspection helper for {}: {}", fname, e))
        })
    }

    async fn inspect_local(&self, fname: &str) -> Validity {
        let keys = match local_keys(fname) {
            Ok(keys) => keys,
            Err(reason) => return Validity::Invalid(reason),
        };
        if self.helper.is_empty() {
            tracing::debug!("No inspection helper; event count of {} not checked", fname);
            return match classify(fname, &keys, None, None) {
                Validity::Valid(_) => Validity::Valid(0),
                invalid => invalid,
            };
        }
        match self.run_helper(fname).await {
            Ok(report) => classify(fname, &keys, report.cutflow, report.entries),
            Err(HelperError::Unreadable(reason)) => Validity::Invalid(reason),
            Err(HelperError::Unavailable(reason)) => {
                // the key list already shows the file was closed properly
                tracing::warn!("Could not count events of {}: {}", fname, reason);
                match classify(fname, &keys, None, None) {
                    Validity::Valid(_) => Validity::Valid(0),
                    invalid => invalid,
                }
            }
        }
    }
}

#[async_trait]
impl OutputInspector for RootInspector {
    async fn inspect(&self, fname: &str) -> Result<Validity, PicoError> {
        let result = if fname.contains("://") {
            match self.run_helper(fname).await {
                Ok(report) => classify(fname, &report.keys, report.cutflow, report.entries),
                Err(HelperError::Unreadable(reason)) => Validity::Invalid(reason),
                Err(HelperError::Unavailable(reason)) => {
                    return Err(PicoError::Inspect(format!(
                        "Cannot inspect remote file {}: {}",
                        fname, reason
                    )))
                }
            }
        } else {
            self.inspect_local(fname).await
        };
        if let Validity::Invalid(reason) = &result {
            tracing::debug!("Invalid output {}: {}", fname, reason);
        }
        Ok(result)
    }
}

/// Inspector answering from a fixed table keyed by file name. Unknown files
/// are invalid.
#[derive(Debug, Clone, Default)]
pub struct FixedInspector {
    results: HashMap<String, Validity>,
}

impl FixedInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn valid(mut self, name: &str, nevents: i64) -> Self {
        self.results.insert(name.to_string(), Validity::Valid(nevents));
        self
    }

    pub fn corrupt(mut self, name: &str) -> Self {
        self.results
            .insert(name.to_string(), Validity::Invalid("corrupt".to_string()));
        self
    }
}

#[async_trait]
impl OutputInspector for FixedInspector {
    async fn inspect(&self, fname: &str) -> Result<Validity, PicoError> {
        let base = Path::new(fname)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(self
            .results
            .get(fname)
            .or_else(|| self.results.get(&base))
            .cloned()
            .unwrap_or_else(|| Validity::Invalid(format!("{} not found", fname))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::rootfile::testfile;
    use crate::runner::{CommandOutput, ScriptedRunner};
    use tempfile::TempDir;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classify_events_takes_precedence() {
        let v = classify("f.root", &keys(&["tree", "cutflow", "Events"]), Some(10.0), Some(42));
        assert_eq!(v, Validity::Valid(42));
    }

    #[test]
    fn test_classify_tree_and_cutflow() {
        let v = classify("f.root", &keys(&["tree", "cutflow"]), Some(500.0), None);
        assert_eq!(v, Validity::Valid(500));
        assert_eq!(v.events(), 500);
    }

    #[test]
    fn test_classify_zero_events_still_valid() {
        let v = classify("f.root", &keys(&["Events"]), None, Some(0));
        assert!(v.is_valid());
        let v = classify("f.root", &keys(&["tree", "cutflow"]), Some(-3.0), None);
        assert!(v.is_valid());
        assert_eq!(v.events(), 0);
    }

    #[test]
    fn test_classify_unknown_layout_invalid() {
        assert!(!classify("f.root", &keys(&["tree"]), None, None).is_valid());
        assert!(!classify("f.root", &keys(&["cutflow", "Runs"]), Some(1.0), None).is_valid());
    }

    fn write(tmp: &TempDir, name: &str, data: &[u8]) -> String {
        let path = tmp.path().join(name);
        std::fs::write(&path, data).expect("write");
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn test_local_file_uses_helper_counts() {
        let tmp = TempDir::new().expect("tmp");
        let fname = write(&tmp, "out_0.root", &testfile::build(&[("TTree", "tree"), ("TH1D", "cutflow")]));
        let runner = ScriptedRunner::new().respond(
            "python3",
            CommandOutput::ok("Info in <TFile>\n{\"keys\": [\"tree\", \"cutflow\"], \"cutflow\": 500.0}\n"),
        );
        let inspector = RootInspector::new(
            vec!["python3".to_string(), "inspect_output.py".to_string()],
            Arc::new(runner.clone()),
        );
        assert_eq!(inspector.inspect(&fname).await.expect("inspect"), Validity::Valid(500));
        assert_eq!(runner.calls()[0], vec!["python3", "inspect_output.py", fname.as_str()]);
    }

    #[tokio::test]
    async fn test_local_corrupt_file_skips_helper() {
        let tmp = TempDir::new().expect("tmp");
        let mut data = testfile::build(&[("TTree", "Events")]);
        data.truncate(data.len() - 8);
        let fname = write(&tmp, "out_1.root", &data);
        let runner = ScriptedRunner::new();
        let inspector = RootInspector::new(vec!["python3".to_string()], Arc::new(runner.clone()));
        assert!(!inspector.inspect(&fname).await.expect("inspect").is_valid());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_local_without_helper_checks_keys_only() {
        let tmp = TempDir::new().expect("tmp");
        let good = write(&tmp, "a_skim.root", &testfile::build(&[("TTree", "Events")]));
        let other = write(&tmp, "b_skim.root", &testfile::build(&[("TH1F", "h_pt")]));
        let inspector = RootInspector::new(Vec::new(), Arc::new(ScriptedRunner::new()));
        assert_eq!(inspector.inspect(&good).await.expect("inspect"), Validity::Valid(0));
        assert!(!inspector.inspect(&other).await.expect("inspect").is_valid());
        assert!(!inspector.inspect("/nonexistent/c_skim.root").await.expect("inspect").is_valid());
    }

    #[tokio::test]
    async fn test_remote_unreadable_file_is_invalid() {
        let runner = ScriptedRunner::new().respond(
            "python3",
            CommandOutput::failed(HELPER_UNREADABLE_EXIT, "Error in <TFile::Init>: file is truncated"),
        );
        let inspector = RootInspector::new(vec!["python3".to_string()], Arc::new(runner));
        let v = inspector
            .inspect("root://eosuser.cern.ch//eos/user/x/out_2.root")
            .await
            .expect("inspect");
        match v {
            Validity::Invalid(reason) => assert!(reason.contains("truncated")),
            other => panic!("Expected Invalid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_broken_helper_is_an_error() {
        let runner = ScriptedRunner::new()
            .respond("python3", CommandOutput::failed(1, "ModuleNotFoundError: No module named 'ROOT'"));
        let inspector = RootInspector::new(vec!["python3".to_string()], Arc::new(runner));
        let err = inspector
            .inspect("root://eosuser.cern.ch//eos/user/x/out_2.root")
            .await
            .unwrap_err();
        assert!(matches!(err, PicoError::Inspect(_)));
        assert!(err.to_string().contains("No module named 'ROOT'"));
    }

    #[tokio::test]
    async fn test_local_file_survives_broken_helper() {
        let tmp = TempDir::new().expect("tmp");
        let fname = write(&tmp, "out_0.root", &testfile::build(&[("TTree", "tree"), ("TH1D", "cutflow")]));
        let runner = ScriptedRunner::new()
            .respond("python3", CommandOutput::failed(1, "ModuleNotFoundError: No module named 'ROOT'"));
        let inspector = RootInspector::new(vec!["python3".to_string()], Arc::new(runner.clone()));
        assert_eq!(inspector.inspect(&fname).await.expect("inspect"), Validity::Valid(0));

        let runner = ScriptedRunner::new().fail("python3", "command timed out after 600s");
        let inspector = RootInspector::new(vec!["python3".to_string()], Arc::new(runner));
        assert_eq!(inspector.inspect(&fname).await.expect("inspect"), Validity::Valid(0));
    }

    #[tokio::test]
    async fn test_local_file_unreadable_by_helper_is_invalid() {
        let tmp = TempDir::new().expect("tmp");
        let fname = write(&tmp, "out_1.root", &testfile::build(&[("TTree", "Events")]));
        let runner = ScriptedRunner::new()
            .respond("python3", CommandOutput::failed(HELPER_UNREADABLE_EXIT, "Could not open out_1.root"));
        let inspector = RootInspector::new(vec!["python3".to_string()], Arc::new(runner));
        assert!(!inspector.inspect(&fname).await.expect("inspect").is_valid());
    }

    #[tokio::test]
    async fn test_fixed_inspector_by_basename() {
        let inspector = FixedInspector::new().valid("out_0.root", 500).corrupt("out_1.root");
        assert_eq!(inspector.inspect("/data/out_0.root").await.expect("inspect"), Validity::Valid(500));
        assert!(!inspector.inspect("/data/out_1.root").await.expect("inspect").is_valid());
        assert!(!inspector.inspect("/data/out_2.root").await.expect("inspect").is_valid());
    }
}
