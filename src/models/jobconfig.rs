use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::PicoError;
use crate::models::sample::DataType;

/// Chunk index -> ordered list of input files.
pub type ChunkMap = BTreeMap<usize, Vec<String>>;

/// Persisted record of one submission attempt of a sample for a channel and tag.
///
/// Written when jobs are (re)submitted and read back by `status`, `resubmit`
/// and `hadd`. The chunk map is the durable source of truth between runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    pub time: String,
    pub group: String,
    pub name: String,
    pub paths: Vec<String>,
    #[serde(default)]
    pub nevents: u64,
    pub dtype: DataType,
    pub channel: String,
    #[serde(default)]
    pub module: String,
    pub extraopts: Vec<String>,
    #[serde(default)]
    pub jobname: String,
    #[serde(default)]
    pub jobtag: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub postfix: String,
    #[serde(rename = "try")]
    pub subtry: u32,
    #[serde(default)]
    pub jobids: Vec<u64>,
    #[serde(default)]
    pub outdir: String,
    #[serde(default)]
    pub jobdir: String,
    #[serde(default)]
    pub cfgdir: String,
    #[serde(default)]
    pub logdir: String,
    #[serde(default)]
    pub cfgname: String,
    #[serde(default)]
    pub joblist: String,
    #[serde(default)]
    pub nfiles: usize,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub nfilesperjob: usize,
    #[serde(default)]
    pub nchunks: usize,
    #[serde(default)]
    pub chunks: Vec<usize>,
    pub chunkdict: ChunkMap,
    /// Job id -> argument list the job was submitted with.
    #[serde(default)]
    pub jobarglists: BTreeMap<u64, String>,

    /// File this record was loaded from.
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl JobConfig {
    pub fn load(path: &Path) -> Result<Self, PicoError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PicoError::NotFound(format!("Job config {} ({})", path.display(), e))
        })?;
        let mut jobcfg: JobConfig = serde_json::from_str(&content).map_err(|e| {
            PicoError::Validation(format!(
                "Job config {} is not a valid job configuration: {}",
                path.display(),
                e
            ))
        })?;
        jobcfg.path = Some(path.to_path_buf());
        Ok(jobcfg)
    }

    /// Atomically write the record to `cfgname`: write a .tmp file, then rename.
    pub fn save(&self) -> Result<PathBuf, PicoError> {
        let path = PathBuf::from(&self.cfgname);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp_path, json.as_bytes())?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(path)
    }

    /// Current timestamp in the format stored in `time`.
    pub fn timestamp() -> String {
        chrono::Local::now()
            .format("%Y-%m-%d %H:%M:%S%.6f")
            .to_string()
    }

    /// Argument list a job was submitted with, falling back to the current one.
    pub fn joblist_for(&self, job_id: u64) -> &str {
        self.jobarglists
            .get(&job_id)
            .map(String::as_str)
            .unwrap_or(&self.joblist)
    }

    /// Record a submitted job and the argument list it runs over.
    pub fn add_job(&mut self, job_id: u64) {
        if !self.jobids.contains(&job_id) {
            self.jobids.push(job_id);
        }
        self.jobarglists.insert(job_id, self.joblist.clone());
    }
}
