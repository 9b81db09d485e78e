//! Sample lists and input file discovery.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::das::Das;
use crate::errors::PicoError;
use crate::models::config::repkey;
use crate::models::{DataType, FileSource, PicoConfig, Sample};
use crate::runner::CommandRunner;
use crate::storage::{getstorage, with_url, JobConfigStore};

/// Name patterns, vetoes and data types selecting samples.
#[derive(Debug, Clone, Default)]
pub struct SampleQuery {
    pub filters: Vec<String>,
    pub vetoes: Vec<String>,
    pub dtypes: Vec<DataType>,
}

impl SampleQuery {
    pub fn accepts(&self, sample: &Sample) -> bool {
        if !self.filters.is_empty() && !sample.matches(&self.filters) {
            return false;
        }
        if !self.vetoes.is_empty() && sample.matches(&self.vetoes) {
            return false;
        }
        self.dtypes.is_empty() || self.dtypes.contains(&sample.dtype())
    }
}

/// Settings shared by every sample of a list unless a sample overrides them.
#[derive(Debug, Default, Deserialize)]
struct SampleDefaults {
    #[serde(default, alias = "store")]
    storage: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    nfilesperjob: Option<i64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SampleListFile {
    Plain(Vec<Sample>),
    WithDefaults {
        #[serde(flatten)]
        defaults: SampleDefaults,
        samples: Vec<Sample>,
    },
}

/// Read a sample list: a JSON array of samples, or an object with a
/// `samples` array next to defaults for `storage`, `url` and `nfilesperjob`.
pub fn load_samplelist(path: &Path) -> Result<Vec<Sample>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read sample list {}", path.display()))?;
    let parsed: SampleListFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse sample list {}", path.display()))?;
    let samples = match parsed {
        SampleListFile::Plain(samples) => samples,
        SampleListFile::WithDefaults { defaults, mut samples } => {
            for sample in &mut samples {
                if sample.storage.is_none() {
                    sample.storage = defaults.storage.clone();
                }
                if sample.url.is_none() {
                    sample.url = defaults.url.clone();
                }
                if sample.nfilesperjob <= 0 {
                    if let Some(n) = defaults.nfilesperjob {
                        sample.nfilesperjob = n;
                    }
                }
            }
            samples
        }
    };
    Ok(samples)
}

/// Location of an era's sample list below `samples/`.
pub fn samplelist_path(config: &PicoConfig, era: &str, channel: &str, tag: &str) -> Result<PathBuf, PicoError> {
    let name = repkey(
        config.samplelist(era)?,
        &[("ERA", era), ("CHANNEL", channel), ("TAG", tag)],
    );
    Ok(Path::new("samples").join(name))
}

/// Samples of an era that pass the query and run for the channel. Skim
/// channels get one sample per dataset path.
pub fn getsamples(
    config: &PicoConfig,
    era: &str,
    channel: &str,
    tag: &str,
    query: &SampleQuery,
) -> Result<Vec<Sample>> {
    let path = samplelist_path(config, era, channel, tag)?;
    let mut seen = BTreeSet::new();
    let mut samples = Vec::new();
    for mut sample in load_samplelist(&path)? {
        sample
            .validate()
            .with_context(|| format!("Invalid sample '{}' in {}", sample.name, path.display()))?;
        if !query.accepts(&sample) {
            continue;
        }
        if !channel.is_empty() && !sample.has_channel(channel) {
            continue;
        }
        if !seen.insert(sample.name.clone()) {
            bail!(PicoError::Validation(format!(
                "Sample short names should be unique. Found two samples '{}' in {}!",
                sample.name,
                path.display()
            )));
        }
        sample.era = era.to_string();
        let keys = [
            ("ERA", era),
            ("GROUP", sample.group.as_str()),
            ("SAMPLE", sample.name.as_str()),
        ];
        let storage = sample.storage.as_ref().map(|s| repkey(s, &keys));
        let files = match &sample.files {
            FileSource::ListFile(listfile) => FileSource::ListFile(repkey(listfile, &keys)),
            list => list.clone(),
        };
        sample.storage = storage;
        sample.files = files;
        if PicoConfig::is_skim(channel) && sample.paths.len() >= 2 {
            samples.extend(sample.split());
        } else {
            samples.push(sample);
        }
    }
    tracing::debug!("Found {} samples in {}", samples.len(), path.display());
    Ok(samples)
}

/// Samples rebuilt from the latest job configuration of each sample.
pub fn getcfgsamples(
    config: &PicoConfig,
    era: &str,
    channel: &str,
    tag: &str,
    query: &SampleQuery,
) -> Result<Vec<Sample>> {
    let store = JobConfigStore::new(&config.jobdir, era, channel, tag);
    tracing::debug!("Looking for job configurations {}", store.pattern());
    let mut samples = Vec::new();
    for jobcfg in store.latest()? {
        let sample = Sample::from_jobconfig(jobcfg)?;
        if query.accepts(&sample) {
            samples.push(sample);
        }
    }
    Ok(samples)
}

/// Resolves sample file lists and event counts through storage listings and DAS.
pub struct Discovery {
    runner: Arc<dyn CommandRunner>,
    das: Das,
}

impl Discovery {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            das: Das::new(runner.clone()),
            runner,
        }
    }

    pub fn das(&self) -> &Das {
        &self.das
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    /// Input files of a sample, sorted. The list is cached in the sample and
    /// only looked up again on `refresh` when it was not given explicitly.
    pub async fn getfiles(&self, sample: &mut Sample, refresh: bool, url: bool) -> Result<Vec<String>, PicoError> {
        let cached = match &sample.files {
            FileSource::List(files) => files.clone(),
            FileSource::ListFile(listfile) => {
                let files = read_filelist(Path::new(listfile), sample, url)?;
                sample.files = FileSource::List(files.clone());
                files
            }
        };
        if !sample.refreshable || (!cached.is_empty() && !refresh) {
            return Ok(cached);
        }

        let mut files = Vec::new();
        for path in &sample.paths {
            let lines = match &sample.storage {
                Some(storage) => {
                    let sepath = repkey(storage, &[("PATH", path)]).replace("//", "/");
                    let storage = getstorage(&sepath, self.runner.clone());
                    let filter = format!("*{}.root", sample.postfix);
                    let listed = storage.getfiles(&filter, url).await?;
                    match (&sample.url, url) {
                        (Some(explicit), true) => listed
                            .iter()
                            .map(|f| with_url(Some(explicit.as_str()), f))
                            .collect(),
                        _ => listed,
                    }
                }
                None => {
                    let listed = self.das.files(path, sample.instance()).await?;
                    listed
                        .into_iter()
                        .map(|f| if url { with_url(Some(sample.url()), &f) } else { f })
                        .collect()
                }
            };
            let suffix = format!("{}.root", sample.postfix);
            files.extend(
                lines
                    .into_iter()
                    .filter(|f| f.ends_with(&suffix) && !blacklisted(sample, f)),
            );
        }
        files.sort();
        sample.files = FileSource::List(files.clone());
        Ok(files)
    }

    /// Expected number of events from DAS, cached in the sample.
    pub async fn getnevents(&self, sample: &mut Sample, refresh: bool) -> Result<u64, PicoError> {
        if sample.nevents == 0 || refresh {
            sample.nevents = self
                .das
                .total_nevents(&sample.paths, sample.instance())
                .await?;
        }
        Ok(sample.nevents)
    }
}

fn blacklisted(sample: &Sample, file: &str) -> bool {
    sample
        .blacklist
        .iter()
        .any(|b| b.ends_with(file) || file.ends_with(b.as_str()))
}

/// Read a text file with one input file per line; `#` starts a comment.
fn read_filelist(path: &Path, sample: &Sample, url: bool) -> Result<Vec<String>, PicoError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PicoError::NotFound(format!(
            "File list {} of sample '{}' ({})",
            path.display(),
            sample.name,
            e
        ))
    })?;
    let mut files: Vec<String> = content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| line.ends_with(".root"))
        .filter(|line| !blacklisted(sample, line))
        .map(|line| {
            if url && line.starts_with("/store/") {
                with_url(Some(sample.url()), line)
            } else {
                line.to_string()
            }
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Write a sample's file list for later use as a `files` list file.
pub fn write_filelist(template: &str, era: &str, sample: &Sample, tag: &str, files: &[String]) -> Result<PathBuf> {
    let path = PathBuf::from(repkey(
        template,
        &[
            ("ERA", era),
            ("GROUP", sample.group.as_str()),
            ("SAMPLE", sample.name.as_str()),
            ("TAG", tag),
        ],
    ));
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
    }
    let mut content = files.join("\n");
    content.push('\n');
    std::fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!("Wrote file list {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, ScriptedRunner};
    use tempfile::TempDir;

    const DY: &str = "/DYJetsToLL_M-50/RunIIAutumn18NanoAODv6/NANOAODSIM";
    const TT: &str = "/TTTo2L2Nu/RunIIAutumn18NanoAODv6/NANOAODSIM";
    const MU: &str = "/SingleMuon/Run2018A-Nano25Oct2019-v1/NANOAOD";

    fn write_list(tmp: &TempDir, json: &str) -> PicoConfig {
        let dir = tmp.path().join("samples");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("samples_2018.json"), json).expect("write");
        let mut config = PicoConfig::default();
        config.eras.insert(
            "2018".to_string(),
            tmp.path().join("samples/samples_2018.json").to_string_lossy().to_string(),
        );
        config
    }

    fn sample_list() -> String {
        serde_json::json!([
            {"group": "DY", "name": "DYJets", "paths": [DY]},
            {"group": "TT", "name": "TTTo2L2Nu", "paths": [TT, TT.replace("v6", "v7"), TT.replace("v6", "v8")]},
            {"group": "Data", "name": "SingleMuon_Run2018A", "paths": [MU], "channels": ["mutau"]},
        ])
        .to_string()
    }

    #[test]
    fn test_getsamples_filters() {
        let tmp = TempDir::new().expect("tmp");
        let config = write_list(&tmp, &sample_list());
        let all = getsamples(&config, "2018", "mutau", "", &SampleQuery::default()).expect("samples");
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].era, "2018");

        let etau = getsamples(&config, "2018", "etau", "", &SampleQuery::default()).expect("samples");
        assert_eq!(etau.len(), 2);

        let query = SampleQuery {
            dtypes: vec![DataType::Data],
            ..Default::default()
        };
        let data = getsamples(&config, "2018", "mutau", "", &query).expect("samples");
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].name, "SingleMuon_Run2018A");

        let query = SampleQuery {
            filters: vec!["*Jets".to_string(), "TT".to_string()],
            vetoes: vec!["TT".to_string()],
            ..Default::default()
        };
        let some = getsamples(&config, "2018", "mutau", "", &query).expect("samples");
        assert_eq!(some.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["DYJets"]);
    }

    #[test]
    fn test_getsamples_splits_for_skims() {
        let tmp = TempDir::new().expect("tmp");
        let config = write_list(&tmp, &sample_list());
        let query = SampleQuery {
            filters: vec!["TT".to_string()],
            ..Default::default()
        };
        let samples = getsamples(&config, "2018", "skim", "", &query).expect("samples");
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[2].name, "TTTo2L2Nu_ext2");
    }

    #[test]
    fn test_getsamples_duplicate_names() {
        let tmp = TempDir::new().expect("tmp");
        let json = serde_json::json!([
            {"group": "DY", "name": "DYJets", "paths": [DY]},
            {"group": "DY", "name": "DYJets", "paths": [DY.replace("v6", "v7")]},
        ]);
        let config = write_list(&tmp, &json.to_string());
        let err = getsamples(&config, "2018", "mutau", "", &SampleQuery::default()).expect_err("duplicate");
        assert!(err.to_string().contains("unique"));
    }

    #[test]
    fn test_samplelist_defaults_and_keys() {
        let tmp = TempDir::new().expect("tmp");
        let json = serde_json::json!({
            "storage": "/eos/user/i/ineuteli/nano/$ERA/$SAMPLE",
            "nfilesperjob": 5,
            "samples": [
                {"group": "DY", "name": "DYJets", "paths": [DY]},
                {"group": "TT", "name": "TT", "paths": [TT], "files": "samples/files/$ERA/$SAMPLE.txt", "nfilesperjob": 2},
            ]
        });
        let config = write_list(&tmp, &json.to_string());
        let samples = getsamples(&config, "2018", "mutau", "", &SampleQuery::default()).expect("samples");
        assert_eq!(samples[0].storage.as_deref(), Some("/eos/user/i/ineuteli/nano/2018/DYJets"));
        assert_eq!(samples[0].nfilesperjob, 5);
        assert_eq!(samples[1].nfilesperjob, 2);
        assert_eq!(samples[1].files, FileSource::ListFile("samples/files/2018/TT.txt".to_string()));
    }

    #[test]
    fn test_missing_era() {
        let config = PicoConfig::default();
        assert!(getsamples(&config, "2030", "mutau", "", &SampleQuery::default()).is_err());
    }

    #[tokio::test]
    async fn test_getfiles_from_das() {
        let runner = ScriptedRunner::new().respond(
            "dasgoclient",
            CommandOutput::ok("/store/mc/DY/nano_2.root\n/store/mc/DY/nano_1.root\n/store/mc/DY/bad.root\nlog\n"),
        );
        let discovery = Discovery::new(Arc::new(runner.clone()));
        let mut sample = Sample::new("DY", "DYJets", vec![DY.to_string()]).expect("sample");
        sample.blacklist = vec!["bad.root".to_string()];

        let files = discovery.getfiles(&mut sample, false, true).await.expect("files");
        assert_eq!(
            files,
            vec![
                "root://cms-xrd-global.cern.ch//store/mc/DY/nano_1.root",
                "root://cms-xrd-global.cern.ch//store/mc/DY/nano_2.root",
            ]
        );
        // cached
        discovery.getfiles(&mut sample, false, true).await.expect("files");
        assert_eq!(runner.calls_to("dasgoclient").len(), 1);
        assert!(runner.calls()[0][1].contains("instance=prod/global"));
    }

    #[tokio::test]
    async fn test_getfiles_from_storage() {
        let tmp = TempDir::new().expect("tmp");
        let dir = tmp.path().join("DYJets");
        std::fs::create_dir_all(&dir).expect("mkdir");
        for name in ["b_skimjec.root", "a_skimjec.root", "c.root"] {
            std::fs::write(dir.join(name), b"").expect("write");
        }
        let discovery = Discovery::new(Arc::new(ScriptedRunner::new()));
        let mut sample = Sample::new("DY", "DYJets", vec![DY.to_string()]).expect("sample");
        sample.storage = Some(dir.to_string_lossy().to_string());
        sample.postfix = "_skimjec".to_string();
        let files = discovery.getfiles(&mut sample, false, false).await.expect("files");
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a_skimjec.root"));
    }

    #[tokio::test]
    async fn test_getfiles_from_list_file() {
        let tmp = TempDir::new().expect("tmp");
        let listfile = tmp.path().join("DYJets.txt");
        std::fs::write(&listfile, "# DY files\n/store/b.root\n/store/a.root # first\n\nnotes.txt\n")
            .expect("write");
        let discovery = Discovery::new(Arc::new(ScriptedRunner::new()));
        let mut sample = Sample::new("DY", "DYJets", vec![DY.to_string()]).expect("sample");
        sample.files = FileSource::ListFile(listfile.to_string_lossy().to_string());
        sample.validate().expect("validate");
        let files = discovery.getfiles(&mut sample, true, false).await.expect("files");
        assert_eq!(files, vec!["/store/a.root", "/store/b.root"]);
    }

    #[tokio::test]
    async fn test_getnevents_sums_paths() {
        let runner = ScriptedRunner::new()
            .respond_when("dasgoclient", "v7", CommandOutput::ok("[{\"nevents\": 250}]"))
            .respond("dasgoclient", CommandOutput::ok("[{\"nevents\": 1000, \"nfiles\": 4}]"));
        let discovery = Discovery::new(Arc::new(runner.clone()));
        let mut sample = Sample::new("DY", "DYJets", vec![DY.to_string(), DY.replace("v6", "v7")]).expect("sample");
        assert_eq!(discovery.getnevents(&mut sample, false).await.expect("nevents"), 1250);
        assert_eq!(discovery.getnevents(&mut sample, false).await.expect("nevents"), 1250);
        assert_eq!(runner.calls_to("dasgoclient").len(), 2);
    }

    #[test]
    fn test_write_filelist() {
        let tmp = TempDir::new().expect("tmp");
        let sample = Sample::new("DY", "DYJets", vec![DY.to_string()]).expect("sample");
        let template = format!("{}/files/$ERA/$SAMPLE$TAG.txt", tmp.path().display());
        let path = write_filelist(&template, "2018", &sample, "_v2", &["/store/a.root".to_string()])
            .expect("write");
        assert!(path.ends_with("files/2018/DYJets_v2.txt"));
        assert_eq!(std::fs::read_to_string(path).expect("read"), "/store/a.root\n");
    }
}
