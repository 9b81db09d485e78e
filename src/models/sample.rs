use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::PicoError;
use crate::models::jobconfig::JobConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Mc,
    Data,
    Embed,
}

impl DataType {
    pub const ALL: [DataType; 3] = [DataType::Mc, DataType::Data, DataType::Embed];

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Mc => "mc",
            DataType::Data => "data",
            DataType::Embed => "embed",
        }
    }

    /// Guess the data type from a DAS dataset path.
    pub fn guess(path: &str) -> DataType {
        if path.contains("Embed") {
            DataType::Embed
        } else if path.ends_with("SIM") || path.contains("pythia") || path.contains("madgraph") {
            DataType::Mc
        } else if Regex::new(r"/Run20\d\d")
            .map(|re| re.is_match(path))
            .unwrap_or(false)
        {
            DataType::Data
        } else {
            DataType::Mc
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = PicoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mc" => Ok(DataType::Mc),
            "data" => Ok(DataType::Data),
            "embed" => Ok(DataType::Embed),
            other => Err(PicoError::Validation(format!(
                "Given data type '{}' is not recognized! Please choose from mc, data, embed...",
                other
            ))),
        }
    }
}

/// Either an explicit list of files or a text file listing them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FileSource {
    List(Vec<String>),
    ListFile(String),
}

impl Default for FileSource {
    fn default() -> Self {
        FileSource::List(Vec::new())
    }
}

/// Extra module options, given either as a list or a comma-separated string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
enum ExtraOpts {
    List(Vec<String>),
    Joined(String),
}

fn deserialize_opts<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opts = Option::<ExtraOpts>::deserialize(deserializer)?;
    Ok(match opts {
        None => Vec::new(),
        Some(ExtraOpts::List(list)) => list,
        Some(ExtraOpts::Joined(s)) => s
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect(),
    })
}

/// A logical dataset, as listed in an era's sample list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub group: String,
    pub name: String,
    pub paths: Vec<String>,
    #[serde(default)]
    pub dtype: Option<DataType>,
    #[serde(default, alias = "channel")]
    pub channels: Option<Vec<String>>,
    /// Storage system path, if the files are not read from DAS.
    #[serde(default, alias = "store")]
    pub storage: Option<String>,
    /// Redirector prepended to file names.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub instance: Option<String>,
    /// Files per job; values <= 0 fall back to the global setting.
    #[serde(default = "default_nfilesperjob")]
    pub nfilesperjob: i64,
    #[serde(default, alias = "opts", deserialize_with = "deserialize_opts")]
    pub extraopts: Vec<String>,
    #[serde(default)]
    pub files: FileSource,
    /// Postfix before ".root" of files in the storage system.
    #[serde(default)]
    pub postfix: String,
    #[serde(default)]
    pub era: String,
    #[serde(default)]
    pub nevents: u64,

    /// Try count of the loaded job configuration.
    #[serde(skip)]
    pub subtry: u32,
    #[serde(skip)]
    pub jobcfg: Option<JobConfig>,
    /// File list may be refreshed in `getfiles` only when none was given.
    #[serde(skip)]
    pub refreshable: bool,
}

fn default_nfilesperjob() -> i64 {
    -1
}

impl Sample {
    pub fn new(group: &str, name: &str, paths: Vec<String>) -> Result<Self, PicoError> {
        let mut sample = Sample {
            group: group.to_string(),
            name: name.to_string(),
            paths,
            dtype: None,
            channels: None,
            storage: None,
            url: None,
            blacklist: Vec::new(),
            instance: None,
            nfilesperjob: default_nfilesperjob(),
            extraopts: Vec::new(),
            files: FileSource::default(),
            postfix: String::new(),
            era: String::new(),
            nevents: 0,
            subtry: 0,
            jobcfg: None,
            refreshable: true,
        };
        sample.validate()?;
        Ok(sample)
    }

    /// Check dataset paths, fill in the data type and the DAS instance.
    pub fn validate(&mut self) -> Result<(), PicoError> {
        if self.paths.is_empty() {
            return Err(PicoError::Validation(format!(
                "Need at least one path to create sample '{}'...",
                self.name
            )));
        }
        for path in &self.paths {
            if !path.starts_with('/') || path.matches('/').count() < 3 {
                return Err(PicoError::Validation(format!(
                    "DAS path {:?} has wrong format. Need /SAMPLE/CAMPAIGN/FORMAT.",
                    path
                )));
            }
        }
        if self.dtype.is_none() {
            self.dtype = Some(DataType::guess(&self.paths[0]));
        }
        if self.instance.is_none() {
            self.instance = Some(default_instance(&self.paths).to_string());
        }
        self.refreshable = match &self.files {
            FileSource::List(list) => list.is_empty(),
            FileSource::ListFile(_) => false,
        };
        Ok(())
    }

    pub fn dtype(&self) -> DataType {
        self.dtype.unwrap_or(DataType::Mc)
    }

    pub fn instance(&self) -> &str {
        self.instance.as_deref().unwrap_or("prod/global")
    }

    pub fn url(&self) -> &str {
        self.url.as_deref().unwrap_or("root://cms-xrd-global.cern.ch/")
    }

    /// Whether this sample should run for the given channel.
    pub fn has_channel(&self, channel: &str) -> bool {
        match &self.channels {
            Some(channels) if !channels.is_empty() => channels.iter().any(|c| c == channel),
            _ => true,
        }
    }

    /// Match the sample name against glob patterns (`*`, `?`, `[...]`, matched
    /// as `pattern*`) or plain name prefixes.
    pub fn matches(&self, patterns: &[String]) -> bool {
        let name = self.name.trim_matches('/');
        patterns.iter().any(|pattern| {
            let is_glob = pattern.contains('*')
                || pattern.contains('?')
                || (pattern.contains('[') && pattern.contains(']'));
            if is_glob {
                glob_match(&format!("{}*", pattern), name)
            } else {
                name.starts_with(pattern.as_str())
            }
        })
    }

    /// Split a sample with several dataset paths into one sample per path.
    pub fn split(&self) -> Vec<Sample> {
        self.paths
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let mut sample = self.clone();
                if i > 1 {
                    sample.name = format!("{}_ext{}", self.name, i);
                }
                sample.paths = vec![path.clone()];
                sample
            })
            .collect()
    }

    /// Rebuild a sample from the job configuration of its last submission.
    pub fn from_jobconfig(jobcfg: JobConfig) -> Result<Self, PicoError> {
        let mut sample = Sample::new(&jobcfg.group, &jobcfg.name, jobcfg.paths.clone())?;
        sample.dtype = Some(jobcfg.dtype);
        sample.channels = Some(vec![jobcfg.channel.clone()]);
        sample.subtry = jobcfg.subtry;
        sample.nfilesperjob = jobcfg.nfilesperjob as i64;
        sample.nevents = jobcfg.nevents;
        sample.extraopts = jobcfg.extraopts.clone();
        sample.jobcfg = Some(jobcfg);
        Ok(sample)
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// DAS instance of user-produced datasets differs from official ones.
pub fn default_instance(paths: &[String]) -> &'static str {
    match paths.last() {
        Some(path) if path.ends_with("USER") => "prod/phys03",
        _ => "prod/global",
    }
}

/// Compile a shell-style wildcard pattern supporting `*`, `?` and `[...]`
/// classes. Returns `None` if the class syntax yields an invalid regex.
pub fn glob_regex(pattern: &str) -> Option<Regex> {
    let mut regex = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == ']' {
                        closed = true;
                        break;
                    }
                    class.push(next);
                }
                if closed {
                    regex.push('[');
                    if let Some(rest) = class.strip_prefix('!') {
                        regex.push('^');
                        regex.push_str(&rest.replace('\\', "\\\\"));
                    } else {
                        regex.push_str(&class.replace('\\', "\\\\"));
                    }
                    regex.push(']');
                } else {
                    regex.push_str(&regex::escape(&format!("[{}", class)));
                }
            }
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex).ok()
}

/// One-off wildcard match. Compile with [`glob_regex`] when matching many names.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    glob_regex(pattern).map(|re| re.is_match(text)).unwrap_or(false)
}
