use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::PicoError;
use crate::models::batch::BatchKind;

/// Variables that hold dictionaries and can only be changed per key.
pub const DICT_VARIABLES: [&str; 2] = ["channels", "eras"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PicoConfig {
    /// Channel name -> analysis module, or processor script plus options for skims.
    #[serde(default = "default_channels")]
    pub channels: BTreeMap<String, String>,
    /// Era -> sample list (relative to `samples/`).
    #[serde(default = "default_eras")]
    pub eras: BTreeMap<String, String>,
    /// Job configuration and log files.
    #[serde(default = "default_jobdir")]
    pub jobdir: String,
    /// Analysis job output.
    #[serde(default = "default_outdir")]
    pub outdir: String,
    /// Skim job output.
    #[serde(default = "default_nanodir")]
    pub nanodir: String,
    /// Final hadd'ed analysis output.
    #[serde(default = "default_picodir")]
    pub picodir: String,
    #[serde(default = "default_filelistdir")]
    pub filelistdir: String,
    #[serde(default = "default_batch")]
    pub batch: BatchKind,
    #[serde(default = "default_nfilesperjob")]
    pub nfilesperjob: usize,
    /// Timeout applied to every external command; 0 disables it.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Helper printing the event count of a job output file as JSON.
    #[serde(default = "default_inspect_cmd")]
    pub inspect_cmd: Vec<String>,
    /// User-defined variables set with `pico set`.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_channels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("skim".to_string(), "skimjob.py".to_string()),
        ("mutau".to_string(), "ModuleMuTauSimple".to_string()),
    ])
}

fn default_eras() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("2016".to_string(), "samples_2016.json".to_string()),
        ("2017".to_string(), "samples_2017.json".to_string()),
        ("2018".to_string(), "samples_2018.json".to_string()),
    ])
}

fn default_jobdir() -> String {
    "output/$ERA/$CHANNEL/$SAMPLE".to_string()
}

fn default_outdir() -> String {
    "output/$ERA/$CHANNEL/$SAMPLE".to_string()
}

fn default_nanodir() -> String {
    "output/nano/$ERA/$DAS".to_string()
}

fn default_picodir() -> String {
    "analysis/$ERA/$GROUP".to_string()
}

fn default_filelistdir() -> String {
    "samples/files/$ERA/$SAMPLE.txt".to_string()
}

fn default_batch() -> BatchKind {
    BatchKind::HTCondor
}

fn default_nfilesperjob() -> usize {
    1
}

fn default_command_timeout_secs() -> u64 {
    600
}

fn default_inspect_cmd() -> Vec<String> {
    vec![
        "python3".to_string(),
        "python/tools/inspect_output.py".to_string(),
    ]
}

impl Default for PicoConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            eras: default_eras(),
            jobdir: default_jobdir(),
            outdir: default_outdir(),
            nanodir: default_nanodir(),
            picodir: default_picodir(),
            filelistdir: default_filelistdir(),
            batch: default_batch(),
            nfilesperjob: default_nfilesperjob(),
            command_timeout_secs: default_command_timeout_secs(),
            inspect_cmd: default_inspect_cmd(),
            extra: BTreeMap::new(),
        }
    }
}

impl PicoConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: PicoConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Atomically write the configuration: write a .tmp file, then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&tmp_path, json.as_bytes())
            .context("Failed to write temporary config file")?;
        std::fs::rename(&tmp_path, path).context("Failed to rename temporary config file")?;
        Ok(())
    }

    /// Channel names are considered skims when they contain "skim".
    pub fn is_skim(channel: &str) -> bool {
        channel.to_lowercase().contains("skim")
    }

    pub fn module(&self, channel: &str) -> Result<&str, PicoError> {
        self.channels.get(channel).map(|s| s.as_str()).ok_or_else(|| {
            PicoError::Config(format!(
                "Channel '{}' not found in the configuration file. Available: {}",
                channel,
                self.channels.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    pub fn samplelist(&self, era: &str) -> Result<&str, PicoError> {
        self.eras.get(era).map(|s| s.as_str()).ok_or_else(|| {
            PicoError::Config(format!(
                "Era '{}' not found in the configuration file. Available: {}",
                era,
                self.eras.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    fn to_map(&self) -> Result<serde_json::Map<String, Value>, PicoError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(PicoError::Config(
                "Configuration did not serialize to an object".to_string(),
            )),
        }
    }

    fn from_map(map: serde_json::Map<String, Value>) -> Result<Self, PicoError> {
        serde_json::from_value(Value::Object(map))
            .map_err(|e| PicoError::Validation(format!("Invalid configuration value: {}", e)))
    }

    /// Look up any variable, typed or user-defined.
    pub fn get(&self, variable: &str) -> Result<Option<Value>, PicoError> {
        Ok(self.to_map()?.get(variable).cloned())
    }

    /// Set a scalar variable from its command-line string form. Numbers and
    /// lists keep their type; everything else is stored as a string.
    pub fn set(&mut self, variable: &str, value: &str) -> Result<(), PicoError> {
        if DICT_VARIABLES.contains(&variable) || variable == "channel" || variable == "era" {
            return Err(PicoError::Validation(format!(
                "Variable '{}' is reserved for dictionaries!",
                variable
            )));
        }
        let mut map = self.to_map()?;
        let parsed = match map.get(variable) {
            Some(Value::Number(_)) => {
                let number: u64 = value.trim().parse().map_err(|_| {
                    PicoError::Validation(format!(
                        "Variable '{}' requires a non-negative integer, got '{}'",
                        variable, value
                    ))
                })?;
                Value::from(number)
            }
            Some(Value::Array(_)) => Value::Array(
                value
                    .split_whitespace()
                    .map(|s| Value::String(s.to_string()))
                    .collect(),
            ),
            _ => Value::String(value.to_string()),
        };
        map.insert(variable.to_string(), parsed);
        *self = Self::from_map(map)?;
        Ok(())
    }

    /// Remove a variable. Typed variables fall back to their default.
    /// Returns false when the variable was not present.
    pub fn remove(&mut self, variable: &str) -> Result<bool, PicoError> {
        let mut map = self.to_map()?;
        if map.remove(variable).is_none() {
            return Ok(false);
        }
        *self = Self::from_map(map)?;
        Ok(true)
    }

    fn dict_mut(&mut self, varkey: &str) -> Result<&mut BTreeMap<String, String>, PicoError> {
        match varkey {
            "channels" => Ok(&mut self.channels),
            "eras" => Ok(&mut self.eras),
            other => Err(PicoError::Validation(format!(
                "'{}' is not a dictionary variable",
                other
            ))),
        }
    }

    /// Link a channel to a module, or an era to a sample list.
    pub fn link(&mut self, varkey: &str, key: &str, value: &str) -> Result<(), PicoError> {
        if let Some(c) = key.chars().find(|c| "/\\,:;!?'\"".contains(*c)) {
            return Err(PicoError::Validation(format!(
                "Given key '{}', but keys cannot contain any of these characters: {}",
                key, c
            )));
        }
        self.dict_mut(varkey)?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn unlink(&mut self, varkey: &str, key: &str) -> Result<bool, PicoError> {
        Ok(self.dict_mut(varkey)?.remove(key).is_some())
    }
}

/// Replace `$KEY` placeholders, e.g. `$ERA` or `$SAMPLE`, in a path template.
pub fn repkey(template: &str, keys: &[(&str, &str)]) -> String {
    let mut result = template.to_string();
    for (key, value) in keys {
        result = result.replace(&format!("${}", key), value);
    }
    result
}
