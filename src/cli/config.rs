// CLI configuration commands: list, get, set, rm, channel, era

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

use crate::color::bold;
use crate::models::PicoConfig;
use crate::samples::{getsamples, write_filelist, Discovery, SampleQuery};

/// Locate the configuration file. Resolution order:
///   1. --config CLI flag
///   2. PICO_CONFIG_DIR environment variable
///   3. <basedir>/config/config.json
///   4. Platform config dir (dirs::config_dir()/pico-producer/config.json)
///
/// When none exists the base directory location is returned, so that `set`
/// creates the file there.
pub fn resolve_config_path(config_path: Option<&Path>, basedir: &Path) -> PathBuf {
    if let Some(path) = config_path {
        return path.to_path_buf();
    }
    if let Ok(config_dir) = std::env::var("PICO_CONFIG_DIR") {
        let path = PathBuf::from(config_dir).join("config.json");
        if path.exists() {
            return path;
        }
    }
    let local = basedir.join("config").join("config.json");
    if local.exists() {
        return local;
    }
    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join("pico-producer").join("config.json");
        if path.exists() {
            return path;
        }
    }
    local
}

/// Load the configuration, falling back to defaults when the file does not
/// exist yet. An explicitly given file must exist.
pub fn load_config(path: &Path, explicit: bool) -> Result<PicoConfig> {
    if path.exists() {
        let config = PicoConfig::load(path)?;
        tracing::debug!("Loaded config from: {}", path.display());
        return Ok(config);
    }
    if explicit {
        anyhow::bail!("Config file not found: {}", path.display());
    }
    tracing::debug!("No config file found at {}, using defaults", path.display());
    Ok(PicoConfig::default())
}

fn dict_name(variable: &str) -> Option<&'static str> {
    match variable {
        "channel" | "channels" => Some("channels"),
        "era" | "eras" => Some("eras"),
        _ => None,
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// pico list
pub fn cmd_list(config: &PicoConfig, path: &Path) -> Result<()> {
    println!(">>> Configuration {}:", path.display());
    let value = serde_json::to_value(config).context("Failed to serialize config")?;
    let Value::Object(map) = value else {
        return Ok(());
    };
    for (variable, value) in &map {
        match value {
            Value::Object(dict) => {
                println!(">>>   {}:", bold(variable));
                for (key, item) in dict {
                    println!(">>>     {:<10} {}", key, format_value(item));
                }
            }
            other => println!(">>>   {:<20} = {}", bold(variable), format_value(other)),
        }
    }
    Ok(())
}

/// Options of `pico get`.
pub struct GetOptions<'a> {
    pub eras: &'a [String],
    pub channels: &'a [String],
    pub tag: &'a str,
    pub query: &'a SampleQuery,
    pub checkdas: bool,
    /// File list template to write with `get files`.
    pub write: Option<&'a str>,
}

/// pico get
pub async fn cmd_get(config: &PicoConfig, discovery: &Discovery, variable: &str, opts: &GetOptions<'_>) -> Result<()> {
    match variable {
        "samples" => {
            for era in opts.eras {
                for channel in channels_or_any(opts.channels) {
                    for sample in getsamples(config, era, channel, opts.tag, opts.query)? {
                        println!(">>> {}", bold(&sample.name));
                        for path in &sample.paths {
                            println!(">>>   {}", path);
                        }
                    }
                }
            }
        }
        "files" => {
            for era in opts.eras {
                for channel in channels_or_any(opts.channels) {
                    for mut sample in getsamples(config, era, channel, opts.tag, opts.query)? {
                        println!(">>> {}", bold(&sample.name));
                        println!(">>> {:<12} = {}", "url", sample.url());
                        println!(">>> {:<12} = {:?}", "postfix", sample.postfix);
                        let files = discovery.getfiles(&mut sample, false, false).await?;
                        println!(">>> {:<12} = {}", "nfiles", files.len());
                        if opts.checkdas {
                            let nevents = discovery.getnevents(&mut sample, false).await?;
                            println!(">>> {:<12} = {}", "ndasevents", nevents);
                        }
                        match opts.write {
                            Some(template) => {
                                let written = write_filelist(template, era, &sample, opts.tag, &files)?;
                                println!(">>> Written to {}", written.display());
                            }
                            None => {
                                println!(">>> {:<12} = [", "infiles");
                                for file in &files {
                                    println!(">>>   {}", file);
                                }
                                println!(">>> ]");
                            }
                        }
                    }
                }
            }
        }
        _ => match config.get(variable)? {
            Some(value) => println!(">>> Configured {} = {}", variable, format_value(&value)),
            None => println!(">>> Did not find {} in the configuration", variable),
        },
    }
    Ok(())
}

fn channels_or_any(channels: &[String]) -> Vec<&str> {
    if channels.is_empty() {
        vec![""]
    } else {
        channels.iter().map(String::as_str).collect()
    }
}

/// pico set <variable> [key] <value>
pub fn cmd_set(config: &mut PicoConfig, path: &Path, variable: &str, key: Option<&str>, value: &str) -> Result<()> {
    match (dict_name(variable), key) {
        (Some(dict), Some(key)) => {
            config.link(dict, key, value)?;
            println!(">>> Linked {} '{}' to {:?}", variable, key, value);
        }
        (Some(_), None) => {
            anyhow::bail!("Please give a key when setting '{}': pico set {} <key> <value>", variable, variable);
        }
        (None, Some(key)) => {
            anyhow::bail!("Variable '{}' takes no key, got '{}'", variable, key);
        }
        (None, None) => {
            config.set(variable, value)?;
            println!(">>> Set {} = {:?}", variable, value);
        }
    }
    config.save(path)?;
    tracing::info!("Saved config to {}", path.display());
    Ok(())
}

/// pico channel <key> <module> / pico era <key> <samplelist>
pub fn cmd_link(config: &mut PicoConfig, path: &Path, variable: &str, key: &str, value: &str) -> Result<()> {
    cmd_set(config, path, variable, Some(key), value)
}

/// pico rm <variable> [key]
pub fn cmd_rm(config: &mut PicoConfig, path: &Path, variable: &str, key: Option<&str>) -> Result<()> {
    let removed = match (dict_name(variable), key) {
        (Some(dict), Some(key)) => config.unlink(dict, key)?,
        (_, _) => config.remove(variable)?,
    };
    let name = match key {
        Some(key) => format!("{} '{}'", variable, key),
        None => variable.to_string(),
    };
    if !removed {
        println!(">>> Did not find {} in the configuration", name);
        return Ok(());
    }
    println!(">>> Removed {}", name);
    config.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_explicit_path() {
        let tmp = TempDir::new().expect("tmp");
        let path = tmp.path().join("custom.json");
        assert_eq!(resolve_config_path(Some(&path), tmp.path()), path);
    }

    #[test]
    fn test_resolve_basedir_config() {
        let tmp = TempDir::new().expect("tmp");
        let local = tmp.path().join("config").join("config.json");
        std::fs::create_dir_all(tmp.path().join("config")).expect("mkdir");
        std::fs::write(&local, "{}").expect("write");
        if std::env::var("PICO_CONFIG_DIR").is_err() {
            assert_eq!(resolve_config_path(None, tmp.path()), local);
        }
    }

    #[test]
    fn test_load_config_missing() {
        let tmp = TempDir::new().expect("tmp");
        let path = tmp.path().join("config.json");
        assert_eq!(load_config(&path, false).expect("defaults"), PicoConfig::default());
        assert!(load_config(&path, true).is_err());
    }

    #[test]
    fn test_set_link_and_rm() {
        let tmp = TempDir::new().expect("tmp");
        let path = tmp.path().join("config").join("config.json");
        let mut config = PicoConfig::default();

        cmd_set(&mut config, &path, "nfilesperjob", None, "4").expect("set");
        cmd_set(&mut config, &path, "channel", Some("etau"), "ModuleETau").expect("link");
        cmd_link(&mut config, &path, "era", "UL2018", "samples_UL2018.json").expect("era");
        let loaded = PicoConfig::load(&path).expect("load");
        assert_eq!(loaded.nfilesperjob, 4);
        assert_eq!(loaded.channels["etau"], "ModuleETau");
        assert_eq!(loaded.eras["UL2018"], "samples_UL2018.json");

        assert!(cmd_set(&mut config, &path, "channel", None, "x").is_err());
        assert!(cmd_set(&mut config, &path, "nfilesperjob", Some("a"), "1").is_err());

        cmd_rm(&mut config, &path, "channel", Some("etau")).expect("rm");
        cmd_rm(&mut config, &path, "nfilesperjob", None).expect("rm");
        let loaded = PicoConfig::load(&path).expect("load");
        assert!(!loaded.channels.contains_key("etau"));
        assert_eq!(loaded.nfilesperjob, 1);
    }
}
