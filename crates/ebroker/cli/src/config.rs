use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use ebroker_core::{Backend, Timeouts};
use serde::Deserialize;

const CONFIG_DIR: &str = "~/.ebroker";
const DEFAULT_CONFIG_FILE: &str = "config.toml";
/// Name of the config file inside `PRO_CONF_DIR`.
const CONF_DIR_FILE: &str = "ebroker.toml";
const TEMPLATES_FILE: &str = "templates.json";
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub cyclecloud: Option<CycleCloudSection>,
    /// Directory the config was read from; templates live next to it.
    #[serde(skip)]
    pub conf_dir: PathBuf,
}

/// Durations as humantime strings, e.g. "15m" or "1h 30m".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeoutConfig {
    pub request_validity: Option<String>,
    pub creation: Option<String>,
    pub termination: Option<String>,
    pub retention: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CycleCloudSection {
    pub server: String,
    pub cluster: String,
    pub user: String,
    pub password: Option<String>,
    pub region: Option<String>,
    pub call_timeout: Option<String>,
}

impl Config {
    pub fn backend(&self) -> Result<Backend> {
        self.backend
            .as_deref()
            .unwrap_or("cyclecloud")
            .parse::<Backend>()
            .map_err(|e| anyhow!(e))
    }

    /// Backend defaults, overridden by whatever the `[timeouts]` table sets.
    pub fn timeouts(&self, backend: Backend) -> Result<Timeouts> {
        let mut timeouts = Timeouts::for_backend(backend);
        let t = &self.timeouts;
        override_duration(&mut timeouts.request_validity, t.request_validity.as_deref(), "request_validity")?;
        override_duration(&mut timeouts.creation, t.creation.as_deref(), "creation")?;
        override_duration(&mut timeouts.termination, t.termination.as_deref(), "termination")?;
        override_duration(&mut timeouts.retention, t.retention.as_deref(), "retention")?;
        Ok(timeouts)
    }

    /// `PRO_DATA_DIR`, then the `data_dir` key, then `~/.ebroker/data`.
    pub fn data_dir(&self) -> PathBuf {
        env::var("PRO_DATA_DIR")
            .ok()
            .filter(|d| !d.is_empty())
            .or_else(|| self.data_dir.clone())
            .map(|d| expand_tilde(&d))
            .unwrap_or_else(|| expand_tilde(CONFIG_DIR).join("data"))
    }

    /// `PRO_LOG_DIR`, then the `log_dir` key. `None` logs to stderr.
    pub fn log_dir(&self) -> Option<PathBuf> {
        env::var("PRO_LOG_DIR")
            .ok()
            .filter(|d| !d.is_empty())
            .or_else(|| self.log_dir.clone())
            .map(|d| expand_tilde(&d))
    }

    /// Limit on a single backend call, `cyclecloud.call_timeout` or 60s.
    pub fn call_timeout(&self) -> Result<Duration> {
        match self.cyclecloud.as_ref().and_then(|s| s.call_timeout.as_deref()) {
            Some(value) => humantime::parse_duration(value)
                .with_context(|| format!("cyclecloud.call_timeout = '{}' is not a duration", value)),
            None => Ok(DEFAULT_CALL_TIMEOUT),
        }
    }

    pub fn templates_path(&self) -> PathBuf {
        self.conf_dir.join(TEMPLATES_FILE)
    }
}

fn override_duration(slot: &mut Duration, value: Option<&str>, key: &str) -> Result<()> {
    if let Some(value) = value {
        *slot = humantime::parse_duration(value)
            .with_context(|| format!("timeouts.{} = '{}' is not a duration", key, value))?;
    }
    Ok(())
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Load `$PRO_CONF_DIR/ebroker.toml`, or `~/.ebroker/config.toml` when
/// `PRO_CONF_DIR` is unset. A missing file yields the defaults.
pub fn parse_config() -> Result<Config> {
    let (conf_dir, path) = match env::var("PRO_CONF_DIR").ok().filter(|d| !d.is_empty()) {
        Some(dir) => {
            let dir = expand_tilde(&dir);
            let path = dir.join(CONF_DIR_FILE);
            (dir, path)
        }
        None => {
            let dir = expand_tilde(CONFIG_DIR);
            let path = dir.join(DEFAULT_CONFIG_FILE);
            (dir, path)
        }
    };
    parse_config_file(&path, conf_dir)
}

pub fn parse_config_file(path: &Path, conf_dir: PathBuf) -> Result<Config> {
    let mut config = if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str::<Config>(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?
    } else {
        Config::default()
    };
    config.conf_dir = conf_dir;
    Ok(config)
}
