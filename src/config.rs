use crate::log::DEFAULT_LOG_TIMEOUT;
use crate::monitor::{DEFAULT_MAX_ERROR_SIZE, DEFAULT_MAX_LOG_LINES};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "engine.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub module: String,
    pub command: String,
    pub home_var: Option<String>,
    pub env: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Lines kept in the recent-log tail.
    pub max_log_lines: usize,
    /// When true, `close` leaves the child running.
    pub wait_completion: bool,
    /// Age after which an existing log file may be reused.
    pub log_timeout: Duration,
    /// Cap on the size of a captured error block.
    pub max_error_size: usize,
    pub work_dir_root: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_log_lines: DEFAULT_MAX_LOG_LINES,
            wait_completion: true,
            log_timeout: DEFAULT_LOG_TIMEOUT,
            max_error_size: DEFAULT_MAX_ERROR_SIZE,
            work_dir_root: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub engine: EngineConfig,
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Deserialize)]
struct RawEngineConfig {
    module: String,
    command: String,
    home_var: Option<String>,
    env: Option<HashMap<String, String>>,
    #[serde(flatten)]
    extra: HashMap<String, toml::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSupervisorConfig {
    max_log_lines: Option<usize>,
    wait_completion: Option<bool>,
    log_timeout_secs: Option<u64>,
    max_error_size: Option<usize>,
    work_dir_root: Option<PathBuf>,
    #[serde(flatten)]
    extra: HashMap<String, toml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    engine: Option<RawEngineConfig>,
    supervisor: Option<RawSupervisorConfig>,
    #[serde(flatten)]
    extra: HashMap<String, toml::Value>,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("config file is empty")]
    Empty,
    #[error("TOML parse error: {0}")]
    TomlParse(String),
    #[error("missing [engine] section")]
    MissingEngine,
    #[error("unknown field `{field}` in `{section}`")]
    UnknownField { section: String, field: String },
    #[error("{0}")]
    IoError(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    if content.trim().is_empty() {
        return Err(ConfigError::Empty);
    }

    let raw: RawConfig =
        toml::from_str(content).map_err(|e| ConfigError::TomlParse(e.to_string()))?;

    reject_unknown("config", &raw.extra)?;

    let Some(engine) = raw.engine else {
        return Err(ConfigError::MissingEngine);
    };
    reject_unknown("engine", &engine.extra)?;

    let sup = raw.supervisor.unwrap_or_default();
    reject_unknown("supervisor", &sup.extra)?;

    let defaults = SupervisorConfig::default();
    Ok(Config {
        engine: EngineConfig {
            module: engine.module,
            command: engine.command,
            home_var: engine.home_var,
            env: engine.env,
        },
        supervisor: SupervisorConfig {
            max_log_lines: sup.max_log_lines.unwrap_or(defaults.max_log_lines),
            wait_completion: sup.wait_completion.unwrap_or(defaults.wait_completion),
            log_timeout: sup
                .log_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.log_timeout),
            max_error_size: sup.max_error_size.unwrap_or(defaults.max_error_size),
            work_dir_root: sup.work_dir_root,
        },
    })
}

fn reject_unknown(section: &str, extra: &HashMap<String, toml::Value>) -> Result<(), ConfigError> {
    // Report the alphabetically first key so errors are stable.
    match extra.keys().min() {
        Some(field) => Err(ConfigError::UnknownField {
            section: section.to_string(),
            field: field.clone(),
        }),
        None => Ok(()),
    }
}
