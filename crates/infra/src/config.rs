//! Engine configuration.
//!
//! Loaded from a JSON file (camelCase keys) or from `VAULTLINE_*` environment
//! variables. Every field except `id` has a default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vaultline_core::{DomainError, DomainResult};
use vaultline_tasks::Tags;

pub const DEFAULT_MAX_WORKERS: usize = 10;
pub const DEFAULT_COMMAND_PORT: u16 = 8888;
pub const DEFAULT_SLEEP_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_TEMP_DIR: &str = "~/backup_temp";

/// Placeholder in tag values replaced with the local host name.
pub const HOST_BINDING: &str = "$HOST";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub id: String,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    #[serde(default = "default_command_port")]
    pub command_port: u16,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default = "default_sleep_interval_secs")]
    pub sleep_interval_secs: u64,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub backup_command: Option<String>,
    #[serde(default)]
    pub restore_command: Option<String>,
    /// `json` or `text`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_temp_dir() -> String {
    DEFAULT_TEMP_DIR.to_string()
}

fn default_command_port() -> u16 {
    DEFAULT_COMMAND_PORT
}

fn default_sleep_interval_secs() -> u64 {
    DEFAULT_SLEEP_INTERVAL_SECS
}

fn default_log_format() -> String {
    "json".to_string()
}

impl EngineConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            max_workers: DEFAULT_MAX_WORKERS,
            temp_dir: default_temp_dir(),
            command_port: DEFAULT_COMMAND_PORT,
            tags: Tags::new(),
            sleep_interval_secs: DEFAULT_SLEEP_INTERVAL_SECS,
            database_url: None,
            backup_command: None,
            restore_command: None,
            log_format: default_log_format(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> DomainResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| DomainError::configuration(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| DomainError::configuration(format!("invalid config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> DomainResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> DomainResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let id = lookup("VAULTLINE_ENGINE_ID")
            .ok_or_else(|| DomainError::configuration("VAULTLINE_ENGINE_ID is not set"))?;
        let mut config = Self::new(id);

        if let Some(v) = lookup("VAULTLINE_MAX_WORKERS") {
            config.max_workers = parse_var("VAULTLINE_MAX_WORKERS", &v)?;
        }
        if let Some(v) = lookup("VAULTLINE_TEMP_DIR") {
            config.temp_dir = v;
        }
        if let Some(v) = lookup("VAULTLINE_COMMAND_PORT") {
            config.command_port = parse_var("VAULTLINE_COMMAND_PORT", &v)?;
        }
        if let Some(v) = lookup("VAULTLINE_TAGS") {
            config.tags = serde_json::from_str(&v)
                .map_err(|e| DomainError::configuration(format!("VAULTLINE_TAGS must be a JSON object: {e}")))?;
        }
        if let Some(v) = lookup("VAULTLINE_SLEEP_INTERVAL_SECS") {
            config.sleep_interval_secs = parse_var("VAULTLINE_SLEEP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("VAULTLINE_LOG_FORMAT") {
            config.log_format = v;
        }
        config.database_url = lookup("DATABASE_URL");
        config.backup_command = lookup("VAULTLINE_BACKUP_COMMAND");
        config.restore_command = lookup("VAULTLINE_RESTORE_COMMAND");

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.id.trim().is_empty() {
            return Err(DomainError::configuration("engine id must not be empty"));
        }
        if self.max_workers == 0 {
            return Err(DomainError::configuration("maxWorkers must be at least 1"));
        }
        Ok(())
    }

    /// `tempDir` with a leading `~` expanded to the home directory.
    pub fn temp_dir_path(&self) -> PathBuf {
        expand_home(&self.temp_dir)
    }

    pub fn sleep_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_interval_secs)
    }

    /// Tags with [`HOST_BINDING`] substituted in string values.
    pub fn resolved_tags(&self, host: &str) -> Tags {
        resolve_tags(&self.tags, host)
    }
}

pub fn resolve_tags(tags: &Tags, host: &str) -> Tags {
    tags.iter()
        .map(|(name, value)| {
            let value = match value.as_str() {
                Some(s) => serde_json::Value::String(s.replace(HOST_BINDING, host)),
                None => value.clone(),
            };
            (name.clone(), value)
        })
        .collect()
}

fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(path),
    };
    match dirs::home_dir() {
        Some(home) if rest.is_empty() => home,
        Some(home) => home.join(rest),
        None => PathBuf::from(path),
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> DomainResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| DomainError::configuration(format!("{key}: {e}")))
}
