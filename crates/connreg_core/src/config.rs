//! Registry and per-database connection settings.
//!
//! # Responsibility
//! - Describe how each logical database is opened and pooled.
//! - Load settings from a JSON file and environment overrides.
//!
//! # Invariants
//! - Unknown logical names resolve to default settings.
//! - `max_open_conns >= 1` and `max_idle_conns <= max_open_conns` after validation.

use crate::registry::{RetryPolicy, DEFAULT_NAME};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// Prefix for environment overrides, e.g. `CONNREG_MAIN_PATH`.
pub const ENV_PREFIX: &str = "CONNREG_";

const DEFAULT_MAX_OPEN_CONNS: u32 = 20;
const DEFAULT_MAX_IDLE_CONNS: u32 = 20;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 5_000;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse(serde_json::Error),
    InvalidValue {
        key: String,
        reason: String,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid config document: {err}"),
            Self::InvalidValue { key, reason } => write!(f, "invalid value for `{key}`: {reason}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::InvalidValue { .. } => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

/// How one logical database is opened and pooled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// SQLite file path. `None` selects a shared in-memory database named after the logical name.
    pub path: Option<String>,
    /// Upper bound on connections; further checkouts wait for one to be returned.
    pub max_open_conns: u32,
    /// Connections kept open while idle.
    pub max_idle_conns: u32,
    pub busy_timeout_ms: u64,
    /// How long a checkout, or the initial connect, waits before failing.
    pub connection_timeout_ms: u64,
    /// Logs every connection checkout at debug level.
    pub debug: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            path: None,
            max_open_conns: DEFAULT_MAX_OPEN_CONNS,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            debug: false,
        }
    }
}

impl ConnectionSettings {
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    fn validate(&self, name: &str) -> ConfigResult<()> {
        if self.max_open_conns == 0 {
            return Err(ConfigError::InvalidValue {
                key: format!("databases.{name}.max_open_conns"),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_idle_conns > self.max_open_conns {
            return Err(ConfigError::InvalidValue {
                key: format!("databases.{name}.max_idle_conns"),
                reason: format!(
                    "{} exceeds max_open_conns {}",
                    self.max_idle_conns, self.max_open_conns
                ),
            });
        }
        if self.connection_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: format!("databases.{name}.connection_timeout_ms"),
                reason: "must be at least 1".to_string(),
            });
        }
        if matches!(self.path.as_deref(), Some(path) if path.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                key: format!("databases.{name}.path"),
                reason: "must not be blank".to_string(),
            });
        }
        Ok(())
    }
}

/// Top-level registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub default_name: String,
    pub retry: RetryPolicy,
    pub databases: BTreeMap<String, ConnectionSettings>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_name: DEFAULT_NAME.to_string(),
            retry: RetryPolicy::default(),
            databases: BTreeMap::new(),
        }
    }
}

impl RegistryConfig {
    /// Parses and validates a JSON config document.
    pub fn from_json_str(document: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&document)
    }

    /// Applies process environment overrides. See [`RegistryConfig::apply_env_overrides`].
    pub fn apply_process_env(&mut self) -> ConfigResult<()> {
        self.apply_env_overrides(std::env::vars())
    }

    /// Applies `CONNREG_DEFAULT_NAME` and `CONNREG_<NAME>_<FIELD>` overrides.
    ///
    /// `<NAME>` is matched case-insensitively against configured names; an
    /// unmatched name creates a new entry from defaults (lowercased). Fields:
    /// `PATH`, `MAX_OPEN_CONNS`, `MAX_IDLE_CONNS`, `BUSY_TIMEOUT_MS`,
    /// `CONNECTION_TIMEOUT_MS`, `DEBUG`.
    /// Variables without the prefix or with an unknown field are ignored.
    pub fn apply_env_overrides<I, K, V>(&mut self, vars: I) -> ConfigResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let key = key.as_ref();
            let value = value.as_ref();
            let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            if rest == "DEFAULT_NAME" {
                self.default_name = value.trim().to_string();
                continue;
            }
            let Some((name, field)) = split_env_field(rest) else {
                continue;
            };
            let name = self.resolve_env_name(name);
            let settings = self.databases.entry(name).or_default();
            apply_env_field(settings, key, field, value)?;
        }
        self.validate()
    }

    /// Returns the settings for `name`, falling back to defaults.
    pub fn settings_for(&self, name: &str) -> ConnectionSettings {
        self.databases.get(name).cloned().unwrap_or_default()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.default_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "default_name".to_string(),
                reason: "must not be blank".to_string(),
            });
        }
        for (name, settings) in &self.databases {
            settings.validate(name)?;
        }
        Ok(())
    }

    fn resolve_env_name(&self, env_name: &str) -> String {
        self.databases
            .keys()
            .find(|name| name.eq_ignore_ascii_case(env_name))
            .cloned()
            .unwrap_or_else(|| env_name.to_ascii_lowercase())
    }
}

const ENV_FIELDS: &[&str] = &[
    "MAX_OPEN_CONNS",
    "MAX_IDLE_CONNS",
    "BUSY_TIMEOUT_MS",
    "CONNECTION_TIMEOUT_MS",
    "DEBUG",
    "PATH",
];

fn split_env_field(rest: &str) -> Option<(&str, &str)> {
    ENV_FIELDS.iter().find_map(|field| {
        let name = rest.strip_suffix(field)?.strip_suffix('_')?;
        if name.is_empty() {
            None
        } else {
            Some((name, *field))
        }
    })
}

fn apply_env_field(
    settings: &mut ConnectionSettings,
    key: &str,
    field: &str,
    value: &str,
) -> ConfigResult<()> {
    let value = value.trim();
    match field {
        "PATH" => settings.path = Some(value.to_string()),
        "MAX_OPEN_CONNS" => settings.max_open_conns = parse_env_number(key, value)?,
        "MAX_IDLE_CONNS" => settings.max_idle_conns = parse_env_number(key, value)?,
        "BUSY_TIMEOUT_MS" => settings.busy_timeout_ms = parse_env_number(key, value)?,
        "CONNECTION_TIMEOUT_MS" => {
            settings.connection_timeout_ms = parse_env_number(key, value)?
        }
        "DEBUG" => settings.debug = parse_env_bool(key, value)?,
        _ => {}
    }
    Ok(())
}

fn parse_env_number<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("expected a non-negative integer, got `{value}`"),
    })
}

fn parse_env_bool(key: &str, value: &str) -> ConfigResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected a boolean, got `{value}`"),
        }),
    }
}
