use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::DEFAULT_TRANSITION_EVENT;

pub const MAX_PERSISTENCE_TIMEOUT_MS: u64 = 600_000;
pub const CONFIG_FILE_CANDIDATES: [&str; 2] = ["leadflow.toml", "config/leadflow.toml"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EngineConfig {
    /// Upper bound on every persistence call made by the engine.
    pub persistence_timeout_ms: u64,
    /// Event recorded when a transition request names none.
    pub default_event: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

/// Programmatic values applied after the environment.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub persistence_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("`${{{var}}}` is referenced by the config file but not set")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated `${{...}}` expression in config file")]
    UnterminatedInterpolation,
    #[error("invalid value for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite://leadflow.db".to_string(), max_connections: 5, timeout_secs: 30 }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { persistence_timeout_ms: 5_000, default_event: DEFAULT_TRANSITION_EVENT.to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Compact }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "logging.format `{other}` is not one of compact|pretty|json"
            ))),
        }
    }
}

/// One `LEADFLOW_*` variable: its names (first set wins) and how it lands in the config.
struct EnvBinding {
    names: &'static [&'static str],
    apply: fn(&mut AppConfig, &str, &str) -> Result<(), ConfigError>,
}

const ENV_BINDINGS: &[EnvBinding] = &[
    EnvBinding {
        names: &["LEADFLOW_DATABASE_URL"],
        apply: |config, _, value| {
            config.database.url = value.to_string();
            Ok(())
        },
    },
    EnvBinding {
        names: &["LEADFLOW_DATABASE_MAX_CONNECTIONS"],
        apply: |config, key, value| {
            config.database.max_connections = parse_number(key, value)?;
            Ok(())
        },
    },
    EnvBinding {
        names: &["LEADFLOW_DATABASE_TIMEOUT_SECS"],
        apply: |config, key, value| {
            config.database.timeout_secs = parse_number(key, value)?;
            Ok(())
        },
    },
    EnvBinding {
        names: &["LEADFLOW_ENGINE_PERSISTENCE_TIMEOUT_MS"],
        apply: |config, key, value| {
            config.engine.persistence_timeout_ms = parse_number(key, value)?;
            Ok(())
        },
    },
    EnvBinding {
        names: &["LEADFLOW_ENGINE_DEFAULT_EVENT"],
        apply: |config, _, value| {
            config.engine.default_event = value.to_string();
            Ok(())
        },
    },
    EnvBinding {
        names: &["LEADFLOW_LOGGING_LEVEL", "LEADFLOW_LOG_LEVEL"],
        apply: |config, _, value| {
            config.logging.level = value.to_string();
            Ok(())
        },
    },
    EnvBinding {
        names: &["LEADFLOW_LOGGING_FORMAT", "LEADFLOW_LOG_FORMAT"],
        apply: |config, _, value| {
            config.logging.format = value.parse()?;
            Ok(())
        },
    },
];

impl AppConfig {
    /// Defaults, then the config file, then `LEADFLOW_*` variables, then `overrides`.
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        match locate_config_file(options.config_path.as_deref()) {
            Some(path) => config.merge_file(read_file_layer(&path)?),
            None if options.require_file => {
                let expected = options
                    .config_path
                    .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_CANDIDATES[0]));
                return Err(ConfigError::MissingConfigFile(expected));
            }
            None => {}
        }

        for binding in ENV_BINDINGS {
            let found = binding
                .names
                .iter()
                .find_map(|name| non_blank_env(name).map(|value| (*name, value)));
            if let Some((name, value)) = found {
                (binding.apply)(&mut config, name, &value)?;
            }
        }

        config.merge_overrides(options.overrides);
        config.validate()?;
        Ok(config)
    }

    fn merge_file(&mut self, layer: FileLayer) {
        let database = layer.database.unwrap_or_default();
        replace(&mut self.database.url, database.url);
        replace(&mut self.database.max_connections, database.max_connections);
        replace(&mut self.database.timeout_secs, database.timeout_secs);

        let engine = layer.engine.unwrap_or_default();
        replace(&mut self.engine.persistence_timeout_ms, engine.persistence_timeout_ms);
        replace(&mut self.engine.default_event, engine.default_event);

        let logging = layer.logging.unwrap_or_default();
        replace(&mut self.logging.level, logging.level);
        replace(&mut self.logging.format, logging.format);
    }

    fn merge_overrides(&mut self, overrides: ConfigOverrides) {
        replace(&mut self.database.url, overrides.database_url);
        replace(&mut self.logging.level, overrides.log_level);
        replace(&mut self.logging.format, overrides.log_format);
        replace(&mut self.engine.persistence_timeout_ms, overrides.persistence_timeout_ms);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.database.url.trim();
        if !(url.starts_with("sqlite:") || url == ":memory:") {
            return Err(invalid(format!(
                "database.url `{url}` is not a sqlite URL (sqlite://<path>, sqlite::memory: or :memory:)"
            )));
        }
        if self.database.max_connections == 0 {
            return Err(invalid("database.max_connections must be at least 1"));
        }
        if !(1..=300).contains(&self.database.timeout_secs) {
            return Err(invalid("database.timeout_secs must be between 1 and 300"));
        }

        if !(1..=MAX_PERSISTENCE_TIMEOUT_MS).contains(&self.engine.persistence_timeout_ms) {
            return Err(invalid(format!(
                "engine.persistence_timeout_ms must be between 1 and {MAX_PERSISTENCE_TIMEOUT_MS}"
            )));
        }
        if self.engine.default_event.trim().is_empty() {
            return Err(invalid("engine.default_event must not be blank"));
        }

        let level = self.logging.level.trim().to_ascii_lowercase();
        if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
            return Err(invalid(format!(
                "logging.level `{}` is not one of trace|debug|info|warn|error",
                self.logging.level
            )));
        }

        Ok(())
    }
}

/// The explicit path when it exists, otherwise the first candidate present in the working dir.
pub fn locate_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => path.exists().then(|| path.to_path_buf()),
        None => CONFIG_FILE_CANDIDATES.iter().map(PathBuf::from).find(|path| path.exists()),
    }
}

fn read_file_layer(path: &Path) -> Result<FileLayer, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    let expanded = expand_env_references(&raw)?;
    toml::from_str(&expanded)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

/// Expands `${VAR}` and `${VAR:-fallback}`; an unset `VAR` without a fallback is an error.
fn expand_env_references(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = after_open.find('}').ok_or(ConfigError::UnterminatedInterpolation)?;
        let expression = &after_open[..end];

        let (name, fallback) = match expression.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (expression, None),
        };
        match (env::var(name), fallback) {
            (Ok(value), _) => output.push_str(&value),
            (Err(_), Some(fallback)) => output.push_str(fallback),
            (Err(_), None) => {
                return Err(ConfigError::MissingEnvInterpolation { var: name.to_string() })
            }
        }
        rest = &after_open[end + 1..];
    }

    output.push_str(rest);
    Ok(output)
}

fn replace<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

fn non_blank_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLayer {
    database: Option<DatabaseLayer>,
    engine: Option<EngineLayer>,
    logging: Option<LoggingLayer>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DatabaseLayer {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EngineLayer {
    persistence_timeout_ms: Option<u64>,
    default_event: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoggingLayer {
    level: Option<String>,
    format: Option<LogFormat>,
}
