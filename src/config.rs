//! Runtime configuration
//!
//! Paths and backend come from environment variables (a `.env` file is read
//! by the binary first). The source lists themselves are declared in a JSON
//! file:
//!
//! ```json
//! {
//!   "cas_source": "cas_source.csv",
//!   "lists": [
//!     { "name": "annex_xiv", "file": "annex_xiv.csv",
//!       "description": "Authorisation list", "columns": ["info_1", "info_2"] }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Json,
    Sqlite,
}

impl std::str::FromStr for BackendType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(BackendType::Json),
            "sqlite" => Ok(BackendType::Sqlite),
            _ => Err(ConfigError::InvalidValue(format!(
                "backend must be 'sqlite' or 'json', got '{}'",
                s
            ))),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    InvalidValue(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err)
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Invalid list configuration: {}", e),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// One configured source list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListSpec {
    pub name: String,
    pub file: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Declared attribute columns; every non-key column is kept when absent
    #[serde(default)]
    pub columns: Option<Vec<String>>,
}

impl ListSpec {
    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListsConfig {
    /// Master CAS reference file, relative to the input directory
    #[serde(default)]
    pub cas_source: Option<String>,
    pub lists: Vec<ListSpec>,
}

impl ListsConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let config: ListsConfig = serde_json::from_str(&json)?;
        config.validate()?;
        log::info!(
            "📋 Loaded {} list definition(s) from {}",
            config.lists.len(),
            path.as_ref().display()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lists.is_empty() {
            return Err(ConfigError::InvalidValue(
                "at least one source list must be configured".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for list in &self.lists {
            if list.name.trim().is_empty() {
                return Err(ConfigError::InvalidValue("list name cannot be empty".to_string()));
            }
            if list.file.trim().is_empty() {
                return Err(ConfigError::InvalidValue(format!(
                    "list '{}' has no file",
                    list.name
                )));
            }
            if !names.insert(list.name.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "list '{}' is configured twice",
                    list.name
                )));
            }
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ListSpec> {
        self.lists.iter().find(|l| l.name == name)
    }

    pub fn list_description(&self, name: &str) -> String {
        self.get(name)
            .map(|l| l.description().to_string())
            .unwrap_or_else(|| name.to_string())
    }
}

/// Environment-driven application settings
///
/// Environment variables:
/// - `ECHA_INPUT_DIR` (default: data/input)
/// - `ECHA_LISTS_CONFIG` (default: config/lists.json)
/// - `ECHA_BACKEND` (`sqlite` or `json`, default: sqlite)
/// - `ECHA_DB_PATH` (default: data/output/echa.db)
/// - `ECHA_OUTPUT_DIR` (default: data/output), used by the JSON backend
/// - `ECHA_HISTORY_RETENTION_DAYS` (optional)
/// - `ECHA_ARCHIVE_DIR` (optional), where loaded list files are copied after each cycle
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub input_dir: PathBuf,
    pub lists_config: PathBuf,
    pub backend: BackendType,
    pub db_path: PathBuf,
    pub output_dir: PathBuf,
    pub history_retention_days: Option<i64>,
    pub archive_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend: BackendType = env::var("ECHA_BACKEND")
            .unwrap_or_else(|_| "sqlite".to_string())
            .parse()?;

        let history_retention_days = match env::var("ECHA_HISTORY_RETENTION_DAYS") {
            Ok(s) => Some(s.trim().parse::<i64>().map_err(|_| {
                ConfigError::InvalidValue(format!(
                    "ECHA_HISTORY_RETENTION_DAYS must be a whole number of days, got '{}'",
                    s
                ))
            })?),
            Err(_) => None,
        };

        Ok(Self {
            input_dir: env::var("ECHA_INPUT_DIR")
                .unwrap_or_else(|_| "data/input".to_string())
                .into(),
            lists_config: env::var("ECHA_LISTS_CONFIG")
                .unwrap_or_else(|_| "config/lists.json".to_string())
                .into(),
            backend,
            db_path: env::var("ECHA_DB_PATH")
                .unwrap_or_else(|_| "data/output/echa.db".to_string())
                .into(),
            output_dir: env::var("ECHA_OUTPUT_DIR")
                .unwrap_or_else(|_| "data/output".to_string())
                .into(),
            history_retention_days,
            archive_dir: env::var("ECHA_ARCHIVE_DIR")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}
