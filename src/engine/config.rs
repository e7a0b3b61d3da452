//! RevDB Configuration Module
//! Handles loading and validating revdb.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE: &str = "revdb.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub version: String,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub attachments: AttachmentsConfig,
    #[serde(default)]
    pub changes: ChangesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file; `None` keeps the whole store in memory
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachmentsConfig {
    /// Blob directory; `None` keeps attachment bytes in memory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesConfig {
    /// Rows fetched per page by the change feed
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_pool_size() -> u32 {
    10
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_page_size() -> usize {
    256
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for ChangesConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

impl StoreConfig {
    pub fn load(store_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = store_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let mut config: StoreConfig = serde_json::from_str(&content)?;
        config.resolve_paths(store_dir);
        Ok(config)
    }

    pub fn save(&self, store_dir: &Path) -> Result<(), ConfigError> {
        let config_path = store_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Store rooted at `store_dir`: `data/revdb.sqlite3` plus `attachments/`
    pub fn default_for_dir(store_dir: &Path) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: DatabaseConfig {
                path: Some(store_dir.join("data").join("revdb.sqlite3")),
                ..DatabaseConfig::default()
            },
            attachments: AttachmentsConfig {
                path: Some(store_dir.join("attachments")),
            },
            changes: ChangesConfig::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: DatabaseConfig::default(),
            attachments: AttachmentsConfig::default(),
            changes: ChangesConfig::default(),
        }
    }

    /// Relative paths in a config file are relative to the directory holding it
    fn resolve_paths(&mut self, store_dir: &Path) {
        for path in [&mut self.database.path, &mut self.attachments.path]
            .into_iter()
            .flatten()
        {
            if path.is_relative() {
                *path = store_dir.join(&*path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_round_trip() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::default_for_dir(dir.path());
        config.save(dir.path()).unwrap();

        let loaded = StoreConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.database.path, config.database.path);
        assert_eq!(loaded.database.pool_size, 10);
        assert_eq!(loaded.changes.page_size, 256);
    }

    #[test]
    fn test_defaults_and_relative_paths() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"version": "0.1.0", "database": {"path": "db/store.sqlite3"}}"#,
        )
        .unwrap();

        let config = StoreConfig::load(dir.path()).unwrap();
        assert_eq!(config.database.path, Some(dir.path().join("db/store.sqlite3")));
        assert_eq!(config.database.busy_timeout_ms, 5000);
        assert!(config.attachments.path.is_none());
    }

    #[test]
    fn test_missing_config() {
        let dir = tempdir().unwrap();
        assert!(matches!(StoreConfig::load(dir.path()), Err(ConfigError::NotFound(_))));
    }
}
