//! Engine configuration.
//!
//! ```toml
//! [database]
//! path = "layers.gpkg"      # ":memory:" for an in-memory database
//! pool_size = 4
//! acquire_timeout_ms = 5000
//! busy_timeout_ms = 5000
//!
//! [import]
//! batch_size = 500
//!
//! [geometry]
//! default_source_epsg = 32647
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crs::DEFAULT_SOURCE_EPSG;
use crate::error::Result;

pub const IN_MEMORY_PATH: &str = ":memory:";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub import: ImportSettings,
    #[serde(default)]
    pub geometry: GeometrySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Database file, or `:memory:`.
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Connections opened up front. In-memory databases always use one.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// How long `acquire` waits for an idle connection.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// SQLite busy handler timeout for each connection.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSettings {
    /// Rows per import transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometrySettings {
    /// Source system for bare projected coordinates (the `utm2latlng` command).
    #[serde(default = "default_source_epsg")]
    pub default_source_epsg: u32,
}

fn default_path() -> PathBuf {
    PathBuf::from(IN_MEMORY_PATH)
}

fn default_pool_size() -> usize {
    4
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_batch_size() -> usize {
    500
}

fn default_source_epsg() -> u32 {
    DEFAULT_SOURCE_EPSG
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: default_path(),
            pool_size: default_pool_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

impl Default for GeometrySettings {
    fn default() -> Self {
        Self {
            default_source_epsg: default_source_epsg(),
        }
    }
}

impl DatabaseSettings {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == IN_MEMORY_PATH
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl EngineConfig {
    /// Configuration for a database file with default settings.
    pub fn for_file(path: impl Into<PathBuf>) -> Self {
        Self {
            database: DatabaseSettings::file(path),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a TOML file. A relative database path is resolved against
    /// the file's directory.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::from_toml_str(&std::fs::read_to_string(path)?)?;
        if !config.database.is_in_memory() && config.database.path.is_relative() {
            if let Some(dir) = path.parent() {
                config.database.path = dir.join(&config.database.path);
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() -> Result<()> {
        let config = EngineConfig::from_toml_str("")?;
        assert_eq!(config, EngineConfig::default());
        assert!(config.database.is_in_memory());
        assert_eq!(config.import.batch_size, 500);
        assert_eq!(config.geometry.default_source_epsg, 32647);
        Ok(())
    }

    #[test]
    fn partial_sections_keep_field_defaults() -> Result<()> {
        let config = EngineConfig::from_toml_str(
            r#"
            [database]
            path = "layers.gpkg"
            pool_size = 8

            [import]
            batch_size = 50
            "#,
        )?;
        assert_eq!(config.database.path, PathBuf::from("layers.gpkg"));
        assert_eq!(config.database.pool_size, 8);
        assert_eq!(config.database.acquire_timeout(), Duration::from_secs(5));
        assert_eq!(config.import.batch_size, 50);
        Ok(())
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(
            EngineConfig::from_toml_str("[database\npath ="),
            Err(crate::GeoLayerError::Toml(_))
        ));
    }
}
