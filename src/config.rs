//! TOML configuration of the binary and the background job.

use crate::sizes::{RenderSpecification, SizeOverrides, generate_specifications};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_MAX_DIMENSION: u32 = 4096;
const DEFAULT_MAX_EXECUTION_TIME: u64 = 5 * 60;
const DEFAULT_STARTUP_JITTER_MS: u64 = 50;

/// Failure to load the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read
    #[error("Failed to read configuration file {path}")]
    Io {
        /// Path of the file
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML or has unexpected values
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection string of the queue database
    pub database_url: Option<String>,
    /// Preview dimensions
    pub previews: PreviewSettings,
    /// Background job budgets
    pub job: JobSettings,
    /// Locations used by the bundled local backend
    pub storage: StorageSettings,
}

impl Config {
    /// Parse the file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Like [`Config::from_file`], but a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_file(path)
    }
}

/// Maximum preview dimensions and optional size lists.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PreviewSettings {
    /// Maximum preview width
    pub max_x: u32,
    /// Maximum preview height
    pub max_y: u32,
    /// Per family size lists
    #[serde(flatten)]
    pub sizes: SizeOverrides,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            max_x: DEFAULT_MAX_DIMENSION,
            max_y: DEFAULT_MAX_DIMENSION,
            sizes: SizeOverrides::default(),
        }
    }
}

impl PreviewSettings {
    /// The previews to render for every file under these settings.
    pub fn specifications(&self) -> Vec<RenderSpecification> {
        generate_specifications(self.max_x, self.max_y, &self.sizes)
    }
}

/// How the host schedules its background jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundMode {
    /// A system cron calls the scheduler periodically
    #[default]
    Cron,
    /// Jobs piggyback on page requests
    Ajax,
    /// An external web cron service calls the scheduler
    Webcron,
}

/// Settings of the periodic background job.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Never run the background job
    pub disabled: bool,
    /// Wall clock budget of one invocation in seconds, `0` for unlimited
    pub max_execution_time: u64,
    /// Maximum files per invocation, `0` for unlimited
    pub max_previews: u64,
    /// Scheduling mode of the host
    pub background_mode: BackgroundMode,
    /// Upper bound of the random delay before a worker's first claim
    pub startup_jitter_ms: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            disabled: false,
            max_execution_time: DEFAULT_MAX_EXECUTION_TIME,
            max_previews: 0,
            background_mode: BackgroundMode::default(),
            startup_jitter_ms: DEFAULT_STARTUP_JITTER_MS,
        }
    }
}

/// Directories of the bundled local backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root holding one `<account>/files` tree per account
    pub root: PathBuf,
    /// Where rendered previews are written
    pub preview_root: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            preview_root: PathBuf::from("previews"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.previews.max_x, 4096);
        assert_eq!(config.job.max_execution_time, 300);
        assert_eq!(config.job.background_mode, BackgroundMode::Cron);
    }

    #[test]
    fn full_document() {
        let config = Config::from_toml(
            r#"
            database_url = "postgres://localhost/previews"

            [previews]
            max_x = 2048
            max_y = 1024
            square_sizes = "64 256"
            cover_width_height_sizes = ""

            [job]
            disabled = true
            max_previews = 500
            background_mode = "ajax"

            [storage]
            root = "/srv/data"
            "#,
        )
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/previews"));
        assert_eq!(config.previews.max_x, 2048);
        assert_eq!(config.previews.max_y, 1024);
        assert_eq!(config.previews.sizes.square_sizes.as_deref(), Some("64 256"));
        assert_eq!(config.previews.sizes.cover_width_height_sizes.as_deref(), Some(""));
        assert_eq!(config.previews.sizes.width_sizes, None);
        assert!(config.job.disabled);
        assert_eq!(config.job.max_previews, 500);
        assert_eq!(config.job.max_execution_time, 300);
        assert_eq!(config.job.background_mode, BackgroundMode::Ajax);
        assert_eq!(config.storage.root, PathBuf::from("/srv/data"));
        assert_eq!(config.storage.preview_root, PathBuf::from("previews"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let error = Config::from_toml("[job]\nbackground_mode = \"daemon\"\n").unwrap_err();
        assert!(matches!(error, ConfigError::Parse(_)));
    }

    #[test]
    fn load_from_disk() {
        let dir = tempfile::tempdir().unwrap();

        let missing = Config::load(dir.path().join("missing.toml")).unwrap();
        assert_eq!(missing, Config::default());

        let path = dir.path().join("previews.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "[previews]\nmax_x = 256\nmax_y = 256").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.previews.specifications().len(), 8);

        assert!(matches!(
            Config::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
