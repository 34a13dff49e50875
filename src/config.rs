//! `relay.toml` loading.
//!
//! Every section is optional; secrets may come from `RELAY_API_KEY` and
//! `RELAY_ACCESS_TOKEN` instead of the file.

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use thiserror::Error;
use crate::backends::RestConfig;
use crate::core::{QueueConfig, DEFAULT_CHUNK_SIZE, DEFAULT_STATE_KEY};
use crate::thumbnail::ThumbnailConfig;

pub const API_KEY_ENV: &str = "RELAY_API_KEY";
pub const ACCESS_TOKEN_ENV: &str = "RELAY_ACCESS_TOKEN";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Can't read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Can't parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {name}: {message}")]
    Invalid {
        name: &'static str,
        message: String,
    },
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub backend: BackendSection,
    pub upload: UploadSection,
    pub thumbnail: ThumbnailSection,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct BackendSection {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct UploadSection {
    pub bucket: String,
    pub owner_id: Option<String>,
    pub chunk_size: usize,
    pub default_priority: i32,
    pub abort_in_flight: bool,
    pub state_dir: PathBuf,
    pub state_key: String,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            bucket: "media".to_string(),
            owner_id: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            default_priority: 0,
            abort_in_flight: false,
            state_dir: PathBuf::from(".relay"),
            state_key: DEFAULT_STATE_KEY.to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ThumbnailSection {
    pub enabled: bool,
    pub ffmpeg_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub timeout_secs: u64,
}

impl Default for ThumbnailSection {
    fn default() -> Self {
        let defaults = ThumbnailConfig::default();
        Self {
            enabled: defaults.enabled,
            ffmpeg_path: defaults.ffmpeg_path,
            width: defaults.width,
            height: defaults.height,
            timeout_secs: defaults.timeout.as_secs(),
        }
    }
}

impl Config {
    /// Read `path`, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::parse(&config_str).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Like [`load`](Self::load), but a missing file gives the defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        match Self::load(&path) {
            Err(ConfigError::Read { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                let mut config = Config::default();
                config.apply_env(|name| std::env::var(name).ok());
                Ok(config)
            }
            other => other,
        }
    }

    pub fn parse(config_str: &str) -> Result<Config, toml::de::Error> {
        toml::from_str(config_str)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(api_key) = var(API_KEY_ENV).filter(|value| !value.is_empty()) {
            self.backend.api_key = Some(api_key);
        }
        if let Some(token) = var(ACCESS_TOKEN_ENV).filter(|value| !value.is_empty()) {
            self.backend.access_token = Some(token);
        }
    }

    pub fn queue_config(&self) -> Result<QueueConfig, ConfigError> {
        let owner_id = self.upload.owner_id
            .clone()
            .ok_or(ConfigError::Missing("upload.owner_id"))?;
        if self.upload.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                name: "upload.chunk_size",
                message: "must be greater than zero".to_string(),
            });
        }

        let mut config = QueueConfig::new(owner_id, self.upload.bucket.clone())
            .with_chunk_size(self.upload.chunk_size)
            .with_abort_in_flight(self.upload.abort_in_flight)
            .with_state_key(self.upload.state_key.clone());
        config.default_priority = self.upload.default_priority;
        Ok(config)
    }

    pub fn rest_config(&self) -> Result<RestConfig, ConfigError> {
        let base_url = self.backend.url.clone().ok_or(ConfigError::Missing("backend.url"))?;
        let api_key = self.backend.api_key.clone().ok_or(ConfigError::Missing("backend.api_key"))?;

        Ok(RestConfig {
            base_url,
            api_key,
            access_token: self.backend.access_token.clone(),
        })
    }

    pub fn thumbnail_config(&self) -> ThumbnailConfig {
        ThumbnailConfig {
            enabled: self.thumbnail.enabled,
            width: self.thumbnail.width,
            height: self.thumbnail.height,
            timeout: Duration::from_secs(self.thumbnail.timeout_secs),
            ffmpeg_path: self.thumbnail.ffmpeg_path.clone(),
            ..ThumbnailConfig::default()
        }
    }
}
