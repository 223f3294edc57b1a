pub mod capture;
pub mod control;
pub mod error;
pub mod pipeline;
pub mod upload;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pipeline::StreamParams;

/// Agent configuration, layered from defaults, an optional TOML file and
/// `CLOUDCAM_*` environment variables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stream: StreamConfig,
    pub snapshot: SnapshotConfig,
    pub upload: UploadConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// GStreamer source description, or `auto`
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// H.264 bitrate in kbps
    pub bitrate: u32,
    pub host: String,
    pub port: u16,
    pub apply_interval_ms: u64,
    pub jpeg_quality: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub timeout_secs: u64,
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let params = StreamParams::default();
        Self {
            source: utils::TEST_SOURCE.into(),
            width: 480,
            height: 320,
            fps: 30,
            bitrate: params.bitrate,
            host: params.host,
            port: params.port,
            apply_interval_ms: 500,
            jpeg_quality: None,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            content_type: "image/jpeg".into(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "cloudcam=info".into(),
        }
    }
}

impl StreamConfig {
    /// Parameters the pipeline starts with and resets to
    pub fn default_params(&self) -> Result<StreamParams, ConfigError> {
        StreamParams::new(self.bitrate, &self.host, self.port).map_err(ConfigError::InvalidDefaults)
    }

    pub fn apply_interval(&self) -> Duration {
        Duration::from_millis(self.apply_interval_ms.max(1))
    }
}

impl SnapshotConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load defaults, then `path` (if it exists), then the environment
    /// (`CLOUDCAM_STREAM__PORT=30000` sets `stream.port`)
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("CLOUDCAM")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        self.stream.default_params()?;
        Ok(self)
    }
}
