//! Process configuration: TOML file, then command-line overrides

use crate::capture::CaptureRequest;
use crate::codec::Quality;
use crate::output::OutputTarget;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Output selection as written in the config file and on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Concatenated JPEGs on stdout
    Stdout,
    /// Numbered JPEG files
    Files,
    /// Multipart HTTP response on stdout
    #[default]
    Cgi,
    /// Built-in single-client HTTP server
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Device node; absent scans /dev/video0 to /dev/video15
    #[serde(default)]
    pub device: Option<String>,

    /// Frame width in pixels (0 = device default)
    #[serde(default)]
    pub width: u32,

    /// Frame height in pixels (0 = device default)
    #[serde(default)]
    pub height: u32,

    /// Frames per second (0 = device default)
    #[serde(default)]
    pub frame_rate: u32,

    /// Memory for the capture buffers, in MiB
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u32,

    /// JPEG quality (0-100); absent uses the encoder default
    #[serde(default)]
    pub quality: Option<u8>,

    #[serde(default)]
    pub output: OutputKind,

    /// HTTP port (0 = any free port)
    #[serde(default)]
    pub port: u16,

    /// Directory for the files output
    #[serde(default = "default_capture_dir")]
    pub capture_dir: PathBuf,

    /// Fail startup when the capture stream cannot be started
    #[serde(default)]
    pub strict_stream_start: bool,
}

fn default_max_memory_mb() -> u32 {
    8
}

fn default_capture_dir() -> PathBuf {
    PathBuf::from("capture")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: None,
            width: 0,
            height: 0,
            frame_rate: 0,
            max_memory_mb: default_max_memory_mb(),
            quality: None,
            output: OutputKind::default(),
            port: 0,
            capture_dir: default_capture_dir(),
            strict_stream_start: false,
        }
    }
}

impl Config {
    /// Loads configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(quality) = self.quality {
            if quality > 100 {
                return Err(ConfigError::Invalid(format!(
                    "quality must be between 0 and 100, got {}",
                    quality
                )));
            }
        }

        if self.max_memory_mb == 0 {
            return Err(ConfigError::Invalid(
                "max-memory-mb must be > 0".to_string(),
            ));
        }

        if matches!(self.device.as_deref(), Some("")) {
            return Err(ConfigError::Invalid("device path is empty".to_string()));
        }

        Ok(())
    }

    pub fn memory_budget(&self) -> usize {
        (self.max_memory_mb as usize).saturating_mul(1024 * 1024)
    }

    pub fn quality(&self) -> Quality {
        Quality::from(self.quality)
    }

    pub fn to_capture_request(&self) -> CaptureRequest {
        CaptureRequest {
            device: self.device.clone(),
            width: self.width,
            height: self.height,
            frame_rate: self.frame_rate,
            memory_budget: self.memory_budget(),
            strict_stream_start: self.strict_stream_start,
        }
    }

    pub fn output_target(&self) -> OutputTarget {
        match self.output {
            OutputKind::Stdout => OutputTarget::Stdout,
            OutputKind::Files => OutputTarget::Files(self.capture_dir.clone()),
            OutputKind::Cgi => OutputTarget::Cgi,
            OutputKind::Http => OutputTarget::Http(self.port),
        }
    }

    /// Saves configuration to TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
