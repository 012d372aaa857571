//! Settings read from a TOML file. Every key is optional; command line flags
//! override whatever the file says.

use crate::present::WindowOptions;
use crate::select::CursorSize;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_LOG_FILTER: &str = "info,wgpu_core=warn,wgpu_hal=warn,naga=warn";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Display device to capture from, the first `/dev/dri/card*` node when unset.
    pub device: Option<PathBuf>,
    pub window: WindowConfig,
    pub capture: CaptureConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        let options = WindowOptions::default();
        Self {
            width: options.width,
            height: options.height,
            fullscreen: options.fullscreen,
            title: options.title,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    pub prefer_cursor: bool,
    /// Square framebuffers of this edge length are treated as cursors.
    pub cursor_size: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            prefer_cursor: false,
            cursor_size: CursorSize::default().0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn window_options(&self) -> WindowOptions {
        WindowOptions {
            title: self.window.title.clone(),
            width: self.window.width,
            height: self.window.height,
            fullscreen: self.window.fullscreen,
        }
    }

    pub fn cursor_size(&self) -> CursorSize {
        CursorSize(self.capture.cursor_size)
    }
}
