use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config file {path:?}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: InvalidSetting,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("`{field}` {reason}")]
pub struct InvalidSetting {
    pub field: &'static str,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FolioConfig {
    pub viewer: ViewerConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Render only pages reported visible.
    #[default]
    Lazy,
    /// Render every page up front.
    Batch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Drag gestures narrower or shorter than this (viewport px) are ignored.
    pub min_selection_size: f64,
    /// RGBA fill used for highlights.
    pub highlight_color: [u8; 4],
    pub zoom_step: f64,
    pub min_scale: f64,
    pub max_scale: f64,
    pub device_pixel_ratio: f64,
    pub container_width: f64,
    pub render_mode: RenderMode,
    pub menu_width: f64,
    pub note_input_width: f64,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            min_selection_size: 5.0,
            highlight_color: [255, 226, 52, 102],
            zoom_step: 1.25,
            min_scale: 0.25,
            max_scale: 4.0,
            device_pixel_ratio: 1.0,
            container_width: 800.0,
            render_mode: RenderMode::Lazy,
            menu_width: 160.0,
            note_input_width: 240.0,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Websocket base, e.g. `wss://lms.example.com`.
    pub base_url: String,
    /// Short-lived token endpoint. Defaults to `{base_url}/ws/token` over http(s).
    pub token_url: Option<String>,
    pub max_auth_retries: u32,
    pub max_retries: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub auth_retry_base: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub auth_retry_step: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub backoff_step: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub backoff_cap: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost:8000".to_owned(),
            token_url: None,
            max_auth_retries: 5,
            max_retries: 5,
            auth_retry_base: Duration::from_millis(300),
            auth_retry_step: Duration::from_millis(200),
            backoff_step: Duration::from_millis(2000),
            backoff_cap: Duration::from_millis(15000),
        }
    }
}

impl ViewerConfig {
    /// Rejects values the viewer cannot scale or clamp with.
    pub fn validate(&self) -> Result<(), InvalidSetting> {
        let positive = |field: &'static str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(InvalidSetting {
                    field,
                    reason: "must be a finite number above zero",
                })
            }
        };
        positive("min_scale", self.min_scale)?;
        positive("max_scale", self.max_scale)?;
        positive("zoom_step", self.zoom_step)?;
        positive("device_pixel_ratio", self.device_pixel_ratio)?;
        positive("container_width", self.container_width)?;
        positive("menu_width", self.menu_width)?;
        positive("note_input_width", self.note_input_width)?;
        if self.min_scale > self.max_scale {
            return Err(InvalidSetting {
                field: "min_scale",
                reason: "must not exceed max_scale",
            });
        }
        if !(self.min_selection_size.is_finite() && self.min_selection_size >= 0.0) {
            return Err(InvalidSetting {
                field: "min_selection_size",
                reason: "must be a finite, non-negative number",
            });
        }
        Ok(())
    }
}

impl SyncConfig {
    pub fn token_url(&self) -> String {
        if let Some(url) = &self.token_url {
            return url.clone();
        }
        let http_base = if let Some(rest) = self.base_url.strip_prefix("wss://") {
            format!("https://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("ws://") {
            format!("http://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{}/ws/token", http_base.trim_end_matches('/'))
    }
}

impl FolioConfig {
    pub fn from_toml(path: &Path, raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config
            .viewer
            .validate()
            .map_err(|source| ConfigError::Invalid {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(path, &raw)
    }

    /// Loads `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(?path, "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn default_path(dirs: &ProjectDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }
}
