use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{EncoderBackend, VideoCodec};

/// Default config directory under `$XDG_CONFIG_HOME`.
const CONFIG_DIR: &str = "vrlink";
/// Default config file name.
const CONFIG_FILE: &str = "config.toml";

/// Errors raised while reading the user configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Resolve the default config file path.
///
/// Returns `$XDG_CONFIG_HOME/vrlink/config.toml` or
/// `~/.config/vrlink/config.toml`.
#[must_use]
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join(CONFIG_DIR)
        .join(CONFIG_FILE)
}

/// Load the server configuration from a TOML file.
///
/// If `path` is `None`, reads from the default location.
/// Returns the default configuration if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file exists but cannot be read, parsed
/// or contains out-of-range values.
pub fn load(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_path(),
    };

    if !path.exists() {
        tracing::debug!(?path, "Config file not found, using defaults");
        return Ok(ServerConfig::default());
    }

    let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;

    let config: ServerConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.clone(),
        source,
    })?;
    config.encoding.validate()?;

    tracing::info!(?path, encoders = config.encoding.encoders.len(), "Configuration loaded");
    Ok(config)
}

/// Load the configuration, substituting defaults for a broken file.
///
/// A configuration problem must never keep the encoder from starting, so
/// every [`ConfigError`] is logged and replaced by [`ServerConfig::default`].
#[must_use]
pub fn load_or_default(path: Option<&Path>) -> ServerConfig {
    load(path).unwrap_or_else(|e| {
        tracing::error!("Failed to read encoder configuration: {e}");
        ServerConfig::default()
    })
}

/// Server configuration loaded from TOML file.
///
/// The encoder layout keys (`bitrate`, `scale`, `[[encoders]]`) live at
/// the top level of the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Encoder layout consumed by the settings planner.
    #[serde(flatten)]
    pub encoding: UserConfiguration,

    /// Stream timing and source geometry.
    pub stream: StreamConfig,
}

/// User-supplied encoder layout. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfiguration {
    /// Regions to encode. Empty means "pick defaults for this GPU".
    pub encoders: Vec<EncoderConfig>,

    /// Total bitrate in bits per second, split across all regions.
    pub bitrate: Option<u64>,

    /// Downscale factor applied to the source frame before encoding.
    pub scale: Option<Scale>,
}

impl UserConfiguration {
    /// Check that fractions and scale factors are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(scale) = self.scale {
            for factor in scale.factors() {
                if !factor.is_finite() || factor <= 0.0 || factor > 1.0 {
                    return Err(ConfigError::Invalid(format!(
                        "scale must be within (0, 1], got {factor}"
                    )));
                }
            }
        }

        for (index, encoder) in self.encoders.iter().enumerate() {
            let fractions = [
                ("width", encoder.width),
                ("height", encoder.height),
                ("offset_x", encoder.offset_x),
                ("offset_y", encoder.offset_y),
            ];
            for (name, value) in fractions {
                if let Some(v) = value {
                    if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                        return Err(ConfigError::Invalid(format!(
                            "encoders[{index}].{name} must be within [0, 1], got {v}"
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Scale factor: one number for both axes or an `[x, y]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scale {
    Uniform(f64),
    PerAxis([f64; 2]),
}

impl Scale {
    /// Horizontal and vertical factors.
    #[must_use]
    pub fn factors(self) -> [f64; 2] {
        match self {
            Self::Uniform(s) => [s, s],
            Self::PerAxis(xy) => xy,
        }
    }
}

/// One partially specified encoder region.
///
/// Geometry fields are fractions of the (scaled) source frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Backend encoding this region.
    pub encoder: EncoderBackend,

    /// Region width as a fraction of the frame width (default 1).
    #[serde(default)]
    pub width: Option<f64>,

    /// Region height as a fraction of the frame height (default 1).
    #[serde(default)]
    pub height: Option<f64>,

    /// Left edge as a fraction of the frame width (default 0).
    #[serde(default)]
    pub offset_x: Option<f64>,

    /// Top edge as a fraction of the frame height (default 0).
    #[serde(default)]
    pub offset_y: Option<f64>,

    /// Stream group; unset regions get a fresh group.
    #[serde(default)]
    pub group: Option<u32>,

    /// Codec (default H.265).
    #[serde(default)]
    pub codec: Option<VideoCodec>,

    /// Backend-specific device selector (CUDA index, DRM render node).
    #[serde(default)]
    pub device: Option<String>,

    /// Extra encoder element properties.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl EncoderConfig {
    /// Full-frame region on `encoder` with every other field unset.
    #[must_use]
    pub fn full_frame(encoder: EncoderBackend) -> Self {
        Self {
            encoder,
            width: None,
            height: None,
            offset_x: None,
            offset_y: None,
            group: None,
            codec: None,
            device: None,
            options: BTreeMap::new(),
        }
    }
}

/// Stream timing and source geometry used by the headless server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Target frames per second.
    pub fps: f32,

    /// Source frame width in pixels (both eyes side by side).
    pub width: u32,

    /// Source frame height in pixels.
    pub height: u32,

    /// Frames between forced keyframes. `0` only forces the first one.
    pub keyframe_interval: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fps: 90.0,
            width: 3664,
            height: 1920,
            keyframe_interval: 0,
        }
    }
}
