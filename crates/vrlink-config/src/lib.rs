//! Shared configuration types for the vrlink encoder pipeline.
//!
//! - [`config`]: TOML configuration file and the user encoder layout
//! - [`types`]: backend and codec identifiers shared with `vrlink-encode`

pub mod config;
pub mod types;

pub use config::{
    load, load_or_default, ConfigError, EncoderConfig, Scale, ServerConfig, StreamConfig,
    UserConfiguration,
};
pub use types::{ColorModel, ColorRange, EncoderBackend, VideoCodec};
