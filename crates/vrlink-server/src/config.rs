use std::path::Path;

use anyhow::{bail, Result};

// Re-export config types from the shared crate.
pub use vrlink_config::ServerConfig;

/// Stream values set on the command line.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Overrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f32>,
    pub keyframe_interval: Option<u32>,
}

/// Load configuration from a TOML file.
///
/// If `path` is `None`, falls back to the default XDG location. A file that
/// cannot be read or parsed is logged and replaced by the defaults.
#[must_use]
pub fn load_config(path: Option<&Path>) -> ServerConfig {
    vrlink_config::load_or_default(path)
}

/// Apply CLI overrides and check the resulting stream geometry.
///
/// # Errors
///
/// Returns an error if the frame rate is not positive or the frame size is
/// zero or odd.
pub fn merge(mut cfg: ServerConfig, overrides: &Overrides) -> Result<ServerConfig> {
    if let Some(width) = overrides.width {
        cfg.stream.width = width;
    }
    if let Some(height) = overrides.height {
        cfg.stream.height = height;
    }
    if let Some(fps) = overrides.fps {
        cfg.stream.fps = fps;
    }
    if let Some(interval) = overrides.keyframe_interval {
        cfg.stream.keyframe_interval = interval;
    }

    let stream = &cfg.stream;
    if !stream.fps.is_finite() || stream.fps <= 0.0 {
        bail!("fps must be positive, got {}", stream.fps);
    }
    if stream.width == 0 || stream.height == 0 {
        bail!("frame size must be non-zero, got {}x{}", stream.width, stream.height);
    }
    if stream.width % 2 != 0 || stream.height % 2 != 0 {
        bail!("frame size must be even for 4:2:0 chroma, got {}x{}", stream.width, stream.height);
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn cli_values_win_over_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[stream]\nfps = 72.0\nwidth = 2048\nheight = 1024").expect("write");

        let cfg = merge(
            load_config(Some(file.path())),
            &Overrides {
                fps: Some(120.0),
                ..Overrides::default()
            },
        )
        .expect("merge");

        assert!((cfg.stream.fps - 120.0).abs() < f32::EPSILON);
        assert_eq!((cfg.stream.width, cfg.stream.height), (2048, 1024));
    }

    #[test]
    fn rejects_zero_fps() {
        let overrides = Overrides {
            fps: Some(0.0),
            ..Overrides::default()
        };
        assert!(merge(ServerConfig::default(), &overrides).is_err());
    }

    #[test]
    fn rejects_odd_frame_size() {
        let overrides = Overrides {
            width: Some(1023),
            ..Overrides::default()
        };
        assert!(merge(ServerConfig::default(), &overrides).is_err());
    }

    #[test]
    fn defaults_pass_through() {
        let cfg = merge(ServerConfig::default(), &Overrides::default()).expect("merge");
        assert_eq!(cfg, ServerConfig::default());
    }
}
