//! Settings planner: turns the user encoder layout into concrete regions.
//!
//! Planning is pure. Every hardware limit it needs comes in through
//! [`DeviceCapabilities`], probed once before the planner runs.

use std::collections::BTreeMap;

use vrlink_config::{ColorModel, ColorRange, EncoderBackend, EncoderConfig, UserConfiguration, VideoCodec};

use crate::device::DeviceCapabilities;
use crate::error::EncodeError;

/// Total bitrate in bits per second when the configuration sets none.
pub const DEFAULT_BITRATE: u64 = 50_000_000;

/// Horizontal and vertical scale when the configuration sets none.
pub const DEFAULT_SCALE: [f64; 2] = [0.8, 0.8];

/// Fully resolved settings for one encoder region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub encoder: EncoderBackend,
    /// Visible region size in pixels (even).
    pub width: u32,
    pub height: u32,
    /// Region position in the scaled frame (even).
    pub offset_x: u32,
    pub offset_y: u32,
    /// Region size rounded up to the backend alignment.
    pub video_width: u32,
    pub video_height: u32,
    pub codec: VideoCodec,
    /// Bits per second.
    pub bitrate: u64,
    pub group: u32,
    /// Written back by the backend at construction.
    pub range: ColorRange,
    pub color_model: ColorModel,
    pub device: Option<String>,
    pub options: BTreeMap<String, String>,
}

/// Result of [`plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderPlan {
    /// One entry per region, in configuration order.
    pub encoders: Vec<EncoderSettings>,
    /// Scaled frame size every region is cut from.
    pub width: u32,
    pub height: u32,
}

/// Resolve the encoder layout for a `frame_width` x `frame_height` frame.
///
/// `config` of `None` (or one without encoders) selects a single
/// full-frame region on the best backend in `caps`.
///
/// # Errors
///
/// Returns [`EncodeError::NoUsableEncoder`] when defaults are needed and
/// the device offers no backend at all.
pub fn plan(
    caps: &DeviceCapabilities,
    frame_width: u32,
    frame_height: u32,
    config: Option<&UserConfiguration>,
) -> Result<EncoderPlan, EncodeError> {
    let default_config = UserConfiguration::default();
    let config = config.unwrap_or(&default_config);

    let encoders = if config.encoders.is_empty() {
        default_encoders(caps)?
    } else {
        for encoder in &config.encoders {
            if !caps.is_available(encoder.encoder) {
                tracing::warn!(
                    encoder = %encoder.encoder,
                    "Configured encoder is not reported available on this device"
                );
            }
        }
        config.encoders.clone()
    };

    let bitrate = config.bitrate.unwrap_or(DEFAULT_BITRATE);
    let mut scale = config.scale.map_or(DEFAULT_SCALE, |s| s.factors());
    let mut reduced = [false; 2];
    for encoder in &encoders {
        let [width, height] = check_scale(caps, encoder, frame_width, frame_height, &mut scale);
        reduced[0] |= width;
        reduced[1] |= height;
    }

    // Only a reduced axis needs rounding kept below the encoder limit.
    let (limit_width, limit_height) = frame_limits(caps, &encoders);
    let width = scale_dimension(frame_width, scale[0], limit_width.filter(|_| reduced[0]));
    let height = scale_dimension(frame_height, scale[1], limit_height.filter(|_| reduced[1]));

    let mut resolved = Vec::with_capacity(encoders.len());
    let mut next_group = 0u32;
    for encoder in encoders {
        let settings = resolve(encoder, width, height, next_group);
        next_group = next_group.max(settings.group.saturating_add(1));
        resolved.push(settings);
    }
    split_bitrate(&mut resolved, bitrate);

    Ok(EncoderPlan {
        encoders: resolved,
        width,
        height,
    })
}

/// Log the planned layout, one block per group.
pub fn log_layout(encoders: &[EncoderSettings]) {
    let mut group = None;
    for e in encoders {
        if group != Some(e.group) {
            group = Some(e.group);
            tracing::info!(group = e.group, "Encoder group");
        }
        tracing::info!(
            encoder = %e.encoder,
            codec = %e.codec,
            size = %format!("{}x{}", e.width, e.height),
            offset = %format!("{}x{}", e.offset_x, e.offset_y),
            bitrate_mbps = e.bitrate / 1_000_000,
            "  region"
        );
    }
}

fn default_encoders(caps: &DeviceCapabilities) -> Result<Vec<EncoderConfig>, EncodeError> {
    let Some(backend) = caps.preferred_backend() else {
        tracing::error!(vendor = ?caps.vendor(), "No suitable encoder available");
        return Err(EncodeError::NoUsableEncoder {
            vendor_id: caps.vendor().pci_id(),
        });
    };
    if caps.vendor().has_dedicated_encoder() && backend != EncoderBackend::Nvenc {
        tracing::warn!(%backend, "Dedicated GPU encoder not available, falling back");
    }
    Ok(vec![EncoderConfig::full_frame(backend)])
}

/// Shrink `scale` so this region fits the backend's maximum encode size.
fn check_scale(
    caps: &DeviceCapabilities,
    encoder: &EncoderConfig,
    frame_width: u32,
    frame_height: u32,
    scale: &mut [f64; 2],
) -> [bool; 2] {
    let mut reduced = [false; 2];
    let codec = encoder.codec.unwrap_or_default();
    let Some(max) = caps.max_size(encoder.encoder, codec) else {
        return reduced;
    };

    let width = (encoder.width.unwrap_or(1.0) * f64::from(frame_width)).ceil();
    if width > 0.0 && width * scale[0] > f64::from(max.width) {
        scale[0] = f64::from(max.width.saturating_sub(1)) / width;
        reduced[0] = true;
        tracing::warn!(
            encoder = %encoder.encoder,
            max_width = max.width,
            scale = scale[0],
            "Image is too wide for encoder, reducing scale"
        );
    }

    let height = (encoder.height.unwrap_or(1.0) * f64::from(frame_height)).ceil();
    if height > 0.0 && height * scale[1] > f64::from(max.height) {
        scale[1] = f64::from(max.height.saturating_sub(1)) / height;
        reduced[1] = true;
        tracing::warn!(
            encoder = %encoder.encoder,
            max_height = max.height,
            scale = scale[1],
            "Image is too tall for encoder, reducing scale"
        );
    }
    reduced
}

/// Largest scaled frame size that keeps every limited region strictly
/// below its backend's maximum.
fn frame_limits(caps: &DeviceCapabilities, encoders: &[EncoderConfig]) -> (Option<u32>, Option<u32>) {
    let mut limit_width: Option<u32> = None;
    let mut limit_height: Option<u32> = None;
    for encoder in encoders {
        let Some(max) = caps.max_size(encoder.encoder, encoder.codec.unwrap_or_default()) else {
            continue;
        };
        if let Some(limit) = axis_limit(encoder.width.unwrap_or(1.0), max.width) {
            limit_width = Some(limit_width.map_or(limit, |l| l.min(limit)));
        }
        if let Some(limit) = axis_limit(encoder.height.unwrap_or(1.0), max.height) {
            limit_height = Some(limit_height.map_or(limit, |l| l.min(limit)));
        }
    }
    (limit_width, limit_height)
}

fn axis_limit(fraction: f64, max: u32) -> Option<u32> {
    if fraction <= 0.0 {
        return None;
    }
    let limit = (f64::from(max.saturating_sub(1)) / fraction).floor();
    if limit >= f64::from(u32::MAX) {
        None
    } else {
        // Non-negative and below u32::MAX.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let limit = limit as u32;
        Some(limit)
    }
}

/// Scale one frame axis, round up to even and stay within `limit`.
fn scale_dimension(dimension: u32, factor: f64, limit: Option<u32>) -> u32 {
    // The cap is even, so rounding up cannot overflow.
    let scaled = (f64::from(dimension) * factor).min(f64::from(u32::MAX - 1));
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let mut value = scaled as u32;
    value += value % 2;
    if let Some(limit) = limit {
        if value > limit {
            let clamped = limit - limit % 2;
            tracing::warn!(scaled = value, clamped, "Scaled frame hits encoder limit, clamping");
            value = clamped;
        }
    }
    value
}

/// Fraction of `extent`, rounded up to a whole pixel.
fn fraction_of(fraction: f64, extent: u32) -> u32 {
    let value = (fraction * f64::from(extent)).ceil();
    if value <= 0.0 {
        0
    } else if value >= f64::from(extent) {
        extent
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let v = value as u32;
        v
    }
}

/// Round up to even, then clamp to `max`.
fn make_even(value: u32, max: u32) -> u32 {
    (value + value % 2).min(max)
}

fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment).saturating_mul(alignment)
}

fn resolve(encoder: EncoderConfig, width: u32, height: u32, next_group: u32) -> EncoderSettings {
    let offset_x = make_even(fraction_of(encoder.offset_x.unwrap_or(0.0), width), width);
    let offset_y = make_even(fraction_of(encoder.offset_y.unwrap_or(0.0), height), height);
    let region_width = make_even(fraction_of(encoder.width.unwrap_or(1.0), width), width - offset_x);
    let region_height = make_even(fraction_of(encoder.height.unwrap_or(1.0), height), height - offset_y);
    let alignment = encoder.encoder.alignment();

    EncoderSettings {
        encoder: encoder.encoder,
        width: region_width,
        height: region_height,
        offset_x,
        offset_y,
        video_width: align_up(region_width, alignment),
        video_height: align_up(region_height, alignment),
        codec: encoder.codec.unwrap_or_default(),
        bitrate: 0,
        group: encoder.group.unwrap_or(next_group),
        range: ColorRange::default(),
        color_model: ColorModel::default(),
        device: encoder.device,
        options: encoder.options,
    }
}

/// Split `bitrate` proportionally to region area.
fn split_bitrate(encoders: &mut [EncoderSettings], bitrate: u64) {
    let area = |e: &EncoderSettings| u128::from(e.width) * u128::from(e.height);
    let total: u128 = encoders.iter().map(area).sum();
    let count = encoders.len() as u128;

    for encoder in encoders.iter_mut() {
        let share = if total == 0 {
            u128::from(bitrate) / count
        } else {
            area(encoder) * u128::from(bitrate) / total
        };
        // A share never exceeds the total.
        encoder.bitrate = u64::try_from(share).unwrap_or(bitrate);
    }
}
