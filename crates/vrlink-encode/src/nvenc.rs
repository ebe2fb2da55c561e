//! NVIDIA fixed-function encoder.
//!
//! One access unit per frame, emitted as a single fragment. Geometry is
//! padded to 32 pixels.

use std::sync::Arc;
use std::time::Duration;

use vrlink_config::{ColorModel, ColorRange, EncoderBackend, VideoCodec};

use crate::backend::{self, EncoderState, FragmentSink, VideoEncoder};
use crate::device::{DeviceBundle, MaxSize, TransferCommands, YuvImage};
use crate::error::EncodeError;
use crate::hardware::HardwareSession;
use crate::pipeline::{self, apply_options, make_element, set_if_present};
use crate::settings::EncoderSettings;

pub struct NvencEncoder {
    session: HardwareSession,
}

impl NvencEncoder {
    /// Open an NVENC session for `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if the element is missing or the region
    /// buffer cannot be exported and imported.
    pub fn new(
        device: &dyn DeviceBundle,
        settings: &mut EncoderSettings,
        fps: f32,
        sink: Arc<dyn FragmentSink>,
    ) -> Result<Self, EncodeError> {
        pipeline::init()?;
        settings.range = ColorRange::Full;
        settings.color_model = ColorModel::Bt709;

        let factory = backend::element_name(EncoderBackend::Nvenc, settings.codec, None);
        let encoder = make_element(&factory, "encoder")?;
        configure(&encoder, settings, fps);

        let session = HardwareSession::new(device, settings, fps, encoder, sink)?;
        tracing::info!(
            codec = %settings.codec,
            width = settings.video_width,
            height = settings.video_height,
            "NVENC encoder ready"
        );
        Ok(Self { session })
    }

    /// Largest frame NVENC accepts for `codec`.
    ///
    /// Opens a throwaway encoder only for the query.
    #[must_use]
    pub fn max_size(codec: VideoCodec) -> Option<MaxSize> {
        pipeline::init().ok()?;
        pipeline::query_max_size(&backend::element_name(EncoderBackend::Nvenc, codec, None))
    }
}

/// CBR low delay, infinite GOP, no B-frames, VBV of one frame.
fn configure(encoder: &gstreamer::Element, settings: &EncoderSettings, fps: f32) {
    let bitrate_kbps = settings.bitrate / 1000;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let vbv_kbits = (settings.bitrate as f64 / f64::from(fps.max(1.0)) / 1000.0).ceil() as u64;

    set_if_present(encoder, "bitrate", &bitrate_kbps.to_string());
    set_if_present(encoder, "rc-mode", "cbr");
    set_if_present(encoder, "preset", "low-latency-hq");
    set_if_present(encoder, "zerolatency", "true");
    set_if_present(encoder, "gop-size", "-1");
    set_if_present(encoder, "bframes", "0");
    set_if_present(encoder, "vbv-buffer-size", &vbv_kbits.max(1).to_string());
    if let Some(device) = &settings.device {
        if !set_if_present(encoder, "cuda-device-id", device) {
            tracing::warn!(device, "Encoder cannot select a CUDA device, using default");
        }
    }
    apply_options(encoder, &settings.options);

    tracing::debug!(bitrate_kbps, vbv_kbits, "NVENC configured");
}

impl VideoEncoder for NvencEncoder {
    fn backend(&self) -> EncoderBackend {
        EncoderBackend::Nvenc
    }

    fn settings(&self) -> &EncoderSettings {
        self.session.settings()
    }

    fn present_image(&mut self, source: &YuvImage, commands: &mut dyn TransferCommands) {
        self.session.present_image(source, commands);
    }

    fn encode(&mut self, key_frame: bool, pts: Duration) -> Result<(), EncodeError> {
        self.session.encode(key_frame, pts)
    }

    fn state(&self) -> EncoderState {
        self.session.state()
    }

    fn shutdown(&mut self) {
        self.session.shutdown();
    }
}
