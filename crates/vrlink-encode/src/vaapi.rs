//! VA-API encoder through the `va` plugin.
//!
//! Same single-fragment structure as NVENC. `device` names a DRM render node;
//! the plugin registers one element per extra node (`varenderD129h265enc`).

use std::sync::Arc;
use std::time::Duration;

use vrlink_config::{ColorModel, ColorRange, EncoderBackend, VideoCodec};

use crate::backend::{EncoderState, FragmentSink, VideoEncoder};
use crate::device::{DeviceBundle, MaxSize, TransferCommands, YuvImage};
use crate::error::EncodeError;
use crate::hardware::HardwareSession;
use crate::pipeline::{self, apply_options, make_element, set_if_present};
use crate::settings::EncoderSettings;

/// First render node, served by the default `vah26xenc` elements.
const DEFAULT_RENDER_NODE: &str = "renderD128";

/// Element factory for `codec`, on the render node named by `device`.
#[must_use]
pub fn element_name(codec: VideoCodec, device: Option<&str>) -> String {
    let suffix = match codec {
        VideoCodec::H264 => "h264enc",
        VideoCodec::H265 => "h265enc",
    };
    let node = device.and_then(|d| d.rsplit('/').next()).filter(|n| !n.is_empty());
    match node {
        Some(node) if node != DEFAULT_RENDER_NODE => format!("va{node}{suffix}"),
        _ => format!("va{suffix}"),
    }
}

pub struct VaapiEncoder {
    session: HardwareSession,
}

impl VaapiEncoder {
    /// Open a VA-API session for `settings`.
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

        let factory = element_name(settings.codec, settings.device.as_deref());
        let encoder = make_element(&factory, "encoder")?;
        configure(&encoder, settings);

        let session = HardwareSession::new(device, settings, fps, encoder, sink)?;
        tracing::info!(
            element = factory,
            codec = %settings.codec,
            width = settings.video_width,
            height = settings.video_height,
            "VA-API encoder ready"
        );
        Ok(Self { session })
    }

    /// Largest frame the VA-API encoder on `device` accepts for `codec`.
    #[must_use]
    pub fn max_size(codec: VideoCodec, device: Option<&str>) -> Option<MaxSize> {
        pipeline::init().ok()?;
        pipeline::query_max_size(&element_name(codec, device))
    }
}

/// CBR, no B-frames, fastest target usage.
fn configure(encoder: &gstreamer::Element, settings: &EncoderSettings) {
    let bitrate_kbps = settings.bitrate / 1000;
    set_if_present(encoder, "rate-control", "cbr");
    set_if_present(encoder, "bitrate", &bitrate_kbps.to_string());
    set_if_present(encoder, "b-frames", "0");
    set_if_present(encoder, "ref-frames", "1");
    set_if_present(encoder, "target-usage", "7");
    set_if_present(encoder, "key-int-max", "1024");
    apply_options(encoder, &settings.options);
    tracing::debug!(bitrate_kbps, "VA-API configured");
}

impl VideoEncoder for VaapiEncoder {
    fn backend(&self) -> EncoderBackend {
        EncoderBackend::Vaapi
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
