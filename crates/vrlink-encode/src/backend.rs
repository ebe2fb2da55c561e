//! The encoder backend interface and its factory.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use vrlink_config::{EncoderBackend, VideoCodec};

use crate::device::{DeviceBundle, DeviceCapabilities, GpuVendor, TransferCommands, YuvImage};
use crate::error::EncodeError;
use crate::nvenc::NvencEncoder;
use crate::pipeline;
use crate::settings::EncoderSettings;
use crate::vaapi::VaapiEncoder;
use crate::x265::X265Encoder;

/// Receives compressed output.
///
/// Called zero or more times per [`VideoEncoder::encode`], possibly from a
/// compressor thread. `is_last` marks the fragment that completes a frame.
pub trait FragmentSink: Send + Sync {
    fn send(&self, data: Bytes, is_last: bool);
}

impl<F> FragmentSink for F
where
    F: Fn(Bytes, bool) + Send + Sync,
{
    fn send(&self, data: Bytes, is_last: bool) {
        self(data, is_last);
    }
}

/// Lifecycle of one backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Uninitialized,
    Ready,
    Encoding,
    Destroyed,
}

impl std::fmt::Display for EncoderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Ready => write!(f, "ready"),
            Self::Encoding => write!(f, "encoding"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// State machine shared by the backend variants.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    backend: EncoderBackend,
    state: EncoderState,
}

impl Lifecycle {
    pub(crate) fn new(backend: EncoderBackend) -> Self {
        Self {
            backend,
            state: EncoderState::Uninitialized,
        }
    }

    pub(crate) fn state(&self) -> EncoderState {
        self.state
    }

    /// Construction finished.
    pub(crate) fn ready(&mut self) {
        if self.state == EncoderState::Uninitialized {
            self.state = EncoderState::Ready;
        }
    }

    /// Enter a frame. Frames never overlap on one instance.
    pub(crate) fn begin_frame(&mut self) -> Result<(), EncodeError> {
        if self.state != EncoderState::Ready {
            return Err(EncodeError::InvalidState {
                backend: self.backend,
                state: self.state,
            });
        }
        self.state = EncoderState::Encoding;
        Ok(())
    }

    /// All output of the current frame has reached the sink.
    pub(crate) fn end_frame(&mut self) {
        if self.state == EncoderState::Encoding {
            self.state = EncoderState::Ready;
        }
    }

    /// Returns `false` if the instance was already destroyed.
    pub(crate) fn destroy(&mut self) -> bool {
        let was_live = self.state != EncoderState::Destroyed;
        self.state = EncoderState::Destroyed;
        was_live
    }
}

/// One encoder instance serving one region.
pub trait VideoEncoder: Send {
    fn backend(&self) -> EncoderBackend;

    /// Resolved settings this instance runs with.
    fn settings(&self) -> &EncoderSettings;

    /// Record the copies that fill this encoder's buffer from `source`.
    ///
    /// Only records commands; the caller submits and waits for them before
    /// calling [`encode`](Self::encode).
    fn present_image(&mut self, source: &YuvImage, commands: &mut dyn TransferCommands);

    /// Compress the populated buffer and forward the output to the sink.
    ///
    /// A failed frame is logged and dropped; it is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Stalled`] if the session produces nothing
    /// within its timeout, or [`EncodeError::InvalidState`] if the instance
    /// is not ready.
    fn encode(&mut self, key_frame: bool, pts: Duration) -> Result<(), EncodeError>;

    fn state(&self) -> EncoderState;

    /// Stop the session. Further encoding fails with
    /// [`EncodeError::InvalidState`].
    fn shutdown(&mut self);
}

/// Construct the backend named by `settings.encoder`.
///
/// The backend may rewrite `settings` (codec, color range and model).
///
/// # Errors
///
/// Returns [`EncodeError`] if the session, buffer or memory export cannot
/// be set up. Construction is not retried.
pub fn create_encoder(
    device: &dyn DeviceBundle,
    settings: &mut EncoderSettings,
    fps: f32,
    sink: Arc<dyn FragmentSink>,
) -> Result<Box<dyn VideoEncoder>, EncodeError> {
    tracing::info!(encoder = %settings.encoder, group = settings.group, "Creating encoder");
    let encoder: Box<dyn VideoEncoder> = match settings.encoder {
        EncoderBackend::Nvenc => Box::new(NvencEncoder::new(device, settings, fps, sink)?),
        EncoderBackend::Vaapi => Box::new(VaapiEncoder::new(device, settings, fps, sink)?),
        EncoderBackend::X265 => Box::new(X265Encoder::new(device, settings, fps, sink)?),
    };
    Ok(encoder)
}

/// Element factory implementing `backend` for `codec`.
pub(crate) fn element_name(backend: EncoderBackend, codec: VideoCodec, device: Option<&str>) -> String {
    match (backend, codec) {
        (EncoderBackend::Nvenc, VideoCodec::H264) => "nvh264enc".into(),
        (EncoderBackend::Nvenc, VideoCodec::H265) => "nvh265enc".into(),
        (EncoderBackend::Vaapi, codec) => crate::vaapi::element_name(codec, device),
        (EncoderBackend::X265, _) => "x265enc".into(),
    }
}

/// Maximum encode size of a hardware backend, from a throwaway session.
#[must_use]
pub fn max_size(backend: EncoderBackend, codec: VideoCodec) -> Option<crate::device::MaxSize> {
    match backend {
        EncoderBackend::Nvenc => NvencEncoder::max_size(codec),
        EncoderBackend::Vaapi => VaapiEncoder::max_size(codec, None),
        EncoderBackend::X265 => None,
    }
}

impl DeviceCapabilities {
    /// Probe which backends the installed `GStreamer` plugins provide.
    ///
    /// An initialization failure leaves every backend unavailable.
    #[must_use]
    pub fn probe(vendor_id: u32) -> Self {
        let mut caps = Self::new(GpuVendor::from_pci_id(vendor_id));
        if let Err(e) = pipeline::init() {
            tracing::warn!("Cannot probe encoders: {e}");
            return caps;
        }

        for backend in EncoderBackend::ALL {
            let h265 = element_name(backend, VideoCodec::H265, None);
            if !pipeline::is_element_available(&h265) {
                tracing::debug!(%backend, element = h265, "Encoder element not installed");
                continue;
            }
            caps = caps.with_encoder(backend);
            if backend.is_hardware() {
                for codec in [VideoCodec::H264, VideoCodec::H265] {
                    if let Some(max) = max_size(backend, codec) {
                        caps = caps.with_max_size(backend, codec, max.width, max.height);
                    }
                }
            }
            tracing::info!(%backend, "Encoder available");
        }
        caps
    }
}
