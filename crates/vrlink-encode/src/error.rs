use std::time::Duration;

use vrlink_config::EncoderBackend;

use crate::backend::EncoderState;

/// Errors reported by the device collaborator.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("buffer allocation of {size} bytes failed: {reason}")]
    Allocation { size: u64, reason: String },

    #[error("buffer memory cannot be exported: {0}")]
    Export(String),

    #[error("buffer is not host visible")]
    NotMapped,

    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },

    #[error("copy out of bounds: {0}")]
    CopyOutOfBounds(String),
}

/// Malformed compressor output. The slices of the access unit are dropped.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BitstreamError {
    #[error("NAL unit truncated")]
    Truncated,

    #[error("exp-Golomb code too long")]
    InvalidCode,

    #[error("slice refers to unknown PPS {0}")]
    UnknownPps(u32),

    #[error("slice address {address} outside frame of {total} units")]
    AddressOutOfRange { address: u32, total: u32 },

    #[error("access unit contains no slice")]
    NoSlice,
}

/// Errors that abort encoder setup or surface a fatal session condition.
///
/// Per-frame failures never appear here; they are logged and the frame is
/// dropped.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("no usable encoder backend for this GPU (vendor {vendor_id:#06x})")]
    NoUsableEncoder { vendor_id: u32 },

    #[error("failed to initialise {backend} encoder: {reason}")]
    ResourceInit {
        backend: EncoderBackend,
        reason: String,
    },

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("GStreamer initialization failed: {0}")]
    GstInit(String),

    #[error("failed to create GStreamer element '{name}': {reason}")]
    ElementCreate { name: String, reason: String },

    #[error("failed to link encoder pipeline: {0}")]
    PipelineLink(String),

    #[error("pipeline state change failed: {0}")]
    StateChange(String),

    #[error("{backend} encoder produced no output within {timeout:?}")]
    Stalled {
        backend: EncoderBackend,
        timeout: Duration,
    },

    #[error("{backend} encoder is {state:?}, cannot encode")]
    InvalidState {
        backend: EncoderBackend,
        state: EncoderState,
    },

    #[error("failed to map GStreamer buffer")]
    BufferMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stalled_names_backend_and_timeout() {
        let err = EncodeError::Stalled {
            backend: EncoderBackend::Nvenc,
            timeout: Duration::from_millis(500),
        };
        let msg = err.to_string();
        assert!(msg.contains("NVENC"));
        assert!(msg.contains("500ms"));
    }

    #[test]
    fn device_error_converts() {
        let err = EncodeError::from(DeviceError::NotMapped);
        assert!(matches!(err, EncodeError::Device(DeviceError::NotMapped)));
        assert!(err.to_string().contains("not host visible"));
    }

    #[test]
    fn no_usable_encoder_shows_vendor() {
        let err = EncodeError::NoUsableEncoder { vendor_id: 0x10de };
        assert!(err.to_string().contains("0x10de"));
    }
}
