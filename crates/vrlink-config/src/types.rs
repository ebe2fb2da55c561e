use serde::{Deserialize, Serialize};

/// Encoder backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderBackend {
    /// NVIDIA fixed-function encoder (NVENC).
    Nvenc,
    /// Platform hardware-accelerated encoder (VA-API).
    Vaapi,
    /// x265 software encoder.
    X265,
}

impl EncoderBackend {
    /// Every backend, in default selection priority.
    pub const ALL: [EncoderBackend; 3] = [Self::Nvenc, Self::Vaapi, Self::X265];

    /// Alignment in pixels the padded video geometry is rounded up to.
    #[must_use]
    pub fn alignment(self) -> u32 {
        match self {
            Self::Nvenc => 32,
            Self::Vaapi | Self::X265 => 16,
        }
    }

    /// Whether the backend encodes on dedicated hardware.
    #[must_use]
    pub fn is_hardware(self) -> bool {
        matches!(self, Self::Nvenc | Self::Vaapi)
    }
}

impl std::fmt::Display for EncoderBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nvenc => write!(f, "NVENC"),
            Self::Vaapi => write!(f, "VA-API"),
            Self::X265 => write!(f, "x265 (software)"),
        }
    }
}

/// Compression standard of the produced bitstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum VideoCodec {
    #[serde(rename = "h264", alias = "avc")]
    H264,
    #[default]
    #[serde(rename = "h265", alias = "hevc")]
    H265,
}

impl VideoCodec {
    /// File extension for a raw Annex B elementary stream.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::H264 => write!(f, "H.264"),
            Self::H265 => write!(f, "H.265"),
        }
    }
}

/// YCbCr quantization range the encoder signals in its VUI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorRange {
    #[default]
    Full,
    Limited,
}

/// YCbCr conversion matrix the encoder signals in its VUI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorModel {
    #[default]
    Bt709,
    Bt601,
}
