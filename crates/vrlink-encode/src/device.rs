//! Boundary between the encoders and the GPU compositor.
//!
//! The compositor owns the device, the color-converted source image and the
//! transfer command stream. Encoders only see the traits defined here:
//!
//! - [`DeviceBundle`]: capability query and buffer allocation
//! - [`DeviceBuffer`]: a region-sized pixel buffer, exportable for zero-copy
//!   import into a hardware encode session
//! - [`TransferCommands`]: records image-to-buffer copies
//! - [`TransferQueue`]: submits recorded copies and waits for completion

use std::collections::{BTreeSet, HashMap};
use std::os::fd::OwnedFd;

use vrlink_config::{EncoderBackend, VideoCodec};

use crate::error::DeviceError;

/// PCI vendor id of NVIDIA GPUs.
pub const VENDOR_NVIDIA: u32 = 0x10DE;
/// PCI vendor id of AMD GPUs.
pub const VENDOR_AMD: u32 = 0x1002;
/// PCI vendor id of Intel GPUs.
pub const VENDOR_INTEL: u32 = 0x8086;

/// GPU vendor derived from the PCI vendor id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Other(u32),
}

impl GpuVendor {
    #[must_use]
    pub fn from_pci_id(vendor_id: u32) -> Self {
        match vendor_id {
            VENDOR_NVIDIA => Self::Nvidia,
            VENDOR_AMD => Self::Amd,
            VENDOR_INTEL => Self::Intel,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub fn pci_id(self) -> u32 {
        match self {
            Self::Nvidia => VENDOR_NVIDIA,
            Self::Amd => VENDOR_AMD,
            Self::Intel => VENDOR_INTEL,
            Self::Other(id) => id,
        }
    }

    /// Whether the vendor ships a dedicated fixed-function encoder
    /// reachable through [`EncoderBackend::Nvenc`].
    #[must_use]
    pub fn has_dedicated_encoder(self) -> bool {
        matches!(self, Self::Nvidia)
    }
}

/// Largest frame a backend accepts for a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxSize {
    pub width: u32,
    pub height: u32,
}

/// Read-only description of what the encoding device can do.
///
/// Probed once and handed to the planner, so planning itself never touches
/// hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    vendor: GpuVendor,
    available: BTreeSet<EncoderBackend>,
    max_sizes: HashMap<(EncoderBackend, VideoCodec), MaxSize>,
}

impl DeviceCapabilities {
    /// Capabilities with no encoder available.
    #[must_use]
    pub fn new(vendor: GpuVendor) -> Self {
        Self {
            vendor,
            available: BTreeSet::new(),
            max_sizes: HashMap::new(),
        }
    }

    /// Mark `backend` as usable.
    #[must_use]
    pub fn with_encoder(mut self, backend: EncoderBackend) -> Self {
        self.available.insert(backend);
        self
    }

    /// Record the maximum encode size of `backend` for `codec`.
    #[must_use]
    pub fn with_max_size(mut self, backend: EncoderBackend, codec: VideoCodec, width: u32, height: u32) -> Self {
        self.max_sizes.insert((backend, codec), MaxSize { width, height });
        self
    }

    #[must_use]
    pub fn vendor(&self) -> GpuVendor {
        self.vendor
    }

    #[must_use]
    pub fn is_available(&self, backend: EncoderBackend) -> bool {
        self.available.contains(&backend)
    }

    /// Maximum encode size, or `None` if the backend declares no limit.
    #[must_use]
    pub fn max_size(&self, backend: EncoderBackend, codec: VideoCodec) -> Option<MaxSize> {
        self.max_sizes.get(&(backend, codec)).copied()
    }

    /// Backend for a default single-region layout.
    ///
    /// Prefers the vendor's dedicated encoder, then the platform encoder,
    /// then software.
    #[must_use]
    pub fn preferred_backend(&self) -> Option<EncoderBackend> {
        if self.vendor.has_dedicated_encoder() && self.is_available(EncoderBackend::Nvenc) {
            Some(EncoderBackend::Nvenc)
        } else if self.is_available(EncoderBackend::Vaapi) {
            Some(EncoderBackend::Vaapi)
        } else if self.is_available(EncoderBackend::X265) {
            Some(EncoderBackend::X265)
        } else {
            None
        }
    }
}

/// Opaque id of a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Opaque id of a device image plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub u64);

/// Where a buffer's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Device-local memory, exported for a hardware encode session.
    DeviceExported,
    /// Host-visible memory read back by a software encoder.
    HostVisible,
}

/// Parameters of a buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub size: u64,
    pub location: MemoryLocation,
}

/// A device buffer owned by one encoder.
pub trait DeviceBuffer: Send {
    fn handle(&self) -> BufferHandle;

    fn size(&self) -> u64;

    /// Export the backing memory as a DMA-BUF file descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Export`] if the memory was not allocated as
    /// exportable or the driver refuses.
    fn export_dmabuf(&self) -> Result<OwnedFd, DeviceError>;

    /// Copy the current contents of a host-visible buffer into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotMapped`] for device-local buffers.
    fn read_mapped(&self, dst: &mut [u8]) -> Result<(), DeviceError>;
}

/// Device handles shared by every encoder on one GPU.
pub trait DeviceBundle: Send + Sync {
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Allocate a buffer usable as a copy destination.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] if the allocation cannot be satisfied.
    fn allocate_buffer(&self, descriptor: &BufferDescriptor) -> Result<Box<dyn DeviceBuffer>, DeviceError>;
}

/// Color-converted source frame: a full-resolution luma plane (one byte
/// per texel) and a half-resolution interleaved chroma plane (two bytes
/// per texel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YuvImage {
    pub luma: ImageHandle,
    pub chroma: ImageHandle,
    pub width: u32,
    pub height: u32,
}

/// One image-to-buffer copy, in texels of the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferImageCopy {
    /// Byte offset of the first destination row.
    pub buffer_offset: u64,
    /// Destination row length in texels.
    pub buffer_row_length: u32,
    pub image_x: u32,
    pub image_y: u32,
    pub width: u32,
    pub height: u32,
}

/// Records transfer commands for later submission.
pub trait TransferCommands {
    fn copy_image_to_buffer(&mut self, src: ImageHandle, dst: BufferHandle, region: &BufferImageCopy);
}

/// Submits transfer commands. Owned by the frame dispatcher.
pub trait TransferQueue {
    type Commands: TransferCommands;

    fn begin(&self) -> Self::Commands;

    /// Execute `commands` and block until the device has finished them.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] if submission or execution fails.
    fn submit_and_wait(&self, commands: Self::Commands) -> Result<(), DeviceError>;
}
