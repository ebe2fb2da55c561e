//! CPU-side device used for headless operation and tests.
//!
//! Buffers and images live in host memory, transfer commands are executed
//! at submit time. Buffers cannot be exported, so only the software encoder
//! runs on this device.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::device::{
    BufferDescriptor, BufferHandle, BufferImageCopy, DeviceBuffer, DeviceBundle,
    DeviceCapabilities, ImageHandle, MemoryLocation, TransferCommands, TransferQueue, YuvImage,
};
use crate::error::DeviceError;

type SharedBytes = Arc<Mutex<Vec<u8>>>;

struct HostImage {
    width: u32,
    height: u32,
    texel_size: u32,
    data: Vec<u8>,
}

#[derive(Default)]
struct Registry {
    buffers: HashMap<u64, SharedBytes>,
    images: HashMap<u64, HostImage>,
}

/// Lock a host mutex, recovering the data if a writer panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| {
        tracing::warn!("host device: mutex was poisoned, recovering");
        e.into_inner()
    })
}

/// Host-memory implementation of the device traits.
pub struct HostDevice {
    capabilities: DeviceCapabilities,
    /// Buffers unregister themselves on drop through a weak reference.
    registry: Arc<Mutex<Registry>>,
    next_id: AtomicU64,
}

impl HostDevice {
    #[must_use]
    pub fn new(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            registry: Arc::new(Mutex::new(Registry::default())),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create an NV12-style source image pair filled with `luma` and
    /// interleaved `chroma` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::CopyOutOfBounds`] if the plane sizes do not
    /// match `width` x `height`.
    pub fn create_yuv_image(
        &self,
        width: u32,
        height: u32,
        luma: Vec<u8>,
        chroma: Vec<u8>,
    ) -> Result<YuvImage, DeviceError> {
        let luma_len = width as usize * height as usize;
        let chroma_len = (width / 2) as usize * (height / 2) as usize * 2;
        if luma.len() != luma_len || chroma.len() != chroma_len {
            return Err(DeviceError::CopyOutOfBounds(format!(
                "planes are {}+{} bytes, {width}x{height} needs {luma_len}+{chroma_len}",
                luma.len(),
                chroma.len()
            )));
        }

        let luma_id = self.next_id();
        let chroma_id = self.next_id();
        let mut registry = lock(&self.registry);
        registry.images.insert(
            luma_id,
            HostImage {
                width,
                height,
                texel_size: 1,
                data: luma,
            },
        );
        registry.images.insert(
            chroma_id,
            HostImage {
                width: width / 2,
                height: height / 2,
                texel_size: 2,
                data: chroma,
            },
        );

        Ok(YuvImage {
            luma: ImageHandle(luma_id),
            chroma: ImageHandle(chroma_id),
            width,
            height,
        })
    }

    /// Replace the contents of an existing image plane.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] if the handle is unknown or the size differs.
    pub fn write_image(&self, image: ImageHandle, data: &[u8]) -> Result<(), DeviceError> {
        let mut registry = lock(&self.registry);
        let target = registry
            .images
            .get_mut(&image.0)
            .ok_or(DeviceError::UnknownHandle { kind: "image", id: image.0 })?;
        if target.data.len() != data.len() {
            return Err(DeviceError::CopyOutOfBounds(format!(
                "image {} holds {} bytes, got {}",
                image.0,
                target.data.len(),
                data.len()
            )));
        }
        target.data.copy_from_slice(data);
        Ok(())
    }

    fn execute(&self, copy: &RecordedCopy) -> Result<(), DeviceError> {
        let registry = lock(&self.registry);
        let image = registry
            .images
            .get(&copy.src.0)
            .ok_or(DeviceError::UnknownHandle { kind: "image", id: copy.src.0 })?;
        let buffer = registry
            .buffers
            .get(&copy.dst.0)
            .ok_or(DeviceError::UnknownHandle { kind: "buffer", id: copy.dst.0 })?;

        let r = &copy.region;
        if r.image_x + r.width > image.width || r.image_y + r.height > image.height {
            return Err(DeviceError::CopyOutOfBounds(format!(
                "{}x{} at ({}, {}) exceeds {}x{} image",
                r.width, r.height, r.image_x, r.image_y, image.width, image.height
            )));
        }
        if r.width > r.buffer_row_length {
            return Err(DeviceError::CopyOutOfBounds(format!(
                "row of {} texels exceeds buffer row length {}",
                r.width, r.buffer_row_length
            )));
        }

        let ts = image.texel_size as usize;
        let row_bytes = r.width as usize * ts;
        let mut dst = lock(buffer);
        for row in 0..r.height as usize {
            let src_start = ((r.image_y as usize + row) * image.width as usize + r.image_x as usize) * ts;
            let dst_start = usize::try_from(r.buffer_offset)
                .map_err(|_| DeviceError::CopyOutOfBounds("buffer offset overflow".into()))?
                + row * r.buffer_row_length as usize * ts;
            let end = dst_start + row_bytes;
            if end > dst.len() {
                return Err(DeviceError::CopyOutOfBounds(format!(
                    "row {row} ends at byte {end}, buffer holds {}",
                    dst.len()
                )));
            }
            dst[dst_start..end].copy_from_slice(&image.data[src_start..src_start + row_bytes]);
        }
        Ok(())
    }
}

impl DeviceBundle for HostDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn allocate_buffer(&self, descriptor: &BufferDescriptor) -> Result<Box<dyn DeviceBuffer>, DeviceError> {
        let size = usize::try_from(descriptor.size).map_err(|_| DeviceError::Allocation {
            size: descriptor.size,
            reason: "size exceeds address space".into(),
        })?;
        let id = self.next_id();
        let bytes: SharedBytes = Arc::new(Mutex::new(vec![0; size]));
        lock(&self.registry).buffers.insert(id, Arc::clone(&bytes));
        tracing::debug!(id, size, location = ?descriptor.location, "host buffer allocated");
        Ok(Box::new(HostBuffer {
            id,
            location: descriptor.location,
            bytes,
            registry: Arc::downgrade(&self.registry),
        }))
    }
}

impl TransferQueue for HostDevice {
    type Commands = HostCommands;

    fn begin(&self) -> HostCommands {
        HostCommands::default()
    }

    fn submit_and_wait(&self, commands: HostCommands) -> Result<(), DeviceError> {
        for copy in &commands.copies {
            self.execute(copy)?;
        }
        Ok(())
    }
}

struct HostBuffer {
    id: u64,
    location: MemoryLocation,
    bytes: SharedBytes,
    registry: Weak<Mutex<Registry>>,
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).buffers.remove(&self.id);
            tracing::debug!(id = self.id, "host buffer released");
        }
    }
}

impl DeviceBuffer for HostBuffer {
    fn handle(&self) -> BufferHandle {
        BufferHandle(self.id)
    }

    fn size(&self) -> u64 {
        lock(&self.bytes).len() as u64
    }

    fn export_dmabuf(&self) -> Result<OwnedFd, DeviceError> {
        Err(DeviceError::Export("host memory has no DMA-BUF backing".into()))
    }

    fn read_mapped(&self, dst: &mut [u8]) -> Result<(), DeviceError> {
        if self.location != MemoryLocation::HostVisible {
            return Err(DeviceError::NotMapped);
        }
        let src = lock(&self.bytes);
        let n = dst.len().min(src.len());
        dst[..n].copy_from_slice(&src[..n]);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RecordedCopy {
    src: ImageHandle,
    dst: BufferHandle,
    region: BufferImageCopy,
}

/// Copies recorded for a [`HostDevice`], executed on submit.
#[derive(Debug, Default)]
pub struct HostCommands {
    copies: Vec<RecordedCopy>,
}

impl HostCommands {
    #[must_use]
    pub fn len(&self) -> usize {
        self.copies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }
}

impl TransferCommands for HostCommands {
    fn copy_image_to_buffer(&mut self, src: ImageHandle, dst: BufferHandle, region: &BufferImageCopy) {
        self.copies.push(RecordedCopy { src, dst, region: *region });
    }
}
