//! Session shared by the hardware encoders.
//!
//! The region buffer is allocated as exportable device memory, exported once
//! as a DMA-BUF and imported into `GStreamer`. Every frame wraps that same
//! memory in a fresh buffer, so the encoder reads what the compositor
//! copied without a round trip through host memory.

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer_allocators as gst_allocators;
use gstreamer_allocators::prelude::*;
use gstreamer_video as gst_video;
use vrlink_config::EncoderBackend;

use crate::backend::{EncoderState, FragmentSink, Lifecycle};
use crate::device::{DeviceBundle, MemoryLocation, TransferCommands, YuvImage};
use crate::error::EncodeError;
use crate::pipeline::EncoderPipeline;
use crate::region::RegionBuffer;
use crate::settings::EncoderSettings;

/// Longest wait for one access unit before the session counts as stalled.
pub(crate) const PULL_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) struct HardwareSession {
    settings: EncoderSettings,
    region: RegionBuffer,
    memory: gst::Memory,
    pipeline: EncoderPipeline,
    lifecycle: Lifecycle,
    sink: Arc<dyn FragmentSink>,
}

impl HardwareSession {
    /// Allocate and import the region buffer, then start `encoder`.
    pub(crate) fn new(
        device: &dyn DeviceBundle,
        settings: &EncoderSettings,
        fps: f32,
        encoder: gst::Element,
        sink: Arc<dyn FragmentSink>,
    ) -> Result<Self, EncodeError> {
        let backend = settings.encoder;
        let mut lifecycle = Lifecycle::new(backend);

        let region = RegionBuffer::allocate(device, settings, MemoryLocation::DeviceExported)?;
        let fd = region
            .buffer()
            .export_dmabuf()
            .map_err(|e| EncodeError::ResourceInit {
                backend,
                reason: e.to_string(),
            })?;
        let memory = import_dmabuf(backend, fd, region.size())?;

        let mut pipeline = EncoderPipeline::build(settings, fps, Vec::new(), encoder)?;
        pipeline.start()?;
        lifecycle.ready();

        Ok(Self {
            settings: settings.clone(),
            region,
            memory,
            pipeline,
            lifecycle,
            sink,
        })
    }

    pub(crate) fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub(crate) fn state(&self) -> EncoderState {
        self.lifecycle.state()
    }

    pub(crate) fn present_image(&self, source: &YuvImage, commands: &mut dyn TransferCommands) {
        self.region.record_copies(source, commands);
    }

    pub(crate) fn encode(&mut self, key_frame: bool, pts: Duration) -> Result<(), EncodeError> {
        self.lifecycle.begin_frame()?;
        let result = self.encode_frame(key_frame, pts);
        self.lifecycle.end_frame();
        result
    }

    pub(crate) fn shutdown(&mut self) {
        if self.lifecycle.destroy() {
            self.pipeline.stop();
        }
    }

    fn encode_frame(&self, key_frame: bool, pts: Duration) -> Result<(), EncodeError> {
        let backend = self.settings.encoder;
        if key_frame {
            self.pipeline.force_keyframe();
        }

        let buffer = match self.frame_buffer() {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!(%backend, "Cannot wrap frame memory, dropping frame: {e}");
                return Ok(());
            }
        };
        if let Err(e) = self.pipeline.push(buffer, pts) {
            tracing::warn!(%backend, ?e, "Encoder rejected frame, dropping it");
            return Ok(());
        }

        let Some(sample) = self.pipeline.pull(PULL_TIMEOUT) else {
            return Err(EncodeError::Stalled {
                backend,
                timeout: PULL_TIMEOUT,
            });
        };
        let Some(buffer) = sample.buffer() else {
            tracing::warn!(%backend, "Encoded sample has no buffer, dropping frame");
            return Ok(());
        };
        let Ok(map) = buffer.map_readable() else {
            tracing::warn!(%backend, "Cannot map encoded buffer, dropping frame");
            return Ok(());
        };

        tracing::trace!(%backend, len = map.size(), key_frame, "Frame encoded");
        self.sink.send(Bytes::copy_from_slice(map.as_slice()), true);
        Ok(())
    }

    fn frame_buffer(&self) -> Result<gst::Buffer, EncodeError> {
        let width = self.settings.video_width;
        let height = self.settings.video_height;
        let stride = i32::try_from(width).map_err(|_| EncodeError::BufferMap)?;
        let chroma_offset = usize::try_from(self.region.chroma_offset()).map_err(|_| EncodeError::BufferMap)?;

        let mut buffer = gst::Buffer::new();
        {
            let buffer = buffer.get_mut().ok_or(EncodeError::BufferMap)?;
            buffer.append_memory(self.memory.clone());
            gst_video::VideoMeta::add_full(
                buffer,
                gst_video::VideoFrameFlags::empty(),
                gst_video::VideoFormat::Nv12,
                width,
                height,
                &[0, chroma_offset],
                &[stride, stride],
            )
            .map_err(|_| EncodeError::BufferMap)?;
        }
        Ok(buffer)
    }
}

impl Drop for HardwareSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn import_dmabuf(backend: EncoderBackend, fd: OwnedFd, size: u64) -> Result<gst::Memory, EncodeError> {
    let size = usize::try_from(size).map_err(|_| EncodeError::ResourceInit {
        backend,
        reason: format!("buffer of {size} bytes cannot be mapped"),
    })?;
    let allocator = gst_allocators::DmaBufAllocator::new();
    // SAFETY: `fd` is an owned DMA-BUF of at least `size` bytes, handed over
    // to the allocator which closes it with the memory.
    let memory = unsafe { allocator.alloc(fd, size) }.map_err(|e| EncodeError::ResourceInit {
        backend,
        reason: format!("DMA-BUF import failed: {e}"),
    })?;
    tracing::debug!(%backend, size, "DMA-BUF imported");
    Ok(memory)
}
