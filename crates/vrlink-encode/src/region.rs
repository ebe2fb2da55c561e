//! Region-sized NV12 buffer shared by every encoder variant.
//!
//! Layout: luma at offset 0 with a pitch of `video_width` bytes, followed
//! by interleaved chroma at `video_width * video_height` with the same byte
//! pitch (half as many two-byte texels).

use crate::device::{
    BufferDescriptor, BufferImageCopy, DeviceBuffer, DeviceBundle, MemoryLocation,
    TransferCommands, YuvImage,
};
use crate::error::EncodeError;
use crate::settings::EncoderSettings;

/// Visible rectangle of the source image assigned to one encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// NV12 buffer for one region plus the geometry needed to fill it.
pub struct RegionBuffer {
    rect: Rect,
    video_width: u32,
    video_height: u32,
    buffer: Box<dyn DeviceBuffer>,
}

impl RegionBuffer {
    /// Bytes needed for a `video_width` x `video_height` NV12 frame.
    #[must_use]
    pub fn nv12_size(video_width: u32, video_height: u32) -> u64 {
        u64::from(video_width) * u64::from(video_height) * 3 / 2
    }

    /// Allocate the buffer for `settings` on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Device`] if the allocation fails.
    pub fn allocate(
        device: &dyn DeviceBundle,
        settings: &EncoderSettings,
        location: MemoryLocation,
    ) -> Result<Self, EncodeError> {
        let size = Self::nv12_size(settings.video_width, settings.video_height);
        let buffer = device.allocate_buffer(&BufferDescriptor { size, location })?;
        tracing::debug!(
            encoder = %settings.encoder,
            size,
            video_width = settings.video_width,
            video_height = settings.video_height,
            "region buffer allocated"
        );

        Ok(Self {
            rect: Rect {
                x: settings.offset_x,
                y: settings.offset_y,
                width: settings.width,
                height: settings.height,
            },
            video_width: settings.video_width,
            video_height: settings.video_height,
            buffer,
        })
    }

    #[must_use]
    pub fn buffer(&self) -> &dyn DeviceBuffer {
        self.buffer.as_ref()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        Self::nv12_size(self.video_width, self.video_height)
    }

    /// Byte offset of the chroma plane.
    #[must_use]
    pub fn chroma_offset(&self) -> u64 {
        u64::from(self.video_width) * u64::from(self.video_height)
    }

    /// The two copies that populate this buffer from `source`.
    #[must_use]
    pub fn copy_regions(&self) -> [BufferImageCopy; 2] {
        let r = self.rect;
        [
            BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: self.video_width,
                image_x: r.x,
                image_y: r.y,
                width: r.width,
                height: r.height,
            },
            BufferImageCopy {
                buffer_offset: self.chroma_offset(),
                buffer_row_length: self.video_width / 2,
                image_x: r.x / 2,
                image_y: r.y / 2,
                width: r.width / 2,
                height: r.height / 2,
            },
        ]
    }

    /// Record the luma and chroma copies from `source` into `commands`.
    pub fn record_copies(&self, source: &YuvImage, commands: &mut dyn TransferCommands) {
        let [luma, chroma] = self.copy_regions();
        let dst = self.buffer.handle();
        commands.copy_image_to_buffer(source.luma, dst, &luma);
        commands.copy_image_to_buffer(source.chroma, dst, &chroma);
    }
}

#[cfg(test)]
mod tests {
    use vrlink_config::{EncoderBackend, VideoCodec};

    use super::*;
    use crate::device::{DeviceCapabilities, GpuVendor, TransferQueue};
    use crate::host::HostDevice;

    fn settings(offset_x: u32, offset_y: u32, width: u32, height: u32, video: (u32, u32)) -> EncoderSettings {
        EncoderSettings {
            encoder: EncoderBackend::X265,
            width,
            height,
            offset_x,
            offset_y,
            video_width: video.0,
            video_height: video.1,
            codec: VideoCodec::H265,
            bitrate: 1_000_000,
            group: 0,
            range: vrlink_config::ColorRange::Full,
            color_model: vrlink_config::ColorModel::Bt709,
            device: None,
            options: Default::default(),
        }
    }

    #[test]
    fn copy_regions_follow_nv12_layout() {
        let dev = HostDevice::new(DeviceCapabilities::new(GpuVendor::Other(0)));
        let region = RegionBuffer::allocate(
            &dev,
            &settings(64, 32, 100, 50, (112, 64)),
            MemoryLocation::HostVisible,
        )
        .expect("allocate");

        assert_eq!(region.size(), 112 * 64 * 3 / 2);
        let [luma, chroma] = region.copy_regions();
        assert_eq!(
            luma,
            BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 112,
                image_x: 64,
                image_y: 32,
                width: 100,
                height: 50,
            }
        );
        assert_eq!(
            chroma,
            BufferImageCopy {
                buffer_offset: 112 * 64,
                buffer_row_length: 56,
                image_x: 32,
                image_y: 16,
                width: 50,
                height: 25,
            }
        );
    }

    #[test]
    fn populated_buffer_holds_cropped_planes() {
        let dev = HostDevice::new(DeviceCapabilities::new(GpuVendor::Other(0)));
        // 8x4 source; luma value = column + 10 * row, chroma = 200 + texel index
        let luma: Vec<u8> = (0..4u8).flat_map(|y| (0..8u8).map(move |x| x + 10 * y)).collect();
        let chroma: Vec<u8> = (0..16u8).map(|i| 200 + i).collect();
        let image = dev.create_yuv_image(8, 4, luma, chroma).expect("image");

        // Right half of the frame, padded to 6 columns.
        let region = RegionBuffer::allocate(&dev, &settings(4, 0, 4, 4, (6, 4)), MemoryLocation::HostVisible)
            .expect("allocate");
        let mut cmds = dev.begin();
        region.record_copies(&image, &mut cmds);
        dev.submit_and_wait(cmds).expect("submit");

        let mut out = vec![0u8; usize::try_from(region.size()).expect("size")];
        region.buffer().read_mapped(&mut out).expect("read");

        assert_eq!(&out[0..4], &[4, 5, 6, 7]);
        assert_eq!(&out[6..10], &[14, 15, 16, 17]);
        assert_eq!(&out[18..22], &[34, 35, 36, 37]);
        // Padding column stays untouched.
        assert_eq!(out[4], 0);

        // Chroma plane at 6 * 4: texels 2 and 3 of each chroma row.
        let c = 24;
        assert_eq!(&out[c..c + 4], &[204, 205, 206, 207]);
        assert_eq!(&out[c + 6..c + 10], &[212, 213, 214, 215]);
    }
}
