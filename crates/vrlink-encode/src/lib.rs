// Video compression core for vrlink.
//
// - settings.rs: plans encoder regions, scale and bitrate split
// - backend.rs: the VideoEncoder trait, lifecycle and factory
// - nvenc.rs / vaapi.rs / x265.rs: the three backend variants
// - reassembly.rs: restores slice order for the software encoder
// - h265.rs: access-unit splitter feeding reassembly
// - device.rs / host.rs: compositor boundary and its host-memory stand-in

pub mod backend;
pub mod device;
pub mod error;
pub mod h265;
mod hardware;
pub mod host;
pub mod nvenc;
pub mod pipeline;
pub mod reassembly;
pub mod region;
pub mod settings;
pub mod vaapi;
pub mod x265;

pub use backend::{create_encoder, max_size, EncoderState, FragmentSink, VideoEncoder};
pub use device::{
    BufferDescriptor, BufferHandle, BufferImageCopy, DeviceBuffer, DeviceBundle, DeviceCapabilities,
    GpuVendor, ImageHandle, MaxSize, MemoryLocation, TransferCommands, TransferQueue, YuvImage,
};
pub use error::{BitstreamError, DeviceError, EncodeError};
pub use host::{HostCommands, HostDevice};
pub use reassembly::{FrameSummary, Reassembler};
pub use settings::{log_layout, plan, EncoderPlan, EncoderSettings, DEFAULT_BITRATE, DEFAULT_SCALE};
