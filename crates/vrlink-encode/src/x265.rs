//! Software H.265 encoder.
//!
//! x265 runs slice-parallel and the region buffer lives in host memory.
//! Output arrives on a `GStreamer` streaming thread, is split into slices
//! and restored to spatial order by the [`Reassembler`] before it reaches
//! the sink.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use vrlink_config::{ColorModel, ColorRange, EncoderBackend, VideoCodec};

use crate::backend::{EncoderState, FragmentSink, Lifecycle, VideoEncoder};
use crate::device::{DeviceBundle, MemoryLocation, TransferCommands, YuvImage};
use crate::error::EncodeError;
use crate::h265::{Fragment, SliceParser};
use crate::pipeline::{self, apply_options, make_element, set_if_present, EncoderPipeline};
use crate::reassembly::{self, FrameSummary, Reassembler, SharedReassembler};
use crate::region::RegionBuffer;
use crate::settings::EncoderSettings;

/// Upper bound on slices per frame.
pub const MAX_SLICES: u32 = 32;

/// Longest wait for a frame to come out of the compressor.
const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// CTUs match the reassembly unit so a slice address is a unit index.
fn option_string() -> String {
    format!(
        "ctu={}:slices={MAX_SLICES}:wpp=0:repeat-headers=1:aud=0:keyint=-1:range=full:\
         colorprim=bt709:colormatrix=bt709:transfer=iec61966-2-1",
        reassembly::UNIT_SIZE
    )
}

pub struct X265Encoder {
    settings: EncoderSettings,
    region: RegionBuffer,
    pipeline: EncoderPipeline,
    lifecycle: Lifecycle,
    frame_done: Receiver<FrameSummary>,
    frame_size: usize,
}

impl X265Encoder {
    /// Start an x265 session for `settings`.
    ///
    /// The codec is forced to H.265.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if `x265enc` is missing or the pipeline
    /// cannot start.
    pub fn new(
        device: &dyn DeviceBundle,
        settings: &mut EncoderSettings,
        fps: f32,
        sink: Arc<dyn FragmentSink>,
    ) -> Result<Self, EncodeError> {
        pipeline::init()?;
        if settings.codec != VideoCodec::H265 {
            tracing::warn!(codec = %settings.codec, "x265 only encodes H.265, overriding codec");
            settings.codec = VideoCodec::H265;
        }
        if let Some(device) = &settings.device {
            tracing::warn!(device, "x265 runs on the CPU, ignoring device");
        }
        settings.range = ColorRange::Full;
        settings.color_model = ColorModel::Bt709;

        let region = RegionBuffer::allocate(device, settings, MemoryLocation::HostVisible)?;
        let frame_size = usize::try_from(region.size()).map_err(|_| EncodeError::ResourceInit {
            backend: EncoderBackend::X265,
            reason: "frame does not fit in memory".into(),
        })?;

        let convert = make_element("videoconvert", "convert")?;
        let encoder = make_element("x265enc", "encoder")?;
        configure(&encoder, settings);
        let mut pipeline = EncoderPipeline::build(settings, fps, vec![convert], encoder)?;

        let total_units = reassembly::total_units(settings.video_width, settings.video_height);
        let reassembler = SharedReassembler::new(Reassembler::new(total_units, sink));
        let (done_tx, frame_done) = mpsc::sync_channel(4);
        install_output(pipeline.appsink(), SliceParser::new(total_units), reassembler, done_tx);

        pipeline.start()?;
        let mut lifecycle = Lifecycle::new(EncoderBackend::X265);
        lifecycle.ready();
        tracing::info!(
            width = settings.video_width,
            height = settings.video_height,
            total_units,
            "x265 encoder ready"
        );

        Ok(Self {
            settings: settings.clone(),
            region,
            pipeline,
            lifecycle,
            frame_done,
            frame_size,
        })
    }

    fn encode_frame(&self, key_frame: bool, pts: Duration) -> Result<(), EncodeError> {
        // Signals left over from a timed-out frame.
        while self.frame_done.try_recv().is_ok() {}

        let buffer = match self.read_frame() {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!("Cannot read region buffer, dropping frame: {e}");
                return Ok(());
            }
        };
        if key_frame {
            self.pipeline.force_keyframe();
        }
        if let Err(e) = self.pipeline.push(buffer, pts) {
            tracing::warn!(?e, "x265 rejected frame, dropping it");
            return Ok(());
        }

        match self.frame_done.recv_timeout(FRAME_TIMEOUT) {
            Ok(summary) => {
                tracing::trace!(units = summary.units_flushed, complete = summary.is_complete(), "Frame encoded");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => Err(EncodeError::Stalled {
                backend: EncoderBackend::X265,
                timeout: FRAME_TIMEOUT,
            }),
        }
    }

    fn read_frame(&self) -> Result<gst::Buffer, EncodeError> {
        let mut buffer = gst::Buffer::with_size(self.frame_size).map_err(|_| EncodeError::BufferMap)?;
        {
            let buffer = buffer.get_mut().ok_or(EncodeError::BufferMap)?;
            let mut map = buffer.map_writable().map_err(|_| EncodeError::BufferMap)?;
            self.region.buffer().read_mapped(map.as_mut_slice())?;
        }
        Ok(buffer)
    }
}

fn configure(encoder: &gst::Element, settings: &EncoderSettings) {
    let bitrate_kbps = settings.bitrate / 1000;
    set_if_present(encoder, "bitrate", &bitrate_kbps.to_string());
    set_if_present(encoder, "speed-preset", "ultrafast");
    set_if_present(encoder, "tune", "zerolatency");
    set_if_present(encoder, "option-string", &option_string());
    apply_options(encoder, &settings.options);
    tracing::debug!(bitrate_kbps, "x265 configured");
}

/// Route every access unit from the streaming thread into reassembly.
fn install_output(
    appsink: &gst_app::AppSink,
    parser: SliceParser,
    reassembler: SharedReassembler,
    done: SyncSender<FrameSummary>,
) {
    let parser = Mutex::new(parser);
    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let summary = match sample.buffer().map(|b| b.map_readable()) {
                    Some(Ok(map)) => deliver(&parser, &reassembler, &Bytes::copy_from_slice(map.as_slice())),
                    _ => {
                        tracing::warn!("Cannot read encoded sample, dropping frame");
                        reassembler.lock().finish_frame()
                    }
                };
                let _ = done.try_send(summary);
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );
}

/// Split one access unit and push its fragments through reassembly.
///
/// Parameter sets are forwarded even when the slices are dropped, so the
/// decoder keeps its state.
fn deliver(parser: &Mutex<SliceParser>, reassembler: &SharedReassembler, au: &Bytes) -> FrameSummary {
    let parsed = parser
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .parse_access_unit(au);

    let mut state = reassembler.lock();
    for fragment in parsed.fragments {
        match fragment {
            Fragment::Header(payload) => state.push_header(payload),
            Fragment::Slice {
                first_unit,
                last_unit,
                payload,
            } => state.push(first_unit, last_unit, payload),
        }
    }
    if let Some(e) = parsed.error {
        tracing::warn!("Dropping slices of malformed access unit: {e}");
    }
    state.finish_frame()
}

impl VideoEncoder for X265Encoder {
    fn backend(&self) -> EncoderBackend {
        EncoderBackend::X265
    }

    fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    fn present_image(&mut self, source: &YuvImage, commands: &mut dyn TransferCommands) {
        self.region.record_copies(source, commands);
    }

    fn encode(&mut self, key_frame: bool, pts: Duration) -> Result<(), EncodeError> {
        self.lifecycle.begin_frame()?;
        let result = self.encode_frame(key_frame, pts);
        self.lifecycle.end_frame();
        result
    }

    fn state(&self) -> EncoderState {
        self.lifecycle.state()
    }

    fn shutdown(&mut self) {
        if self.lifecycle.destroy() {
            self.pipeline.stop();
        }
    }
}

impl Drop for X265Encoder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h265::tests::{nal, pps, slice};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(usize, bool)>>,
    }

    impl FragmentSink for Recorder {
        fn send(&self, data: Bytes, is_last: bool) {
            self.calls.lock().expect("lock").push((data.len(), is_last));
        }
    }

    fn setup() -> (Arc<Recorder>, Mutex<SliceParser>, SharedReassembler) {
        let sink = Arc::new(Recorder::default());
        let parser = Mutex::new(SliceParser::new(120));
        let reassembler = SharedReassembler::new(Reassembler::new(120, sink.clone()));
        (sink, parser, reassembler)
    }

    #[test]
    fn out_of_order_slices_reach_sink_in_unit_order() {
        let header = pps(0, false);
        let s64 = slice(1, 64, None);
        let s0 = slice(1, 0, None);
        let s100 = slice(1, 100, None);
        let au: Vec<u8> = [header.clone(), s64.clone(), s0.clone(), s100.clone()].concat();

        let (sink, parser, reassembler) = setup();
        let summary = deliver(&parser, &reassembler, &Bytes::from(au));
        assert!(summary.is_complete());
        assert_eq!(
            *sink.calls.lock().expect("lock"),
            vec![
                (header.len(), false),
                (s0.len(), false),
                (s64.len(), false),
                (s100.len(), true),
            ]
        );
    }

    #[test]
    fn consecutive_frames_restart_at_unit_zero() {
        let (sink, parser, reassembler) = setup();
        let first: Vec<u8> = [pps(0, false), slice(19, 0, None), slice(19, 60, None)].concat();
        assert!(deliver(&parser, &reassembler, &Bytes::from(first)).is_complete());

        let second: Vec<u8> = [slice(1, 60, None), slice(1, 0, None)].concat();
        assert!(deliver(&parser, &reassembler, &Bytes::from(second)).is_complete());

        let lasts: Vec<bool> = sink.calls.lock().expect("lock").iter().map(|c| c.1).collect();
        assert_eq!(lasts, vec![false, false, true, false, true]);
    }

    #[test]
    fn slice_without_parameter_set_is_dropped() {
        let (sink, parser, reassembler) = setup();
        let summary = deliver(&parser, &reassembler, &Bytes::from(slice(1, 0, None)));
        assert!(!summary.is_complete());
        assert!(sink.calls.lock().expect("lock").is_empty());
    }

    #[test]
    fn header_only_unit_forwards_parameter_sets() {
        let vps = nal(32, &[0x0c, 0x80]);
        let header = pps(0, false);
        let au: Vec<u8> = [vps.clone(), header.clone()].concat();

        let (sink, parser, reassembler) = setup();
        let summary = deliver(&parser, &reassembler, &Bytes::from(au));
        assert!(!summary.is_complete());
        assert_eq!(
            *sink.calls.lock().expect("lock"),
            vec![(vps.len(), false), (header.len(), false)]
        );

        // The PPS from the header-only unit still applies.
        let next = deliver(&parser, &reassembler, &Bytes::from(slice(1, 0, None)));
        assert!(next.is_complete());
    }

    #[test]
    fn broken_slice_still_forwards_headers() {
        let header = pps(0, false);
        let au: Vec<u8> = [header.clone(), slice(1, 0, None), slice(1, 127, None)].concat();

        let (sink, parser, reassembler) = setup();
        let summary = deliver(&parser, &reassembler, &Bytes::from(au));
        assert!(!summary.is_complete());
        assert_eq!(*sink.calls.lock().expect("lock"), vec![(header.len(), false)]);
    }

    #[test]
    fn option_string_pins_ctu_and_slices() {
        let opts = option_string();
        assert!(opts.starts_with("ctu=16:slices=32:"));
        assert!(opts.contains("repeat-headers=1"));
        assert!(opts.contains("range=full"));
        assert!(opts.contains("keyint=-1"));
    }
}
