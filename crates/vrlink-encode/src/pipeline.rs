//! `GStreamer` plumbing shared by the encoder variants.
//!
//! Every session is one pipeline:
//! `appsrc(NV12) ! [convert] ! encoder ! parser ! appsink`
//!
//! The source caps carry the padded video geometry and full-range BT.709
//! colorimetry; the sink emits byte-stream access units.

use std::collections::BTreeMap;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use vrlink_config::{EncoderBackend, VideoCodec};

use crate::device::MaxSize;
use crate::error::EncodeError;
use crate::settings::EncoderSettings;

/// Initialize `GStreamer`. Safe to call repeatedly.
///
/// # Errors
///
/// Returns [`EncodeError::GstInit`] if the library cannot be initialized.
pub fn init() -> Result<(), EncodeError> {
    gst::init().map_err(|e| EncodeError::GstInit(e.to_string()))
}

/// Check if a `GStreamer` element factory is available.
#[must_use]
pub fn is_element_available(factory_name: &str) -> bool {
    gst::ElementFactory::find(factory_name).is_some()
}

/// Create a `GStreamer` element by factory name.
pub(crate) fn make_element(factory_name: &str, element_name: &str) -> Result<gst::Element, EncodeError> {
    gst::ElementFactory::make(factory_name)
        .name(element_name)
        .build()
        .map_err(|e| EncodeError::ElementCreate {
            name: factory_name.to_string(),
            reason: e.to_string(),
        })
}

/// Set `key` from its string form if `element` has such a property.
///
/// Returns `false` when the property does not exist, is read-only or
/// cannot hold `value`.
pub(crate) fn set_if_present(element: &gst::Element, key: &str, value: &str) -> bool {
    let Some(pspec) = element.find_property(key) else {
        return false;
    };
    if !pspec.flags().contains(glib::ParamFlags::WRITABLE) {
        tracing::warn!(key, "Encoder property is read-only");
        return false;
    }
    match glib::Value::deserialize(value, pspec.value_type()) {
        Ok(v) => {
            element.set_property_from_value(key, &v);
            true
        }
        Err(_) => {
            tracing::warn!(key, value, "Invalid value for encoder property");
            false
        }
    }
}

/// Apply user `options` as element properties, skipping unknown keys.
pub(crate) fn apply_options(element: &gst::Element, options: &BTreeMap<String, String>) {
    for (key, value) in options {
        if element.find_property(key).is_none() {
            tracing::warn!(key, value, "Encoder has no such property, option ignored");
        } else if set_if_present(element, key, value) {
            tracing::debug!(key, value, "Encoder option applied");
        }
    }
}

fn output_caps(codec: VideoCodec) -> gst::Caps {
    let media_type = match codec {
        VideoCodec::H264 => "video/x-h264",
        VideoCodec::H265 => "video/x-h265",
    };
    gst::Caps::builder(media_type)
        .field("stream-format", "byte-stream")
        .field("alignment", "au")
        .build()
}

fn parser_name(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::H264 => "h264parse",
        VideoCodec::H265 => "h265parse",
    }
}

fn framerate(fps: f32) -> gst::Fraction {
    #[allow(clippy::cast_possible_truncation)]
    let millis = (fps * 1000.0).round() as i32;
    gst::Fraction::new(millis.max(1), 1000)
}

fn to_i32(value: u32) -> Result<i32, EncodeError> {
    i32::try_from(value).map_err(|_| EncodeError::PipelineLink(format!("dimension {value} out of range")))
}

/// One running compression session.
pub struct EncoderPipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    encoder: gst::Element,
    backend: EncoderBackend,
    running: bool,
}

impl EncoderPipeline {
    /// Build `appsrc ! pre... ! encoder ! parser ! appsink` for `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if an element cannot be created or linked.
    pub fn build(
        settings: &EncoderSettings,
        fps: f32,
        pre: Vec<gst::Element>,
        encoder: gst::Element,
    ) -> Result<Self, EncodeError> {
        let pipeline = gst::Pipeline::new();

        // Colorimetry 1:3:5:1 = full range, BT.709 matrix, transfer and primaries.
        let appsrc = gst_app::AppSrc::builder()
            .name("source")
            .caps(
                &gst::Caps::builder("video/x-raw")
                    .field("format", "NV12")
                    .field("width", to_i32(settings.video_width)?)
                    .field("height", to_i32(settings.video_height)?)
                    .field("framerate", framerate(fps))
                    .field("colorimetry", "1:3:5:1")
                    .build(),
            )
            .format(gst::Format::Time)
            .is_live(true)
            .build();

        let parser = make_element(parser_name(settings.codec), "parser")?;
        set_if_present(&parser, "config-interval", "-1");

        let appsink = gst_app::AppSink::builder()
            .name("sink")
            .caps(&output_caps(settings.codec))
            .sync(false)
            .build();

        let mut chain: Vec<gst::Element> = Vec::with_capacity(pre.len() + 4);
        chain.push(appsrc.clone().upcast());
        chain.extend(pre);
        chain.push(encoder.clone());
        chain.push(parser);
        chain.push(appsink.clone().upcast());

        pipeline
            .add_many(chain.iter())
            .map_err(|e| EncodeError::PipelineLink(e.to_string()))?;
        gst::Element::link_many(chain.iter()).map_err(|e| EncodeError::PipelineLink(e.to_string()))?;

        tracing::info!(
            encoder = %settings.encoder,
            codec = %settings.codec,
            video_width = settings.video_width,
            video_height = settings.video_height,
            bitrate = settings.bitrate,
            fps,
            "GStreamer encode pipeline built"
        );

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            encoder,
            backend: settings.encoder,
            running: false,
        })
    }

    #[must_use]
    pub fn appsink(&self) -> &gst_app::AppSink {
        &self.appsink
    }

    /// Start the encoding pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::StateChange`] if the pipeline cannot transition to Playing.
    pub fn start(&mut self) -> Result<(), EncodeError> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EncodeError::StateChange(e.to_string()))?;
        self.running = true;
        tracing::info!(backend = %self.backend, "Encoder pipeline started");
        Ok(())
    }

    /// Stop the encoding pipeline.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        let _ = self.pipeline.set_state(gst::State::Null);
        self.running = false;
        tracing::info!(backend = %self.backend, "Encoder pipeline stopped");
    }

    /// Push one raw frame stamped with `pts`.
    ///
    /// # Errors
    ///
    /// Returns the flow error reported by the source.
    pub fn push(&self, mut buffer: gst::Buffer, pts: Duration) -> Result<(), gst::FlowError> {
        #[allow(clippy::cast_possible_truncation)]
        let nanos = pts.as_nanos() as u64;
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(gst::ClockTime::from_nseconds(nanos));
        }
        self.appsrc.push_buffer(buffer).map(|_| ())
    }

    /// Wait up to `timeout` for the next encoded access unit.
    #[must_use]
    pub fn pull(&self, timeout: Duration) -> Option<gst::Sample> {
        #[allow(clippy::cast_possible_truncation)]
        let millis = timeout.as_millis() as u64;
        self.appsink.try_pull_sample(gst::ClockTime::from_mseconds(millis))
    }

    /// Force the encoder to produce an IDR keyframe on the next output.
    pub fn force_keyframe(&self) {
        let event = gst_video::UpstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();
        if !self.encoder.send_event(event) {
            tracing::warn!(backend = %self.backend, "Encoder ignored keyframe request");
        } else {
            tracing::debug!(backend = %self.backend, "Forced keyframe requested");
        }
    }
}

impl Drop for EncoderPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Query the largest frame `factory_name` accepts on its sink pad.
///
/// Opens a throwaway element, reads its sink caps in the READY state and
/// tears it down again. Returns `None` if the element is missing or
/// declares no bound.
#[must_use]
pub fn query_max_size(factory_name: &str) -> Option<MaxSize> {
    let element = gst::ElementFactory::make(factory_name).build().ok()?;
    if element.set_state(gst::State::Ready).is_err() {
        tracing::debug!(factory_name, "Encoder refused READY, no size limit known");
        let _ = element.set_state(gst::State::Null);
        return None;
    }

    let caps = element.static_pad("sink").map(|pad| pad.query_caps(None));
    let _ = element.set_state(gst::State::Null);
    let caps = caps?;

    let mut max: Option<MaxSize> = None;
    for s in caps.iter() {
        let (Some(width), Some(height)) = (upper_bound(s, "width"), upper_bound(s, "height")) else {
            continue;
        };
        let candidate = MaxSize { width, height };
        max = Some(max.map_or(candidate, |m| MaxSize {
            width: m.width.max(width),
            height: m.height.max(height),
        }));
    }
    tracing::debug!(factory_name, ?max, "Encoder size limit");
    max
}

fn upper_bound(s: &gst::StructureRef, field: &str) -> Option<u32> {
    let value = if let Ok(range) = s.get::<gst::IntRange<i32>>(field) {
        range.max()
    } else {
        s.get::<i32>(field).ok()?
    };
    u32::try_from(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_matches_codec() {
        assert_eq!(parser_name(VideoCodec::H264), "h264parse");
        assert_eq!(parser_name(VideoCodec::H265), "h265parse");
    }

    #[test]
    fn framerate_keeps_fractional_rates() {
        assert_eq!(framerate(90.0), gst::Fraction::new(90_000, 1000));
        assert_eq!(framerate(72.5), gst::Fraction::new(72_500, 1000));
        assert_eq!(framerate(0.0), gst::Fraction::new(1, 1000));
    }

    #[test]
    fn output_caps_are_byte_stream_access_units() {
        init().expect("gst init");
        let caps = output_caps(VideoCodec::H265);
        let s = caps.structure(0).expect("structure");
        assert_eq!(s.name().as_str(), "video/x-h265");
        assert_eq!(s.get::<&str>("stream-format").ok(), Some("byte-stream"));
        assert_eq!(s.get::<&str>("alignment").ok(), Some("au"));
    }
}
