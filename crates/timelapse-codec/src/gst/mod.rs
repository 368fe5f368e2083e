//! GStreamer backend: H.264 encode, MP4 mux and MP4 demux pipelines.
//!
//! # Encoder priority (highest to lowest)
//!
//! | Encoder        | Backend   | Notes |
//! |----------------|-----------|-------|
//! | `vaapih264enc` | VA-API HW | Intel / AMD iGPU |
//! | `nvh264enc`    | NVENC HW  | NVIDIA GPU |
//! | `x264enc`      | Software  | CPU fallback |
//!
//! B-frames are disabled on every candidate so PTS order equals decode order.

mod encoder;
mod extractor;
mod muxer;

pub use encoder::GstFrameEncoder;
pub use extractor::GstSampleExtractor;
pub use muxer::GstContainerMuxer;

use std::path::Path;

use bytes::Bytes;
use gstreamer::prelude::*;
use timelapse_core::errors::CodecError;
use timelapse_core::{Resolution, OUTPUT_FPS};
use tracing::{debug, info};

use crate::{
    ContainerMuxer, EncodedSample, EncoderSettings, FrameEncoder, MediaBackend, SampleExtractor,
    SampleFlags, TrackFormat, H264_MIME,
};

/// Elements every pipeline of this backend depends on.
const REQUIRED_ELEMENTS: &[&str] =
    &["appsrc", "appsink", "h264parse", "mp4mux", "qtdemux", "filesrc", "filesink"];

// ── Encoder selection ─────────────────────────────────────────────────────────

/// Installed H.264 encoders in priority order, each paired with the property
/// string that applies `settings` to it.
fn encoder_candidates(settings: &EncoderSettings) -> Vec<(&'static str, String)> {
    let gop = settings.gop_frames();
    let kbps = settings.bitrate_kbps();
    let candidates = [
        ("vaapih264enc", format!("rate-control=cbr max-bframes=0 keyframe-period={gop} bitrate={kbps}")),
        ("nvh264enc", format!("rc-mode=cbr bframes=0 gop-size={gop} bitrate={kbps}")),
        ("x264enc", format!("speed-preset=veryfast bframes=0 key-int-max={gop} bitrate={kbps}")),
    ];
    candidates
        .into_iter()
        .filter(|(name, _)| gstreamer::ElementFactory::find(name).is_some())
        .collect()
}

// ── GstBackend ────────────────────────────────────────────────────────────────

/// [`MediaBackend`] on top of the system GStreamer installation.
#[derive(Debug, Clone)]
pub struct GstBackend {
    _private: (),
}

impl GstBackend {
    /// Initialise GStreamer and verify the required plugins are installed.
    pub fn new() -> Result<Self, CodecError> {
        gstreamer::init().map_err(|e| CodecError::Unavailable(format!("gstreamer init: {e}")))?;

        let missing: Vec<&str> = REQUIRED_ELEMENTS
            .iter()
            .copied()
            .filter(|name| gstreamer::ElementFactory::find(name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(CodecError::Unavailable(format!("missing elements: {}", missing.join(", "))));
        }

        let probe = EncoderSettings::for_geometry(Resolution::new(2, 2));
        if encoder_candidates(&probe).is_empty() {
            return Err(CodecError::Unavailable("no H.264 encoder installed".into()));
        }

        info!("GStreamer {} backend ready", gstreamer::version_string());
        Ok(Self { _private: () })
    }
}

impl MediaBackend for GstBackend {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn create_encoder(&self, settings: &EncoderSettings) -> Result<Box<dyn FrameEncoder>, CodecError> {
        let mut last_err = CodecError::Unavailable("no H.264 encoder installed".into());
        for (element, props) in encoder_candidates(settings) {
            match GstFrameEncoder::new(settings, element, &props) {
                Ok(encoder) => {
                    info!("H.264 encoder selected: {} ({})", element, settings.resolution);
                    return Ok(Box::new(encoder));
                }
                Err(e) => {
                    debug!("Encoder {} unusable: {}", element, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn create_muxer(&self, path: &Path) -> Result<Box<dyn ContainerMuxer>, CodecError> {
        Ok(Box::new(GstContainerMuxer::new(path)?))
    }

    fn open_extractor(&self, path: &Path) -> Result<Box<dyn SampleExtractor>, CodecError> {
        Ok(Box::new(GstSampleExtractor::open(path)?))
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

fn launch(desc: &str) -> Result<gstreamer::Pipeline, CodecError> {
    debug!("Pipeline: {}", desc);
    gstreamer::parse::launch(desc)
        .map_err(|e| CodecError::Pipeline(format!("parse: {e}")))?
        .downcast::<gstreamer::Pipeline>()
        .map_err(|_| CodecError::Pipeline("expected a Pipeline".into()))
}

fn element<T: IsA<gstreamer::Element>>(
    pipeline: &gstreamer::Pipeline,
    name: &str,
) -> Result<T, CodecError> {
    pipeline
        .by_name(name)
        .ok_or_else(|| CodecError::Pipeline(format!("element '{name}' not found")))?
        .downcast::<T>()
        .map_err(|_| CodecError::Pipeline(format!("element '{name}' has unexpected type")))
}

fn set_state(pipeline: &gstreamer::Pipeline, state: gstreamer::State) -> Result<(), CodecError> {
    pipeline
        .set_state(state)
        .map(|_| ())
        .map_err(|e| CodecError::Pipeline(format!("set_state({state:?}): {e}")))
}

/// Surface the first queued bus error, if any.
fn check_bus(pipeline: &gstreamer::Pipeline) -> Result<(), CodecError> {
    let Some(bus) = pipeline.bus() else { return Ok(()) };
    while let Some(msg) = bus.pop_filtered(&[gstreamer::MessageType::Error]) {
        if let gstreamer::MessageView::Error(err) = msg.view() {
            return Err(CodecError::Pipeline(format!(
                "{} ({})",
                err.error(),
                err.debug().map(|d| d.to_string()).unwrap_or_default()
            )));
        }
    }
    Ok(())
}

/// Build a [`TrackFormat`] from `video/x-h264` caps.
fn track_format(caps: &gstreamer::CapsRef) -> Result<TrackFormat, CodecError> {
    let s = caps
        .structure(0)
        .ok_or_else(|| CodecError::Pipeline("empty caps".into()))?;
    if s.name() != "video/x-h264" {
        return Err(CodecError::Pipeline(format!("unexpected caps {}", s.name())));
    }
    let dim = |field: &str| {
        s.get::<i32>(field)
            .map(|v| v.max(0) as u32)
            .map_err(|e| CodecError::Pipeline(format!("caps {field}: {e}")))
    };
    let fps = s
        .get::<gstreamer::Fraction>("framerate")
        .ok()
        .filter(|f| f.denom() > 0)
        .map(|f| (f.numer() / f.denom()).max(0) as u32)
        .unwrap_or(OUTPUT_FPS);
    let codec_data = s
        .get::<gstreamer::Buffer>("codec_data")
        .ok()
        .and_then(|b| b.map_readable().ok().map(|m| Bytes::copy_from_slice(m.as_slice())));

    Ok(TrackFormat {
        mime: H264_MIME.into(),
        resolution: Resolution::new(dim("width")?, dim("height")?),
        fps,
        codec_data,
    })
}

/// Caps for pushing samples of `format` into `h264parse`.
fn track_caps(format: &TrackFormat) -> gstreamer::Caps {
    let mut builder = gstreamer::Caps::builder("video/x-h264")
        .field("stream-format", "avc")
        .field("alignment", "au")
        .field("width", format.resolution.width as i32)
        .field("height", format.resolution.height as i32)
        .field("framerate", gstreamer::Fraction::new(format.fps as i32, 1));
    if let Some(data) = &format.codec_data {
        builder = builder.field("codec_data", gstreamer::Buffer::from_slice(data.clone()));
    }
    builder.build()
}

fn encoded_sample(sample: &gstreamer::Sample) -> Result<EncodedSample, CodecError> {
    let buffer = sample
        .buffer()
        .ok_or_else(|| CodecError::Pipeline("sample without buffer".into()))?;
    let map = buffer
        .map_readable()
        .map_err(|_| CodecError::Pipeline("failed to map buffer".into()))?;
    let flags = buffer.flags();
    Ok(EncodedSample {
        data: Bytes::copy_from_slice(map.as_slice()),
        pts_us: buffer.pts().or(buffer.dts()).map(|t| t.useconds()).unwrap_or(0),
        flags: SampleFlags {
            sync: !flags.contains(gstreamer::BufferFlags::DELTA_UNIT),
            codec_config: flags.contains(gstreamer::BufferFlags::HEADER),
            end_of_stream: false,
        },
    })
}
