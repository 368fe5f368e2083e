//! `appsrc (video/x-h264,avc) ! h264parse ! mp4mux ! filesink`

use std::path::{Path, PathBuf};
use std::time::Duration;

use gstreamer::prelude::*;
use gstreamer_app::AppSrc;
use timelapse_core::errors::CodecError;
use timelapse_core::FRAME_DURATION_US;
use tracing::{debug, warn};

use super::{check_bus, set_state, track_caps};
use crate::{ContainerMuxer, EncodedSample, TrackFormat};

/// Upper bound on waiting for mp4mux to write the moov atom after EOS.
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct GstContainerMuxer {
    pipeline: gstreamer::Pipeline,
    appsrc: AppSrc,
    path: PathBuf,
    track: Option<TrackFormat>,
    started: bool,
    finished: bool,
}

impl GstContainerMuxer {
    pub(super) fn new(path: &Path) -> Result<Self, CodecError> {
        let location = path
            .to_str()
            .ok_or_else(|| CodecError::Pipeline(format!("non UTF-8 path {}", path.display())))?;

        let make = |factory: &str| {
            gstreamer::ElementFactory::make(factory)
                .build()
                .map_err(|e| CodecError::Unavailable(format!("{factory}: {e}")))
        };

        let pipeline = gstreamer::Pipeline::new();
        let appsrc = AppSrc::builder()
            .name("src")
            .format(gstreamer::Format::Time)
            .is_live(false)
            .build();
        let parser = make("h264parse")?;
        let mux = make("mp4mux")?;
        let sink = make("filesink")?;
        sink.set_property("location", location);

        pipeline
            .add_many([appsrc.upcast_ref(), &parser, &mux, &sink])
            .map_err(|e| CodecError::Pipeline(format!("add elements: {e}")))?;
        gstreamer::Element::link_many([appsrc.upcast_ref(), &parser, &mux, &sink])
            .map_err(|e| CodecError::Pipeline(format!("link elements: {e}")))?;

        Ok(Self {
            pipeline,
            appsrc,
            path: path.to_path_buf(),
            track: None,
            started: false,
            finished: false,
        })
    }

    /// Send EOS and block until mp4mux has flushed the file.
    fn finalize(&self) -> Result<(), CodecError> {
        self.appsrc
            .end_of_stream()
            .map_err(|e| CodecError::Pipeline(format!("appsrc end_of_stream: {e:?}")))?;

        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| CodecError::Pipeline("pipeline has no bus".into()))?;
        let timeout = gstreamer::ClockTime::from_mseconds(FINALIZE_TIMEOUT.as_millis() as u64);
        for msg in bus.iter_timed(timeout) {
            match msg.view() {
                gstreamer::MessageView::Eos(..) => {
                    debug!("Muxer finalized {}", self.path.display());
                    return Ok(());
                }
                gstreamer::MessageView::Error(err) => {
                    return Err(CodecError::Pipeline(format!(
                        "mp4mux: {} ({})",
                        err.error(),
                        err.debug().map(|d| d.to_string()).unwrap_or_default()
                    )));
                }
                _ => {}
            }
        }
        Err(CodecError::Timeout { ms: FINALIZE_TIMEOUT.as_millis() as u64 })
    }
}

impl ContainerMuxer for GstContainerMuxer {
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize, CodecError> {
        if self.started || self.track.is_some() {
            return Err(CodecError::Pipeline("muxer takes a single track before start".into()));
        }
        self.appsrc.set_caps(Some(&track_caps(format)));
        self.track = Some(format.clone());
        Ok(0)
    }

    fn start(&mut self) -> Result<(), CodecError> {
        if self.track.is_none() {
            return Err(CodecError::Pipeline("start before add_track".into()));
        }
        set_state(&self.pipeline, gstreamer::State::Playing)?;
        self.started = true;
        Ok(())
    }

    fn write_sample(&mut self, track: usize, sample: &EncodedSample) -> Result<(), CodecError> {
        if !self.started || self.finished {
            return Err(CodecError::Pipeline("write_sample outside started state".into()));
        }
        if track != 0 {
            return Err(CodecError::InvalidSlot(track));
        }
        check_bus(&self.pipeline)?;

        let mut buffer = gstreamer::Buffer::from_slice(sample.data.clone());
        {
            let buffer = buffer
                .get_mut()
                .ok_or_else(|| CodecError::Pipeline("buffer not writable".into()))?;
            let pts = gstreamer::ClockTime::from_useconds(sample.pts_us);
            buffer.set_pts(pts);
            buffer.set_dts(pts);
            buffer.set_duration(gstreamer::ClockTime::from_useconds(FRAME_DURATION_US));
            if !sample.flags.sync {
                buffer.set_flags(gstreamer::BufferFlags::DELTA_UNIT);
            }
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| CodecError::Pipeline(format!("appsrc push_buffer: {e:?}")))?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let result = if self.started { self.finalize() } else { Ok(()) };
        set_state(&self.pipeline, gstreamer::State::Null)?;
        result
    }

    fn release(&mut self) {
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            warn!("Muxer release for {}: {}", self.path.display(), e);
        }
    }
}

impl Drop for GstContainerMuxer {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}
