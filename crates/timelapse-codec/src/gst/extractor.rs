//! `filesrc ! qtdemux ! h264parse ! video/x-h264,avc,au ! appsink`
//!
//! Pulls encoded access units straight from the container; nothing is decoded.

use std::path::Path;
use std::time::Duration;

use gstreamer::prelude::*;
use gstreamer_app::AppSink;
use timelapse_core::errors::CodecError;
use tracing::debug;

use super::{check_bus, element, encoded_sample, launch, set_state, track_format};
use crate::{EncodedSample, SampleExtractor, TrackFormat};

/// Per-sample wait before the demuxer is considered stalled.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GstSampleExtractor {
    pipeline: gstreamer::Pipeline,
    appsink: AppSink,
    format: Option<TrackFormat>,
    held: Option<gstreamer::Sample>,
}

impl GstSampleExtractor {
    pub(super) fn open(path: &Path) -> Result<Self, CodecError> {
        if !path.is_file() {
            return Err(CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )));
        }
        let location = path
            .to_str()
            .ok_or_else(|| CodecError::Pipeline(format!("non UTF-8 path {}", path.display())))?;

        let pipeline = launch(
            "filesrc name=src \
             ! qtdemux \
             ! h264parse \
             ! video/x-h264,stream-format=avc,alignment=au \
             ! appsink name=sink max-buffers=8 drop=false sync=false emit-signals=false",
        )?;
        let src: gstreamer::Element = element(&pipeline, "src")?;
        src.set_property("location", location);
        let appsink: AppSink = element(&pipeline, "sink")?;
        set_state(&pipeline, gstreamer::State::Playing)?;

        let mut extractor = Self { pipeline, appsink, format: None, held: None };
        if let Some(sample) = extractor.pull()? {
            if let Some(caps) = sample.caps() {
                extractor.format = Some(track_format(caps)?);
            }
            extractor.held = Some(sample);
        }
        debug!(
            "Opened {} ({})",
            path.display(),
            extractor.format.as_ref().map(ToString::to_string).unwrap_or_else(|| "no video".into())
        );
        Ok(extractor)
    }

    fn pull(&mut self) -> Result<Option<gstreamer::Sample>, CodecError> {
        let wait = gstreamer::ClockTime::from_mseconds(READ_TIMEOUT.as_millis() as u64);
        match self.appsink.try_pull_sample(wait) {
            Some(sample) => Ok(Some(sample)),
            None => {
                check_bus(&self.pipeline)?;
                if self.appsink.is_eos() {
                    Ok(None)
                } else {
                    Err(CodecError::Timeout { ms: READ_TIMEOUT.as_millis() as u64 })
                }
            }
        }
    }
}

impl SampleExtractor for GstSampleExtractor {
    fn track_format(&self) -> Option<&TrackFormat> {
        self.format.as_ref()
    }

    fn read_sample(&mut self) -> Result<Option<EncodedSample>, CodecError> {
        let sample = match self.held.take() {
            Some(sample) => Some(sample),
            None => self.pull()?,
        };
        sample.as_ref().map(encoded_sample).transpose()
    }

    fn release(&mut self) {
        self.held = None;
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

impl Drop for GstSampleExtractor {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}
