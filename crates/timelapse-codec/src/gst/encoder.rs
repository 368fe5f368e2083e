//! `appsrc (NV12) ! <encoder> ! h264parse ! video/x-h264,avc,au ! appsink`
//!
//! Input slots are backed by appsrc queue capacity; output slots by samples
//! pulled from the appsink. The first sample after a caps change is held back
//! and reported as [`OutputEvent::FormatChanged`].

use std::collections::HashSet;
use std::time::{Duration, Instant};

use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSrc};
use gstreamer_video::{VideoFormat, VideoInfo};
use timelapse_core::errors::CodecError;
use timelapse_core::FRAME_DURATION_US;
use tracing::{debug, trace};

use super::{check_bus, element, encoded_sample, launch, set_state, track_format};
use crate::{
    EncodedSample, EncoderSettings, FrameEncoder, InputSlot, OutputBuffer, OutputEvent, OutputSlot,
    TrackFormat,
};

/// Raw frames the appsrc may queue before input slots run out.
const INPUT_QUEUE_FRAMES: u64 = 4;

const POLL_STEP: Duration = Duration::from_millis(1);

pub struct GstFrameEncoder {
    pipeline: gstreamer::Pipeline,
    appsrc: AppSrc,
    appsink: AppSink,
    element: &'static str,
    info: VideoInfo,
    format: Option<TrackFormat>,
    held: Option<gstreamer::Sample>,
    pending_input: Option<usize>,
    next_input: usize,
    next_output: usize,
    outstanding: HashSet<usize>,
    input_closed: bool,
    eos_reported: bool,
}

impl GstFrameEncoder {
    pub(super) fn new(
        settings: &EncoderSettings,
        element_name: &'static str,
        props: &str,
    ) -> Result<Self, CodecError> {
        let width = settings.resolution.width;
        let height = settings.resolution.height;
        let fps = settings.fps;

        let info = VideoInfo::builder(VideoFormat::Nv12, width, height)
            .fps(gstreamer::Fraction::new(fps as i32, 1))
            .build()
            .map_err(|e| CodecError::Pipeline(format!("video info: {e}")))?;

        let desc = format!(
            "appsrc name=src format=time is-live=false block=false \
                 caps=\"video/x-raw,format=NV12,width={width},height={height},framerate={fps}/1\" \
             ! queue \
             ! {element_name} {props} \
             ! h264parse config-interval=-1 \
             ! video/x-h264,stream-format=avc,alignment=au \
             ! appsink name=sink max-buffers=8 drop=false sync=false emit-signals=false"
        );
        let pipeline = launch(&desc)?;
        let appsrc: AppSrc = element(&pipeline, "src")?;
        let appsink: AppSink = element(&pipeline, "sink")?;
        appsrc.set_max_bytes(info.size() as u64 * INPUT_QUEUE_FRAMES);

        set_state(&pipeline, gstreamer::State::Playing)?;
        check_bus(&pipeline)?;

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            element: element_name,
            info,
            format: None,
            held: None,
            pending_input: None,
            next_input: 0,
            next_output: 0,
            outstanding: HashSet::new(),
            input_closed: false,
            eos_reported: false,
        })
    }

    /// Copy a tightly packed NV12 frame into a buffer laid out per `self.info`.
    fn frame_buffer(&self, data: &[u8], pts_us: u64) -> Result<gstreamer::Buffer, CodecError> {
        let width = self.info.width() as usize;
        let height = self.info.height() as usize;
        let chroma_rows = height.div_ceil(2);
        let chroma_row_bytes = width.div_ceil(2) * 2;
        let expected = width * height + chroma_row_bytes * chroma_rows;
        if data.len() != expected {
            return Err(CodecError::Pipeline(format!(
                "frame is {} bytes, expected {expected} for {width}×{height} NV12",
                data.len()
            )));
        }

        let mut buffer = gstreamer::Buffer::with_size(self.info.size())
            .map_err(|e| CodecError::Pipeline(format!("buffer alloc: {e}")))?;
        {
            let buffer = buffer
                .get_mut()
                .ok_or_else(|| CodecError::Pipeline("buffer not writable".into()))?;
            buffer.set_pts(gstreamer::ClockTime::from_useconds(pts_us));
            buffer.set_duration(gstreamer::ClockTime::from_useconds(FRAME_DURATION_US));
            let mut map = buffer
                .map_writable()
                .map_err(|_| CodecError::Pipeline("failed to map buffer".into()))?;
            let out = map.as_mut_slice();

            let planes = [(0, width, height), (width * height, chroma_row_bytes, chroma_rows)];
            for (plane, (src_offset, row_bytes, rows)) in planes.into_iter().enumerate() {
                let dst_offset = self.info.offset()[plane];
                let stride = self.info.stride()[plane] as usize;
                for row in 0..rows {
                    let src = src_offset + row * row_bytes;
                    let dst = dst_offset + row * stride;
                    out[dst..dst + row_bytes].copy_from_slice(&data[src..src + row_bytes]);
                }
            }
        }
        Ok(buffer)
    }

    fn ready(&mut self, sample: EncodedSample) -> OutputEvent {
        let slot = self.next_output;
        self.next_output += 1;
        self.outstanding.insert(slot);
        OutputEvent::BufferReady(OutputBuffer { slot: OutputSlot(slot), sample })
    }
}

impl FrameEncoder for GstFrameEncoder {
    fn name(&self) -> &str {
        self.element
    }

    fn dequeue_input(&mut self, timeout: Duration) -> Result<Option<InputSlot>, CodecError> {
        if self.input_closed {
            return Err(CodecError::Pipeline("input already closed".into()));
        }
        if self.pending_input.is_some() {
            return Ok(None);
        }
        let deadline = Instant::now() + timeout;
        loop {
            if self.appsrc.current_level_bytes() < self.appsrc.max_bytes() {
                let slot = self.next_input;
                self.next_input += 1;
                self.pending_input = Some(slot);
                return Ok(Some(InputSlot(slot)));
            }
            check_bus(&self.pipeline)?;
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_STEP);
        }
    }

    fn queue_input(
        &mut self,
        slot: InputSlot,
        data: &[u8],
        pts_us: u64,
        end_of_stream: bool,
    ) -> Result<(), CodecError> {
        if self.pending_input != Some(slot.0) {
            return Err(CodecError::InvalidSlot(slot.0));
        }
        self.pending_input = None;

        if !data.is_empty() {
            let buffer = self.frame_buffer(data, pts_us)?;
            self.appsrc
                .push_buffer(buffer)
                .map_err(|e| CodecError::Pipeline(format!("appsrc push_buffer: {e:?}")))?;
            trace!("Queued frame pts={}us", pts_us);
        }
        if end_of_stream {
            self.appsrc
                .end_of_stream()
                .map_err(|e| CodecError::Pipeline(format!("appsrc end_of_stream: {e:?}")))?;
            self.input_closed = true;
            debug!("{}: input closed", self.element);
        }
        Ok(())
    }

    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent, CodecError> {
        if self.eos_reported {
            return Ok(OutputEvent::TryAgain);
        }
        if let Some(sample) = self.held.take() {
            let sample = encoded_sample(&sample)?;
            return Ok(self.ready(sample));
        }

        let wait = gstreamer::ClockTime::from_useconds(timeout.as_micros() as u64);
        match self.appsink.try_pull_sample(wait) {
            Some(sample) => {
                if let Some(caps) = sample.caps() {
                    let format = track_format(caps)?;
                    if self.format.as_ref() != Some(&format) {
                        debug!("{}: output format {}", self.element, format);
                        self.format = Some(format.clone());
                        self.held = Some(sample);
                        return Ok(OutputEvent::FormatChanged(format));
                    }
                }
                let sample = encoded_sample(&sample)?;
                Ok(self.ready(sample))
            }
            None => {
                check_bus(&self.pipeline)?;
                if self.appsink.is_eos() {
                    self.eos_reported = true;
                    return Ok(self.ready(EncodedSample::end_of_stream()));
                }
                Ok(OutputEvent::TryAgain)
            }
        }
    }

    fn release_output(&mut self, slot: OutputSlot) -> Result<(), CodecError> {
        if self.outstanding.remove(&slot.0) {
            Ok(())
        } else {
            Err(CodecError::InvalidSlot(slot.0))
        }
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        set_state(&self.pipeline, gstreamer::State::Null)
    }

    fn release(&mut self) {
        self.held = None;
        self.outstanding.clear();
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

impl Drop for GstFrameEncoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}
