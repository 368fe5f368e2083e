//! Loopback backend: a deterministic, plugin-free implementation of the codec
//! protocol.
//!
//! The "encoder" emits one sample per submitted frame carrying the frame's
//! submission index and mean luma; the "container" is a JSON document. Used
//! for tests and for dry runs on machines without GStreamer plugins.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use timelapse_core::errors::CodecError;
use tracing::debug;

use crate::{
    ContainerMuxer, EncodedSample, EncoderSettings, FrameEncoder, InputSlot, MediaBackend,
    OutputBuffer, OutputEvent, OutputSlot, SampleExtractor, SampleFlags, TrackFormat, H264_MIME,
};

/// Frames the encoder holds before `dequeue_input` reports no free slot.
pub const INPUT_SLOTS: usize = 4;

/// Codec config record advertised by the loopback encoder.
pub const LOOPBACK_CODEC_DATA: &[u8] = b"loopback-avcC";

#[derive(Debug, Clone, Default)]
pub struct LoopbackBackend;

impl MediaBackend for LoopbackBackend {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn create_encoder(&self, settings: &EncoderSettings) -> Result<Box<dyn FrameEncoder>, CodecError> {
        Ok(Box::new(LoopbackEncoder::new(*settings)))
    }

    fn create_muxer(&self, path: &Path) -> Result<Box<dyn ContainerMuxer>, CodecError> {
        Ok(Box::new(LoopbackMuxer::create(path)?))
    }

    fn open_extractor(&self, path: &Path) -> Result<Box<dyn SampleExtractor>, CodecError> {
        Ok(Box::new(LoopbackExtractor::open(path)?))
    }
}

// ── Payload ───────────────────────────────────────────────────────────────────

/// Decoded form of a loopback sample payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackPayload {
    /// Zero-based submission index within the segment.
    pub index: u32,
    /// Mean of the luma plane.
    pub mean_luma: u8,
}

impl LoopbackPayload {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let index = u32::from_le_bytes(data.get(0..4)?.try_into().ok()?);
        Some(Self { index, mean_luma: *data.get(4)? })
    }

    fn encode(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u32_le(self.index);
        buf.put_u8(self.mean_luma);
        buf.freeze()
    }
}

// ── Encoder ───────────────────────────────────────────────────────────────────

pub struct LoopbackEncoder {
    settings: EncoderSettings,
    queued: VecDeque<(LoopbackPayload, u64)>,
    format_reported: bool,
    pending_input: Option<usize>,
    next_input: usize,
    next_output: usize,
    outstanding: HashSet<usize>,
    submitted: u32,
    input_closed: bool,
    eos_reported: bool,
}

impl LoopbackEncoder {
    pub fn new(settings: EncoderSettings) -> Self {
        Self {
            settings,
            queued: VecDeque::new(),
            format_reported: false,
            pending_input: None,
            next_input: 0,
            next_output: 0,
            outstanding: HashSet::new(),
            submitted: 0,
            input_closed: false,
            eos_reported: false,
        }
    }

    fn frame_len(&self) -> usize {
        let w = self.settings.resolution.width as usize;
        let h = self.settings.resolution.height as usize;
        w * h + w.div_ceil(2) * h.div_ceil(2) * 2
    }

    fn ready(&mut self, sample: EncodedSample) -> OutputEvent {
        let slot = self.next_output;
        self.next_output += 1;
        self.outstanding.insert(slot);
        OutputEvent::BufferReady(OutputBuffer { slot: OutputSlot(slot), sample })
    }
}

impl FrameEncoder for LoopbackEncoder {
    fn name(&self) -> &str {
        "loopback"
    }

    fn dequeue_input(&mut self, _timeout: Duration) -> Result<Option<InputSlot>, CodecError> {
        if self.input_closed {
            return Err(CodecError::Pipeline("input already closed".into()));
        }
        if self.pending_input.is_some() || self.queued.len() >= INPUT_SLOTS {
            return Ok(None);
        }
        let slot = self.next_input;
        self.next_input += 1;
        self.pending_input = Some(slot);
        Ok(Some(InputSlot(slot)))
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
            if data.len() != self.frame_len() {
                return Err(CodecError::Pipeline(format!(
                    "frame is {} bytes, expected {}",
                    data.len(),
                    self.frame_len()
                )));
            }
            let luma_len = (self.settings.resolution.width * self.settings.resolution.height) as usize;
            let luma = &data[..luma_len];
            let mean_luma = (luma.iter().map(|&y| y as u64).sum::<u64>() / luma_len.max(1) as u64) as u8;
            self.queued.push_back((LoopbackPayload { index: self.submitted, mean_luma }, pts_us));
            self.submitted += 1;
        }
        if end_of_stream {
            self.input_closed = true;
        }
        Ok(())
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<OutputEvent, CodecError> {
        if self.eos_reported {
            return Ok(OutputEvent::TryAgain);
        }
        if !self.format_reported && (!self.queued.is_empty() || self.input_closed) {
            self.format_reported = true;
            return Ok(OutputEvent::FormatChanged(TrackFormat {
                mime: H264_MIME.into(),
                resolution: self.settings.resolution,
                fps: self.settings.fps,
                codec_data: Some(Bytes::from_static(LOOPBACK_CODEC_DATA)),
            }));
        }
        if let Some((payload, pts_us)) = self.queued.pop_front() {
            let gop = self.settings.gop_frames().max(1);
            let sample = EncodedSample {
                data: payload.encode(),
                pts_us,
                flags: SampleFlags { sync: payload.index % gop == 0, ..Default::default() },
            };
            return Ok(self.ready(sample));
        }
        if self.input_closed {
            self.eos_reported = true;
            debug!("Loopback encoder drained {} frames", self.submitted);
            return Ok(self.ready(EncodedSample::end_of_stream()));
        }
        Ok(OutputEvent::TryAgain)
    }

    fn release_output(&mut self, slot: OutputSlot) -> Result<(), CodecError> {
        if self.outstanding.remove(&slot.0) {
            Ok(())
        } else {
            Err(CodecError::InvalidSlot(slot.0))
        }
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        self.queued.clear();
        Ok(())
    }

    fn release(&mut self) {
        self.queued.clear();
        self.outstanding.clear();
    }
}

// ── Container ─────────────────────────────────────────────────────────────────

/// On-disk layout of a loopback container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopbackContainer {
    pub format: Option<TrackFormat>,
    pub samples: Vec<EncodedSample>,
}

impl LoopbackContainer {
    pub fn read(path: &Path) -> Result<Self, CodecError> {
        let raw = fs::read(path)?;
        serde_json::from_slice(&raw)
            .map_err(|e| CodecError::Pipeline(format!("{}: {e}", path.display())))
    }

    pub fn write(&self, path: &Path) -> Result<(), CodecError> {
        let raw = serde_json::to_vec(self)
            .map_err(|e| CodecError::Pipeline(format!("serialize container: {e}")))?;
        fs::write(path, raw)?;
        Ok(())
    }
}

pub struct LoopbackMuxer {
    path: PathBuf,
    container: LoopbackContainer,
    started: bool,
    finished: bool,
}

impl LoopbackMuxer {
    /// Creates (truncates) the output file immediately.
    pub fn create(path: &Path) -> Result<Self, CodecError> {
        fs::File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            container: LoopbackContainer::default(),
            started: false,
            finished: false,
        })
    }
}

impl ContainerMuxer for LoopbackMuxer {
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize, CodecError> {
        if self.started || self.container.format.is_some() {
            return Err(CodecError::Pipeline("muxer takes a single track before start".into()));
        }
        self.container.format = Some(format.clone());
        Ok(0)
    }

    fn start(&mut self) -> Result<(), CodecError> {
        if self.container.format.is_none() {
            return Err(CodecError::Pipeline("start before add_track".into()));
        }
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
        self.container.samples.push(sample.clone());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if self.started {
            self.container.write(&self.path)?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.container.samples.clear();
    }
}

pub struct LoopbackExtractor {
    format: Option<TrackFormat>,
    samples: std::vec::IntoIter<EncodedSample>,
}

impl LoopbackExtractor {
    pub fn open(path: &Path) -> Result<Self, CodecError> {
        let container = LoopbackContainer::read(path)?;
        Ok(Self { format: container.format, samples: container.samples.into_iter() })
    }
}

impl SampleExtractor for LoopbackExtractor {
    fn track_format(&self) -> Option<&TrackFormat> {
        self.format.as_ref()
    }

    fn read_sample(&mut self) -> Result<Option<EncodedSample>, CodecError> {
        Ok(self.samples.next())
    }

    fn release(&mut self) {
        self.samples = Vec::new().into_iter();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timelapse_core::Resolution;

    fn settings() -> EncoderSettings {
        EncoderSettings::for_geometry(Resolution::new(4, 2))
    }

    fn frame(luma: u8) -> Vec<u8> {
        let mut data = vec![luma; 8];
        data.extend_from_slice(&[128; 4]);
        data
    }

    #[test]
    fn format_precedes_samples_then_eos() {
        let mut enc = LoopbackEncoder::new(settings());
        assert!(matches!(enc.dequeue_output(Duration::ZERO).unwrap(), OutputEvent::TryAgain));

        for (i, luma) in [16u8, 200].into_iter().enumerate() {
            let slot = enc.dequeue_input(Duration::ZERO).unwrap().unwrap();
            enc.queue_input(slot, &frame(luma), i as u64 * 33_333, false).unwrap();
        }
        let slot = enc.dequeue_input(Duration::ZERO).unwrap().unwrap();
        enc.queue_input(slot, &[], 0, true).unwrap();

        let OutputEvent::FormatChanged(format) = enc.dequeue_output(Duration::ZERO).unwrap() else {
            panic!("expected format first");
        };
        assert_eq!(format.resolution, Resolution::new(4, 2));

        let mut payloads = Vec::new();
        loop {
            match enc.dequeue_output(Duration::ZERO).unwrap() {
                OutputEvent::BufferReady(out) => {
                    enc.release_output(out.slot).unwrap();
                    if out.sample.flags.end_of_stream {
                        break;
                    }
                    payloads.push((LoopbackPayload::parse(&out.sample.data).unwrap(), out.sample.flags.sync));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(
            payloads,
            vec![
                (LoopbackPayload { index: 0, mean_luma: 16 }, true),
                (LoopbackPayload { index: 1, mean_luma: 200 }, false),
            ]
        );
    }

    #[test]
    fn input_slots_run_out_until_drained() {
        let mut enc = LoopbackEncoder::new(settings());
        for _ in 0..INPUT_SLOTS {
            let slot = enc.dequeue_input(Duration::ZERO).unwrap().unwrap();
            enc.queue_input(slot, &frame(50), 0, false).unwrap();
        }
        assert!(enc.dequeue_input(Duration::ZERO).unwrap().is_none());

        assert!(matches!(enc.dequeue_output(Duration::ZERO).unwrap(), OutputEvent::FormatChanged(_)));
        assert!(matches!(enc.dequeue_output(Duration::ZERO).unwrap(), OutputEvent::BufferReady(_)));
        assert!(enc.dequeue_input(Duration::ZERO).unwrap().is_some());
    }

    #[test]
    fn stale_slots_are_rejected() {
        let mut enc = LoopbackEncoder::new(settings());
        assert!(matches!(
            enc.queue_input(InputSlot(7), &frame(0), 0, false),
            Err(CodecError::InvalidSlot(7))
        ));
        assert!(matches!(enc.release_output(OutputSlot(3)), Err(CodecError::InvalidSlot(3))));
    }

    #[test]
    fn container_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_0.mp4");
        let backend = LoopbackBackend;
        let format = TrackFormat {
            mime: H264_MIME.into(),
            resolution: Resolution::new(4, 2),
            fps: 30,
            codec_data: None,
        };

        let mut mux = backend.create_muxer(&path).unwrap();
        assert!(mux.write_sample(0, &EncodedSample::end_of_stream()).is_err());
        let track = mux.add_track(&format).unwrap();
        mux.start().unwrap();
        for pts in [0u64, 33_333] {
            let sample = EncodedSample {
                data: Bytes::from_static(b"au"),
                pts_us: pts,
                flags: SampleFlags { sync: pts == 0, ..Default::default() },
            };
            mux.write_sample(track, &sample).unwrap();
        }
        mux.stop().unwrap();

        let mut ex = backend.open_extractor(&path).unwrap();
        assert_eq!(ex.track_format(), Some(&format));
        let first = ex.read_sample().unwrap().unwrap();
        assert!(first.flags.sync);
        assert_eq!(ex.read_sample().unwrap().unwrap().pts_us, 33_333);
        assert!(ex.read_sample().unwrap().is_none());
    }
}
