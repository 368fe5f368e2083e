//! VideoEncoder: one batch of stills in, one playable H.264/MP4 segment out.
//!
//! The encoder is driven through the buffer-exchange protocol of
//! [`FrameEncoder`]: acquire an input slot, submit a frame, and drain whatever
//! output is ready before the next frame. After the last frame a zero-length
//! end-of-stream buffer is submitted and output is drained until the encoder
//! echoes end of stream.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use timelapse_codec::{
    ContainerMuxer, EncoderSettings, FrameEncoder, InputSlot, MediaBackend, OutputEvent,
};
use timelapse_core::errors::{CodecError, EncodeError};
use timelapse_core::{presentation_time_us, Frame, Resolution, Segment, CODEC_TIMEOUT};
use timelapse_normalizer::FrameNormalizer;
use tracing::{debug, info, warn};

/// Input acquire attempts (each bounded by [`CODEC_TIMEOUT`]) before the
/// encoder is declared stalled.
const MAX_INPUT_ATTEMPTS: u32 = 1_000;

/// Consecutive empty output polls tolerated while draining to end of stream.
const MAX_IDLE_DRAIN_POLLS: u32 = 3_000;

// ── VideoEncoder ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct VideoEncoder {
    backend: Arc<dyn MediaBackend>,
    normalizer: FrameNormalizer,
}

impl VideoEncoder {
    pub fn new(backend: Arc<dyn MediaBackend>, normalizer: FrameNormalizer) -> Self {
        Self { backend, normalizer }
    }

    /// Encode `frames` in order into `output`.
    ///
    /// Undecodable frames are skipped; the segment fails only if none of them
    /// could be used or the codec misbehaves. Blocking: call from a blocking
    /// context.
    pub fn encode_segment(
        &self,
        index: usize,
        frames: &[Frame],
        output: &Path,
    ) -> Result<Segment, EncodeError> {
        if frames.is_empty() {
            return Err(EncodeError::EmptySegment);
        }
        let geometry = self.geometry(frames)?;
        let settings = EncoderSettings::for_geometry(geometry);

        let encoder = self
            .backend
            .create_encoder(&settings)
            .map_err(|e| EncodeError::Configure(e.to_string()))?;
        let muxer = match self.backend.create_muxer(output) {
            Ok(muxer) => muxer,
            Err(e) => {
                let mut encoder = encoder;
                encoder.release();
                return Err(EncodeError::Configure(e.to_string()));
            }
        };

        info!(
            "Encoding segment {} ({} frames, {}, {} kbps, {})",
            index,
            frames.len(),
            geometry,
            settings.bitrate_kbps(),
            encoder.name()
        );

        let mut ctx = EncoderContext::new(encoder, muxer);
        let result = ctx.run(&self.normalizer, frames, geometry);
        let cleanup = ctx.shutdown();

        let submitted = match (result, cleanup) {
            (Ok(submitted), Ok(())) => submitted,
            (Err(e), _) | (Ok(_), Err(e)) => {
                let _ = fs::remove_file(output);
                return Err(e);
            }
        };

        info!("Segment {} complete: {} frames → {}", index, submitted, output.display());
        Ok(Segment { index, path: output.to_path_buf(), frame_count: submitted })
    }

    /// Geometry of the first frame that can be probed, fitted to the
    /// configured resolution class.
    fn geometry(&self, frames: &[Frame]) -> Result<Resolution, EncodeError> {
        for frame in frames {
            match self.normalizer.segment_geometry(&frame.path) {
                Ok(geometry) => return Ok(geometry),
                Err(e) => warn!("Frame {} unusable for geometry: {}", frame.sequence, e),
            }
        }
        Err(EncodeError::NoDecodableFrames { attempted: frames.len() })
    }
}

// ── EncoderContext ────────────────────────────────────────────────────────────

/// Outcome of handling one output event.
enum Drained {
    Idle,
    Progress,
    EndOfStream,
}

/// Transient per-segment state. Owns the encoder and muxer for exactly one run.
struct EncoderContext {
    encoder: Box<dyn FrameEncoder>,
    muxer: Box<dyn ContainerMuxer>,
    track: Option<usize>,
    muxer_started: bool,
    eos_seen: bool,
    /// Frames submitted so far; also the index of the next presentation timestamp.
    submitted: usize,
    written: usize,
}

impl EncoderContext {
    fn new(encoder: Box<dyn FrameEncoder>, muxer: Box<dyn ContainerMuxer>) -> Self {
        Self {
            encoder,
            muxer,
            track: None,
            muxer_started: false,
            eos_seen: false,
            submitted: 0,
            written: 0,
        }
    }

    /// Submit every decodable frame, then end of stream, then drain.
    /// Returns the number of frames submitted.
    fn run(
        &mut self,
        normalizer: &FrameNormalizer,
        frames: &[Frame],
        geometry: Resolution,
    ) -> Result<usize, EncodeError> {
        for frame in frames {
            let normalized = match normalizer.normalize(frame, geometry) {
                Ok(normalized) => normalized,
                Err(e) => {
                    warn!("Skipping frame {}: {}", frame.sequence, e);
                    continue;
                }
            };
            let slot = self.acquire_input()?;
            let pts_us = presentation_time_us(self.submitted as u64);
            self.encoder.queue_input(slot, &normalized.data, pts_us, false)?;
            self.submitted += 1;
            self.drain_ready()?;
        }

        if self.submitted == 0 {
            return Err(EncodeError::NoDecodableFrames { attempted: frames.len() });
        }

        let slot = self.acquire_input()?;
        let pts_us = presentation_time_us(self.submitted as u64);
        self.encoder.queue_input(slot, &[], pts_us, true)?;
        self.drain_to_end()?;

        debug!("Muxed {} samples for {} frames", self.written, self.submitted);
        Ok(self.submitted)
    }

    /// Bounded wait for an input slot, draining output between attempts so a
    /// full encoder can make room.
    fn acquire_input(&mut self) -> Result<InputSlot, EncodeError> {
        for _ in 0..MAX_INPUT_ATTEMPTS {
            if let Some(slot) = self.encoder.dequeue_input(CODEC_TIMEOUT)? {
                return Ok(slot);
            }
            self.drain_ready()?;
        }
        Err(EncodeError::InputStalled { attempts: MAX_INPUT_ATTEMPTS })
    }

    /// Handle output events until the encoder has nothing ready.
    fn drain_ready(&mut self) -> Result<(), EncodeError> {
        loop {
            match self.poll_output()? {
                Drained::Progress => continue,
                Drained::Idle | Drained::EndOfStream => return Ok(()),
            }
        }
    }

    fn drain_to_end(&mut self) -> Result<(), EncodeError> {
        let mut idle = 0;
        while !self.eos_seen {
            match self.poll_output()? {
                Drained::Idle => {
                    idle += 1;
                    if idle >= MAX_IDLE_DRAIN_POLLS {
                        return Err(EncodeError::DrainStalled);
                    }
                }
                Drained::Progress => idle = 0,
                Drained::EndOfStream => {}
            }
        }
        Ok(())
    }

    fn poll_output(&mut self) -> Result<Drained, EncodeError> {
        if self.eos_seen {
            return Ok(Drained::EndOfStream);
        }
        match self.encoder.dequeue_output(CODEC_TIMEOUT)? {
            OutputEvent::TryAgain => Ok(Drained::Idle),
            OutputEvent::FormatChanged(format) => {
                if self.muxer_started {
                    return Err(EncodeError::ProtocolViolation(format!(
                        "output format changed again mid-segment ({format})"
                    )));
                }
                debug!("Encoder output format: {}", format);
                self.track = Some(self.muxer.add_track(&format)?);
                self.muxer.start()?;
                self.muxer_started = true;
                Ok(Drained::Progress)
            }
            OutputEvent::BufferReady(out) => {
                let sample = &out.sample;
                let has_payload = !sample.flags.codec_config && !sample.data.is_empty();
                let written = match self.track {
                    Some(track) if has_payload => self.muxer.write_sample(track, sample).map(|_| true),
                    None if has_payload => {
                        let _ = self.encoder.release_output(out.slot);
                        return Err(EncodeError::ProtocolViolation(
                            "sample data before output format".into(),
                        ));
                    }
                    _ => Ok(false),
                };
                self.encoder.release_output(out.slot)?;
                if written? {
                    self.written += 1;
                }
                if sample.flags.end_of_stream {
                    self.eos_seen = true;
                    return Ok(Drained::EndOfStream);
                }
                Ok(Drained::Progress)
            }
        }
    }

    /// Stop and release the encoder, then the muxer. Runs whatever happened
    /// before; the first error is reported.
    fn shutdown(mut self) -> Result<(), EncodeError> {
        let encoder_stopped = self.encoder.stop();
        self.encoder.release();
        let muxer_stopped = self.muxer.stop();
        self.muxer.release();

        log_cleanup("encoder", &encoder_stopped);
        log_cleanup("muxer", &muxer_stopped);
        encoder_stopped.and(muxer_stopped).map_err(EncodeError::from)
    }
}

fn log_cleanup(what: &str, result: &Result<(), CodecError>) {
    if let Err(e) = result {
        warn!("Stopping {} failed: {}", what, e);
    }
}
