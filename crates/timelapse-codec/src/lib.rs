//! timelapse-codec: the encoder / muxer / extractor protocol.
//!
//! Any codec binding with acquire → submit → release semantics fits behind
//! these traits:
//!
//! ```text
//! FrameEncoder:    dequeue_input → queue_input ... dequeue_output → release_output
//!                                                    │
//!                                   TryAgain | FormatChanged | BufferReady
//!                                                    │
//! ContainerMuxer:  add_track → start → write_sample* → stop
//! SampleExtractor: track_format → read_sample* (stream copy, no decode)
//! ```
//!
//! # Backends
//!
//! | Backend | Module | Notes |
//! |---------|--------|-------|
//! | GStreamer | [`gst`] | `vaapih264enc` / `nvh264enc` / `x264enc` → `mp4mux`, `qtdemux` |
//! | Loopback | [`loopback`] | File-backed stand-in for CI and dry runs, no plugins needed |

pub mod gst;
pub mod loopback;

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use timelapse_core::errors::CodecError;
use timelapse_core::{Resolution, BITRATE_PER_PIXEL, I_FRAME_INTERVAL_SECS, OUTPUT_FPS};

pub use gst::GstBackend;
pub use loopback::LoopbackBackend;

/// MIME type of the only supported video track.
pub const H264_MIME: &str = "video/avc";

// MARK: - EncoderSettings

/// Encoder configuration for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub resolution: Resolution,
    pub fps: u32,
    pub i_frame_interval_secs: u32,
    pub bitrate_bps: u64,
}

impl EncoderSettings {
    /// Fixed 30 fps, 5 s keyframe interval, bitrate proportional to pixel count.
    pub fn for_geometry(resolution: Resolution) -> Self {
        Self {
            resolution,
            fps: OUTPUT_FPS,
            i_frame_interval_secs: I_FRAME_INTERVAL_SECS,
            bitrate_bps: resolution.total_pixels() * BITRATE_PER_PIXEL,
        }
    }

    /// Frames between forced keyframes.
    pub fn gop_frames(&self) -> u32 {
        self.fps * self.i_frame_interval_secs
    }

    pub fn bitrate_kbps(&self) -> u32 {
        (self.bitrate_bps / 1000).min(u32::MAX as u64) as u32
    }
}

// MARK: - TrackFormat

/// Description of an encoded video track, as reported by the encoder's
/// format-changed event or read back from a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackFormat {
    pub mime: String,
    pub resolution: Resolution,
    pub fps: u32,
    /// Decoder configuration record (avcC for H.264).
    pub codec_data: Option<Bytes>,
}

impl TrackFormat {
    /// Whether samples of `other` can be stream-copied into a track of `self`.
    pub fn is_compatible(&self, other: &TrackFormat) -> bool {
        self.mime == other.mime && self.resolution == other.resolution
    }
}

impl std::fmt::Display for TrackFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} @{}fps", self.mime, self.resolution, self.fps)
    }
}

// MARK: - Samples

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleFlags {
    /// Keyframe: independently decodable.
    pub sync: bool,
    /// Carries only decoder configuration, no picture data.
    pub codec_config: bool,
    pub end_of_stream: bool,
}

/// One encoded access unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedSample {
    pub data: Bytes,
    pub pts_us: u64,
    pub flags: SampleFlags,
}

impl EncodedSample {
    pub fn end_of_stream() -> Self {
        Self {
            data: Bytes::new(),
            pts_us: 0,
            flags: SampleFlags { end_of_stream: true, ..Default::default() },
        }
    }
}

/// Handle to an encoder input buffer obtained from [`FrameEncoder::dequeue_input`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputSlot(pub usize);

/// Handle to an encoder output buffer; must be handed back via
/// [`FrameEncoder::release_output`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputSlot(pub usize);

#[derive(Debug, Clone)]
pub struct OutputBuffer {
    pub slot: OutputSlot,
    pub sample: EncodedSample,
}

/// Result of one [`FrameEncoder::dequeue_output`] poll.
#[derive(Debug, Clone)]
pub enum OutputEvent {
    /// Nothing ready within the timeout.
    TryAgain,
    /// Output format is known; emitted once, before any sample data.
    FormatChanged(TrackFormat),
    BufferReady(OutputBuffer),
}

// MARK: - Traits

/// Stateful encoder driven by buffer exchange.
pub trait FrameEncoder: Send {
    /// Element or implementation name, for logs.
    fn name(&self) -> &str;

    /// Wait up to `timeout` for a free input buffer. `None` means none is free
    /// yet; drain output and retry.
    fn dequeue_input(&mut self, timeout: Duration) -> Result<Option<InputSlot>, CodecError>;

    /// Submit `data` in `slot` at `pts_us`. A zero-length buffer with
    /// `end_of_stream` set closes the input.
    fn queue_input(
        &mut self,
        slot: InputSlot,
        data: &[u8],
        pts_us: u64,
        end_of_stream: bool,
    ) -> Result<(), CodecError>;

    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent, CodecError>;

    fn release_output(&mut self, slot: OutputSlot) -> Result<(), CodecError>;

    fn stop(&mut self) -> Result<(), CodecError>;

    /// Free all resources. Safe to call after a failed `stop`.
    fn release(&mut self);
}

/// Single-file container writer.
pub trait ContainerMuxer: Send {
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize, CodecError>;

    fn start(&mut self) -> Result<(), CodecError>;

    fn write_sample(&mut self, track: usize, sample: &EncodedSample) -> Result<(), CodecError>;

    /// Finalize the file. A muxer that was never started just shuts down.
    fn stop(&mut self) -> Result<(), CodecError>;

    fn release(&mut self);
}

/// Reads encoded samples of a container's video track without decoding.
pub trait SampleExtractor: Send {
    /// `None` when the container has no video track.
    fn track_format(&self) -> Option<&TrackFormat>;

    /// Next sample in decode order; `None` at end of track.
    fn read_sample(&mut self) -> Result<Option<EncodedSample>, CodecError>;

    fn release(&mut self);
}

/// Factory for the three protocol roles.
pub trait MediaBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_encoder(&self, settings: &EncoderSettings) -> Result<Box<dyn FrameEncoder>, CodecError>;

    fn create_muxer(&self, path: &Path) -> Result<Box<dyn ContainerMuxer>, CodecError>;

    fn open_extractor(&self, path: &Path) -> Result<Box<dyn SampleExtractor>, CodecError>;
}
