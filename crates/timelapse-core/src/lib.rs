pub mod config;
pub mod errors;
pub mod types;

pub use config::SessionConfig;
pub use errors::SessionError;
pub use types::*;

use std::time::Duration;

/// Frame rate of every produced video, independent of the speed multiplier.
pub const OUTPUT_FPS: u32 = 30;

/// Captured frames per segment (≈ 10 s of output video).
pub const SEGMENT_FRAME_THRESHOLD: usize = 300;

/// Maximum spacing between keyframes in the encoded stream.
pub const I_FRAME_INTERVAL_SECS: u32 = 5;

/// Duration of one output frame in microseconds.
pub const FRAME_DURATION_US: u64 = 1_000_000 / OUTPUT_FPS as u64;

/// Bits per second allotted per output pixel.
pub const BITRATE_PER_PIXEL: u64 = 8;

/// Bounded wait around a single encoder buffer-exchange call.
pub const CODEC_TIMEOUT: Duration = Duration::from_millis(10);

pub const DEFAULT_SPEED_MULTIPLIER: u32 = 10;

/// Presentation timestamp (µs) of the `index`-th frame on the output timeline.
pub fn presentation_time_us(index: u64) -> u64 {
    index * FRAME_DURATION_US
}
