use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

// MARK: - Resolution

/// Pixel dimensions of a frame or video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn total_pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Truncate each dimension to the nearest even value (min 2), as required
    /// by the encoder's 4:2:0 block size.
    pub fn even(self) -> Self {
        Self {
            width: (self.width & !1).max(2),
            height: (self.height & !1).max(2),
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

// MARK: - ResolutionClass

/// User-selectable output size, expressed as a maximum video height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionClass {
    #[serde(rename = "720p")]
    Hd,
    #[serde(rename = "1080p")]
    FullHd,
    #[serde(rename = "1440p")]
    Qhd,
    #[serde(rename = "4k", alias = "4K", alias = "2160p")]
    Uhd,
}

impl Default for ResolutionClass {
    fn default() -> Self {
        Self::FullHd
    }
}

impl ResolutionClass {
    pub const ALL: [Self; 4] = [Self::Hd, Self::FullHd, Self::Qhd, Self::Uhd];

    pub fn max_height(self) -> u32 {
        match self {
            Self::Hd => 720,
            Self::FullHd => 1080,
            Self::Qhd => 1440,
            Self::Uhd => 2160,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Hd => "720p",
            Self::FullHd => "1080p",
            Self::Qhd => "1440p",
            Self::Uhd => "4k",
        }
    }

    /// Output geometry for a source whose *oriented* size is `source`:
    /// downscaled to this class's height (never upscaled), aspect ratio kept,
    /// then clamped to even dimensions.
    pub fn fit(self, source: Resolution) -> Resolution {
        let max_h = self.max_height();
        if source.height <= max_h || source.height == 0 {
            return source.even();
        }
        let width = (source.width as u64 * max_h as u64 / source.height as u64) as u32;
        Resolution::new(width, max_h).even()
    }
}

impl std::str::FromStr for ResolutionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "720p" | "720" => Ok(Self::Hd),
            "1080p" | "1080" => Ok(Self::FullHd),
            "1440p" | "1440" => Ok(Self::Qhd),
            "4k" | "2160p" | "2160" => Ok(Self::Uhd),
            other => Err(format!("unknown resolution class '{other}'")),
        }
    }
}

impl std::fmt::Display for ResolutionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// MARK: - Frame

/// One captured still, owned by the session until its segment is compiled.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Capture sequence number, also the file name index. It runs across the
    /// whole session and does not restart at 0 when a batch is sealed: a
    /// capture that overlaps a compile would otherwise overwrite a still the
    /// encoder has not read yet.
    pub sequence: u64,
    pub path: PathBuf,
    pub captured_at: DateTime<Local>,
}

impl Frame {
    pub fn file_name(sequence: u64) -> String {
        format!("frame_{sequence:06}.jpg")
    }
}

// MARK: - Segment

/// The output of one encoder run. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub path: PathBuf,
    /// Frames actually submitted to the encoder; always > 0.
    pub frame_count: usize,
}

impl Segment {
    pub fn file_name(index: usize) -> String {
        format!("segment_{index}.mp4")
    }
}

// MARK: - SessionState

/// Lifecycle of one recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Recording,
    Compiling,
    Completed,
    Failed,
}

impl SessionState {
    /// A new session may only start when nothing is recording or compiling.
    pub fn accepts_start(self) -> bool {
        !matches!(self, Self::Recording | Self::Compiling)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Compiling => "compiling",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}
