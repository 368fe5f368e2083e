use std::path::PathBuf;

use thiserror::Error;

/// One capture request failed. Logged and skipped; never escalates.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture failed: {reason}")]
    Failed { reason: String },

    #[error("Frame source closed")]
    SourceClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single still could not be turned into an encoder buffer. The frame is
/// skipped and the segment continues.
#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("Failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure inside a codec/muxer/extractor binding.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Codec backend unavailable: {0}")]
    Unavailable(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Invalid buffer slot {0}")]
    InvalidSlot(usize),

    #[error("Timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal to one segment; surfaced to the session.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Segment has no frames")]
    EmptySegment,

    #[error("None of the {attempted} frames in the segment could be decoded")]
    NoDecodableFrames { attempted: usize },

    #[error("Encoder setup failed: {0}")]
    Configure(String),

    #[error("Codec protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Encoder gave no input slot after {attempts} attempts")]
    InputStalled { attempts: u32 },

    #[error("Encoder output stalled before end of stream")]
    DrainStalled,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Fatal to the session: concatenating segments failed.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("No video track in {path}")]
    NoVideoTrack { path: PathBuf },

    #[error("Segment {path} is {found}, expected {expected}")]
    FormatMismatch { path: PathBuf, expected: String, found: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The publish collaborator failed to store the final artifact.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("{reason}")]
    Failed { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("A session is already {state}")]
    AlreadyActive { state: crate::SessionState },

    #[error("Configuration invalid: {reason}")]
    InvalidConfig { reason: String },

    #[error("No frames captured")]
    NoFrames,

    #[error("Segment compilation failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("Segment merge failed: {0}")]
    Merge(#[from] MergeError),

    #[error("Publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("Compile worker stopped unexpectedly")]
    WorkerGone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
