//! timelapse-pipeline: from periodic stills to one published video.
//!
//! ```text
//! CaptureScheduler ──frames──▶ SegmentQueue ──300-frame batch──▶ compile worker
//!      (tokio task)            (Mutex)          (mpsc, bounded)   (VideoEncoder via spawn_blocking)
//!                                                                        │
//! SessionController ◀── final artifact ── SegmentManager (merge) ◀──segments
//! ```
//!
//! Capture and compilation run on two independent sequential executors. All
//! encoder and merge work happens on the compile worker, one job at a time.

pub mod collaborators;
pub mod encoder;
pub mod scheduler;
pub mod segments;
pub mod session;
pub mod worker;

#[cfg(test)]
mod testutil;

pub use collaborators::{FrameSource, ProgressSink, Publisher};
pub use encoder::VideoEncoder;
pub use scheduler::{CaptureContext, CaptureScheduler, SegmentQueue};
pub use segments::{merge_segments, SegmentManager, MERGED_FILE_NAME};
pub use session::{SessionController, SessionOutcome};
pub use worker::{CompileJob, CompileWorker};
