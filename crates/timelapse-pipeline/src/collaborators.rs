//! Narrow interfaces to the world outside the pipeline.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use timelapse_core::errors::{CaptureError, PublishError};
use tokio::sync::mpsc;

/// Produces one still image per request.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Write one still to `destination`. Completes exactly once per call.
    async fn capture(&self, destination: &Path) -> Result<(), CaptureError>;
}

/// Takes ownership of the final artifact and stores it somewhere durable.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns the user-visible location of the published file.
    async fn publish(&self, artifact: &Path) -> Result<PathBuf, PublishError>;
}

/// Best-effort frame count notifications. Must never block.
pub trait ProgressSink: Send + Sync {
    fn on_frame_count(&self, total: u64);
}

impl ProgressSink for mpsc::Sender<u64> {
    fn on_frame_count(&self, total: u64) {
        // Full or closed channel: the update is dropped.
        let _ = self.try_send(total);
    }
}

/// Discards all notifications.
impl ProgressSink for () {
    fn on_frame_count(&self, _total: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.on_frame_count(1);
        tx.on_frame_count(2);
        assert_eq!(rx.recv().await, Some(1));
        assert!(rx.try_recv().is_err());

        drop(rx);
        tx.on_frame_count(3);
    }
}
