//! Compile worker: the single sequential executor for segment encodes and the
//! final merge.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use timelapse_core::{Frame, Segment, SessionError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::encoder::VideoEncoder;
use crate::scheduler::SegmentQueue;
use crate::segments::SegmentManager;

pub enum CompileJob {
    /// A sealed batch of frames, oldest first.
    Segment(Vec<Frame>),
    /// Capture has stopped: compile what is left, merge, and report the
    /// final artifact. The worker exits afterwards.
    Finalize(oneshot::Sender<Result<PathBuf, SessionError>>),
}

pub struct CompileWorker {
    encoder: VideoEncoder,
    segments: SegmentManager,
    queue: Arc<SegmentQueue>,
    work_dir: PathBuf,
    next_index: usize,
    /// First segment failure; later batches are dropped once set.
    fault: Option<SessionError>,
}

impl CompileWorker {
    pub fn new(
        encoder: VideoEncoder,
        segments: SegmentManager,
        queue: Arc<SegmentQueue>,
        work_dir: PathBuf,
    ) -> Self {
        Self { encoder, segments, queue, work_dir, next_index: 0, fault: None }
    }

    pub async fn run(mut self, mut jobs: mpsc::Receiver<CompileJob>) {
        while let Some(job) = jobs.recv().await {
            match job {
                CompileJob::Segment(batch) => {
                    self.compile(batch).await;
                    self.queue.compile_finished(self.fault.is_some());
                }
                CompileJob::Finalize(reply) => {
                    let result = self.finalize().await;
                    let _ = reply.send(result);
                    return;
                }
            }
        }
        debug!("Compile worker: job channel closed");
    }

    async fn compile(&mut self, batch: Vec<Frame>) {
        if self.fault.is_some() {
            debug!("Dropping {} frames after earlier failure", batch.len());
            return;
        }
        let index = self.next_index;
        self.next_index += 1;
        let output = self.work_dir.join(Segment::file_name(index));
        let encoder = self.encoder.clone();

        let result = tokio::task::spawn_blocking(move || {
            let result = encoder.encode_segment(index, &batch, &output);
            delete_frames(&batch);
            result
        })
        .await;

        match result {
            Ok(Ok(segment)) => self.segments.push(segment),
            Ok(Err(e)) => {
                error!("Segment {} failed: {}", index, e);
                self.fault = Some(e.into());
            }
            Err(e) => {
                error!("Segment {} compile task aborted: {}", index, e);
                self.fault = Some(SessionError::WorkerGone);
            }
        }
    }

    async fn finalize(mut self) -> Result<PathBuf, SessionError> {
        let remaining = self.queue.drain_all();
        if !remaining.is_empty() {
            info!("Compiling final {} frames", remaining.len());
        }
        let threshold = self.queue.threshold();
        let mut remaining = remaining.into_iter().peekable();
        while remaining.peek().is_some() {
            let batch: Vec<Frame> = remaining.by_ref().take(threshold).collect();
            self.compile(batch).await;
        }

        if let Some(fault) = self.fault.take() {
            return Err(fault);
        }

        let mut segments = self.segments;
        info!("Finalizing {} segment(s), {} frames", segments.segments().len(), segments.total_frames());
        tokio::task::spawn_blocking(move || segments.finalize())
            .await
            .map_err(|_| SessionError::WorkerGone)?
    }
}

fn delete_frames(frames: &[Frame]) {
    for frame in frames {
        if let Err(e) = fs::remove_file(&frame.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not delete {}: {}", frame.path.display(), e);
            }
        }
    }
}
