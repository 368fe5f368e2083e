//! CaptureScheduler: paces capture requests and seals full frame batches.
//!
//! # Flow (per tick)
//! 1. Ask the [`FrameSource`] for one still (never more than one outstanding)
//! 2. On success append it to the [`SegmentQueue`] and report the total
//! 3. If a full batch is pending and nothing is compiling, hand it to the
//!    compile worker
//! 4. Sleep for the rest of the interval, or exit on stop

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Local;
use timelapse_core::{Frame, SEGMENT_FRAME_THRESHOLD};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::collaborators::{FrameSource, ProgressSink};
use crate::worker::CompileJob;

// ── SegmentQueue ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Frame>,
    total: u64,
    in_flight: bool,
    faulted: bool,
}

/// Frames captured but not yet handed to the compiler, shared between the
/// capture loop (producer) and the compile worker (consumer).
#[derive(Debug)]
pub struct SegmentQueue {
    state: Mutex<QueueState>,
    threshold: usize,
}

impl Default for SegmentQueue {
    fn default() -> Self {
        Self::new(SEGMENT_FRAME_THRESHOLD)
    }
}

impl SegmentQueue {
    pub fn new(threshold: usize) -> Self {
        Self { state: Mutex::new(QueueState::default()), threshold: threshold.max(1) }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Sequence number the next successful capture will get. Session-wide;
    /// sealing a batch does not reset it.
    pub fn next_sequence(&self) -> u64 {
        self.lock().total
    }

    /// Frames captured so far this session.
    pub fn total(&self) -> u64 {
        self.lock().total
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_faulted(&self) -> bool {
        self.lock().faulted
    }

    /// Append a captured frame. Returns the new session total and, when a
    /// full batch is pending and no compile is in flight, the oldest
    /// `threshold` frames (marking a compile in flight).
    pub fn push(&self, frame: Frame) -> (u64, Option<Vec<Frame>>) {
        let mut state = self.lock();
        state.pending.push_back(frame);
        state.total += 1;
        let batch = if state.pending.len() >= self.threshold && !state.in_flight && !state.faulted {
            state.in_flight = true;
            Some(state.pending.drain(..self.threshold).collect())
        } else {
            None
        };
        (state.total, batch)
    }

    /// Called by the compile worker when a sealed batch is done.
    pub fn compile_finished(&self, failed: bool) {
        let mut state = self.lock();
        state.in_flight = false;
        state.faulted |= failed;
    }

    /// Take everything still pending.
    pub fn drain_all(&self) -> Vec<Frame> {
        self.lock().pending.drain(..).collect()
    }
}

// ── CaptureScheduler ──────────────────────────────────────────────────────────

/// Everything a capture loop needs.
pub struct CaptureContext {
    pub source: Arc<dyn FrameSource>,
    pub progress: Arc<dyn ProgressSink>,
    pub queue: Arc<SegmentQueue>,
    pub jobs: mpsc::Sender<CompileJob>,
    pub frames_dir: PathBuf,
}

/// Handle to a running capture loop.
pub struct CaptureScheduler {
    stop_tx: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    interval: Duration,
}

impl CaptureScheduler {
    /// Spawn the capture loop; the first capture is issued immediately.
    /// Must be called within a Tokio runtime.
    pub fn start(interval: Duration, ctx: CaptureContext) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        info!("Capture started: one frame every {:?}", interval);
        let task = tokio::spawn(capture_loop(interval, ctx, stop_rx));
        Self { stop_tx, task: tokio::sync::Mutex::new(Some(task)), interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Halt the loop and wait for it to exit. An in-flight capture finishes
    /// first; no request is issued after this returns. Idempotent.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        if let Err(e) = task.await {
            warn!("Capture loop ended abnormally: {}", e);
        }
    }
}

async fn capture_loop(interval: Duration, ctx: CaptureContext, mut stop_rx: watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            break;
        }
        if ctx.queue.is_faulted() {
            warn!("Segment compilation failed; capture halted");
            break;
        }

        let started = Instant::now();
        if !tick(&ctx).await {
            break;
        }

        let wait = interval.saturating_sub(started.elapsed());
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = stop_rx.changed() => {
                // Handle dropped without stop: treat as stop.
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Capture loop exited after {} frames", ctx.queue.total());
}

/// One capture attempt. Returns false when the compile worker is gone.
async fn tick(ctx: &CaptureContext) -> bool {
    let sequence = ctx.queue.next_sequence();
    let path = ctx.frames_dir.join(Frame::file_name(sequence));
    let captured_at = Local::now();

    if let Err(e) = ctx.source.capture(&path).await {
        warn!("Capture of frame {} failed: {}", sequence, e);
        let _ = tokio::fs::remove_file(&path).await;
        return true;
    }

    let (total, batch) = ctx.queue.push(Frame { sequence, path, captured_at });
    ctx.progress.on_frame_count(total);

    if let Some(batch) = batch {
        info!("Sealed {} frames for compilation ({} captured)", batch.len(), total);
        if ctx.jobs.send(CompileJob::Segment(batch)).await.is_err() {
            warn!("Compile worker gone; capture halted");
            ctx.queue.compile_finished(true);
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use timelapse_core::errors::CaptureError;

    use super::*;
    use crate::testutil::{LastCount, ScriptedSource};

    fn frame(sequence: u64) -> Frame {
        Frame { sequence, path: PathBuf::from(Frame::file_name(sequence)), captured_at: Local::now() }
    }

    #[test]
    fn seals_exactly_threshold_oldest_frames() {
        let queue = SegmentQueue::new(3);
        assert!(queue.push(frame(0)).1.is_none());
        assert!(queue.push(frame(1)).1.is_none());
        let (total, batch) = queue.push(frame(2));
        assert_eq!(total, 3);
        let sequences: Vec<u64> = batch.unwrap().iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn holds_batches_while_compile_in_flight() {
        let queue = SegmentQueue::new(2);
        queue.push(frame(0));
        assert!(queue.push(frame(1)).1.is_some());
        for seq in 2..5 {
            assert!(queue.push(frame(seq)).1.is_none());
        }
        queue.compile_finished(false);
        let (_, batch) = queue.push(frame(5));
        let sequences: Vec<u64> = batch.unwrap().iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
        assert_eq!(queue.drain_all().len(), 2);
    }

    #[test]
    fn sequence_continues_after_a_batch_is_sealed() {
        let queue = SegmentQueue::new(2);
        for seq in 0..2 {
            assert_eq!(queue.next_sequence(), seq);
            queue.push(frame(seq));
        }
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.next_sequence(), 2);
        assert_eq!(Frame::file_name(queue.next_sequence()), "frame_000002.jpg");
    }

    #[test]
    fn fault_stops_sealing() {
        let queue = SegmentQueue::new(1);
        assert!(queue.push(frame(0)).1.is_some());
        queue.compile_finished(true);
        assert!(queue.is_faulted());
        assert!(queue.push(frame(1)).1.is_none());
    }

    fn context(
        source: Arc<dyn FrameSource>,
        dir: &Path,
        threshold: usize,
    ) -> (CaptureContext, mpsc::Receiver<CompileJob>, Arc<LastCount>) {
        let (jobs, rx) = mpsc::channel(1);
        let progress = Arc::new(LastCount::default());
        let ctx = CaptureContext {
            source,
            progress: progress.clone(),
            queue: Arc::new(SegmentQueue::new(threshold)),
            jobs,
            frames_dir: dir.to_path_buf(),
        };
        (ctx, rx, progress)
    }

    #[tokio::test]
    async fn captures_until_stopped_and_hands_off_batches() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(dir.path(), 5));
        let (ctx, mut rx, progress) = context(source.clone(), dir.path(), 2);
        let queue = ctx.queue.clone();

        let scheduler = CaptureScheduler::start(Duration::from_millis(1), ctx);
        let Some(CompileJob::Segment(batch)) = rx.recv().await else {
            panic!("expected a sealed batch");
        };
        assert_eq!(batch.len(), 2);
        assert!(batch[0].path.ends_with("frame_000000.jpg"));

        while source.captured() < 5 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        scheduler.stop().await;
        scheduler.stop().await;

        assert_eq!(queue.total(), 5);
        assert_eq!(progress.0.load(Ordering::SeqCst), 5);
        // The first batch is still "compiling", so nothing else was sealed.
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.pending(), 3);
    }

    struct FlakySource {
        calls: AtomicU64,
        inner: ScriptedSource,
    }

    #[async_trait]
    impl FrameSource for FlakySource {
        async fn capture(&self, destination: &Path) -> Result<(), CaptureError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                return Err(CaptureError::Failed { reason: "camera busy".into() });
            }
            self.inner.capture(destination).await
        }
    }

    #[tokio::test]
    async fn failed_captures_do_not_advance_counters() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FlakySource { calls: AtomicU64::new(0), inner: ScriptedSource::new(dir.path(), 3) });
        let (ctx, _rx, _progress) = context(source.clone(), dir.path(), 300);
        let queue = ctx.queue.clone();

        let scheduler = CaptureScheduler::start(Duration::from_millis(1), ctx);
        while source.inner.captured() < 3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        scheduler.stop().await;

        let frames = queue.drain_all();
        let sequences: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert!(frames.iter().all(|f| f.path.exists()));
    }

    #[tokio::test]
    async fn stop_before_first_interval_elapses() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(dir.path(), 100));
        let (ctx, _rx, _progress) = context(source.clone(), dir.path(), 300);

        let scheduler = CaptureScheduler::start(Duration::from_secs(3600), ctx);
        while source.captured() < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::timeout(Duration::from_secs(5), scheduler.stop()).await.unwrap();
        assert_eq!(source.captured(), 1);
    }
}
