//! SessionController: lifecycle of one recording session.
//!
//! ```text
//! Idle ──start──▶ Recording ──stop──▶ Compiling ──▶ Completed | Failed
//! ```
//!
//! Starting creates a working directory, the compile worker and the capture
//! loop. Stopping halts capture, compiles the remainder, merges, publishes,
//! and removes the working directory. If publishing fails the compiled video
//! is first moved next to the working directory so it survives cleanup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use timelapse_codec::MediaBackend;
use timelapse_core::{SessionConfig, SessionError, SessionState};
use timelapse_normalizer::FrameNormalizer;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::collaborators::{FrameSource, ProgressSink, Publisher};
use crate::encoder::VideoEncoder;
use crate::scheduler::{CaptureContext, CaptureScheduler, SegmentQueue};
use crate::segments::SegmentManager;
use crate::worker::{CompileJob, CompileWorker};

/// Terminal result reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed { location: PathBuf },
    Failed { cause: String },
}

struct ActiveSession {
    work_dir: PathBuf,
    scheduler: CaptureScheduler,
    queue: Arc<SegmentQueue>,
    jobs: mpsc::Sender<CompileJob>,
    worker: JoinHandle<()>,
}

pub struct SessionController {
    backend: Arc<dyn MediaBackend>,
    source: Arc<dyn FrameSource>,
    publisher: Arc<dyn Publisher>,
    progress: Arc<dyn ProgressSink>,
    work_root: PathBuf,
    interval_override: Option<Duration>,
    state: SessionState,
    active: Option<ActiveSession>,
}

impl SessionController {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        source: Arc<dyn FrameSource>,
        publisher: Arc<dyn Publisher>,
        progress: Arc<dyn ProgressSink>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            source,
            publisher,
            progress,
            work_root: work_root.into(),
            interval_override: None,
            state: SessionState::Idle,
            active: None,
        }
    }

    /// Capture at `interval` instead of the one derived from the speed
    /// multiplier. Used for replaying stills from disk.
    pub fn with_capture_interval(mut self, interval: Duration) -> Self {
        self.interval_override = Some(interval);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Working directory of the running session, if any.
    pub fn work_dir(&self) -> Option<&Path> {
        self.active.as_ref().map(|s| s.work_dir.as_path())
    }

    /// Frames captured so far in the running session.
    pub fn frame_count(&self) -> u64 {
        self.active.as_ref().map(|s| s.queue.total()).unwrap_or(0)
    }

    /// Begin recording. Rejected while a session is recording or compiling.
    /// Must be called within a Tokio runtime.
    pub fn start(&mut self, config: SessionConfig) -> Result<(), SessionError> {
        if !self.state.accepts_start() {
            return Err(SessionError::AlreadyActive { state: self.state });
        }
        config.validate()?;

        let work_dir = self.work_root.join(work_dir_name());
        std::fs::create_dir_all(&work_dir)?;

        let backend = self.backend.clone();
        let queue = Arc::new(SegmentQueue::default());
        let normalizer = FrameNormalizer::new(config.resolution, config.show_timestamp);
        let worker = CompileWorker::new(
            VideoEncoder::new(backend.clone(), normalizer),
            SegmentManager::new(backend, &work_dir),
            queue.clone(),
            work_dir.clone(),
        );
        let (jobs, jobs_rx) = mpsc::channel(1);
        let worker = tokio::spawn(worker.run(jobs_rx));

        let interval = self.interval_override.unwrap_or_else(|| config.capture_interval());
        let scheduler = CaptureScheduler::start(
            interval,
            CaptureContext {
                source: self.source.clone(),
                progress: self.progress.clone(),
                queue: queue.clone(),
                jobs: jobs.clone(),
                frames_dir: work_dir.clone(),
            },
        );

        info!(
            "Recording started: {}× speed, {}, timestamp overlay {}, interval {}ms, dir {}",
            config.speed_multiplier,
            config.resolution,
            if config.show_timestamp { "on" } else { "off" },
            config.capture_interval_ms(),
            work_dir.display()
        );

        self.active = Some(ActiveSession { work_dir, scheduler, queue, jobs, worker });
        self.state = SessionState::Recording;
        Ok(())
    }

    /// Stop recording and produce the final artifact.
    ///
    /// Returns `None` (and does nothing) unless a session is recording.
    pub async fn stop(&mut self) -> Option<SessionOutcome> {
        if self.state != SessionState::Recording {
            info!("Stop ignored: session is {}", self.state);
            return None;
        }
        let session = self.active.take()?;
        self.state = SessionState::Compiling;

        session.scheduler.stop().await;
        info!("Recording stopped with {} frames; compiling", session.queue.total());

        let compiled = self.compile(&session).await;

        drop(session.jobs);
        if let Err(e) = session.worker.await {
            warn!("Compile worker ended abnormally: {}", e);
        }

        let result = match compiled {
            Ok(artifact) => self.publish(&artifact, &session.work_dir).await,
            Err(e) => Err(Failure { cause: e.to_string(), keep_work_dir: false }),
        };

        if matches!(&result, Err(Failure { keep_work_dir: true, .. })) {
            warn!("Keeping {} for recovery", session.work_dir.display());
        } else if let Err(e) = tokio::fs::remove_dir_all(&session.work_dir).await {
            warn!("Could not remove {}: {}", session.work_dir.display(), e);
        }

        let outcome = match result {
            Ok(location) => {
                info!("Session completed: {}", location.display());
                self.state = SessionState::Completed;
                SessionOutcome::Completed { location }
            }
            Err(Failure { cause, .. }) => {
                error!("Session failed: {}", cause);
                self.state = SessionState::Failed;
                SessionOutcome::Failed { cause }
            }
        };
        Some(outcome)
    }

    async fn compile(&self, session: &ActiveSession) -> Result<PathBuf, SessionError> {
        let (reply, reply_rx) = oneshot::channel();
        session
            .jobs
            .send(CompileJob::Finalize(reply))
            .await
            .map_err(|_| SessionError::WorkerGone)?;
        reply_rx.await.map_err(|_| SessionError::WorkerGone)?
    }

    /// Hand the artifact to the publisher. On failure the artifact is moved
    /// to `work_root` and the cause names where it went.
    async fn publish(&self, artifact: &Path, work_dir: &Path) -> Result<PathBuf, Failure> {
        let err = match self.publisher.publish(artifact).await {
            Ok(location) => return Ok(location),
            Err(e) => SessionError::from(e),
        };
        let (kept, keep_work_dir) = match keep_artifact(artifact, work_dir).await {
            Ok(kept) => (kept, false),
            Err(e) => {
                warn!("Could not move {} out of the work dir: {}", artifact.display(), e);
                (artifact.to_path_buf(), true)
            }
        };
        warn!("Publish failed; compiled video kept at {}", kept.display());
        Err(Failure { cause: format!("{} (video kept at {})", err, kept.display()), keep_work_dir })
    }
}

struct Failure {
    cause: String,
    keep_work_dir: bool,
}

/// Move `artifact` out of `work_dir` to a sibling file named after it.
async fn keep_artifact(artifact: &Path, work_dir: &Path) -> std::io::Result<PathBuf> {
    let parent = work_dir.parent().unwrap_or(work_dir);
    let stem = work_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let target = match artifact.extension() {
        Some(ext) => parent.join(format!("{}.{}", stem, ext.to_string_lossy())),
        None => parent.join(stem),
    };
    if tokio::fs::rename(artifact, &target).await.is_err() {
        tokio::fs::copy(artifact, &target).await?;
        tokio::fs::remove_file(artifact).await?;
    }
    Ok(target)
}

fn work_dir_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("timelapse_{}_{}", Local::now().format("%Y%m%d_%H%M%S"), &id[..8])
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use timelapse_codec::loopback::LoopbackContainer;
    use timelapse_codec::LoopbackBackend;
    use timelapse_core::FRAME_DURATION_US;

    use super::*;
    use crate::testutil::{FolderPublisher, LastCount, RecordingBackend, ScriptedSource};

    struct Harness {
        _dir: tempfile::TempDir,
        work_root: PathBuf,
        out_dir: PathBuf,
        source: Arc<ScriptedSource>,
        progress: Arc<LastCount>,
    }

    fn harness(limit: u64) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let work_root = dir.path().join("work");
        let out_dir = dir.path().join("out");
        std::fs::create_dir_all(&out_dir).unwrap();
        let source = Arc::new(ScriptedSource::new(dir.path(), limit));
        Harness { _dir: dir, work_root, out_dir, source, progress: Arc::new(LastCount::default()) }
    }

    fn controller(h: &Harness, publisher: FolderPublisher) -> SessionController {
        controller_on(h, publisher, Arc::new(LoopbackBackend))
    }

    fn controller_on(h: &Harness, publisher: FolderPublisher, backend: Arc<dyn MediaBackend>) -> SessionController {
        SessionController::new(
            backend,
            h.source.clone(),
            Arc::new(publisher),
            h.progress.clone(),
            &h.work_root,
        )
        .with_capture_interval(Duration::from_millis(1))
    }

    async fn wait_for_captures(h: &Harness, count: u64) {
        while h.source.captured() < count {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn session_dirs(h: &Harness) -> usize {
        std::fs::read_dir(&h.work_root).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn seven_hundred_frames_become_one_merged_video() {
        let h = harness(700);
        let backend = Arc::new(RecordingBackend::default());
        let mut session = controller_on(&h, FolderPublisher::new(&h.out_dir), backend.clone());
        session.start(SessionConfig::default()).unwrap();
        assert_eq!(session.state(), SessionState::Recording);

        wait_for_captures(&h, 700).await;
        let outcome = session.stop().await.unwrap();

        let SessionOutcome::Completed { location } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(h.progress.0.load(Ordering::SeqCst), 700);
        assert_eq!(backend.segment_sample_counts(), vec![300, 300, 100]);

        let container = LoopbackContainer::read(&location).unwrap();
        assert_eq!(container.samples.len(), 700);
        let last = container.samples.last().unwrap();
        assert_eq!(last.pts_us + FRAME_DURATION_US, 700 * FRAME_DURATION_US);
        assert_eq!(session_dirs(&h), 0);
    }

    #[tokio::test]
    async fn short_session_publishes_its_only_segment() {
        let h = harness(12);
        let mut session = controller(&h, FolderPublisher::new(&h.out_dir));
        session.start(SessionConfig::default()).unwrap();
        wait_for_captures(&h, 12).await;

        let Some(SessionOutcome::Completed { location }) = session.stop().await else {
            panic!("expected completion");
        };
        assert_eq!(location, h.out_dir.join("published.mp4"));
        assert_eq!(LoopbackContainer::read(&location).unwrap().samples.len(), 12);
    }

    #[tokio::test]
    async fn stop_without_frames_fails_and_cleans_up() {
        let h = harness(0);
        let mut session = controller(&h, FolderPublisher::new(&h.out_dir));
        session.start(SessionConfig::default()).unwrap();
        let work_dir = session.work_dir().unwrap().to_path_buf();
        assert!(work_dir.is_dir());

        let outcome = session.stop().await.unwrap();
        assert_eq!(outcome, SessionOutcome::Failed { cause: SessionError::NoFrames.to_string() });
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!work_dir.exists());
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_recording() {
        let h = harness(1);
        let mut session = controller(&h, FolderPublisher::new(&h.out_dir));
        session.start(SessionConfig::default()).unwrap();

        let err = session.start(SessionConfig::default()).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive { state: SessionState::Recording }));
        assert_eq!(session_dirs(&h), 1);

        wait_for_captures(&h, 1).await;
        assert!(session.stop().await.is_some());
    }

    #[tokio::test]
    async fn stop_is_a_no_op_when_not_recording() {
        let h = harness(3);
        let mut session = controller(&h, FolderPublisher::new(&h.out_dir));
        assert!(session.stop().await.is_none());

        session.start(SessionConfig::default()).unwrap();
        wait_for_captures(&h, 3).await;
        assert!(session.stop().await.is_some());
        assert!(session.stop().await.is_none());
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn publish_failure_keeps_compiled_video() {
        let h = harness(5);
        let mut publisher = FolderPublisher::new(&h.out_dir);
        publisher.fail = true;
        let mut session = controller(&h, publisher);
        session.start(SessionConfig::default()).unwrap();
        let work_dir = session.work_dir().unwrap().to_path_buf();
        wait_for_captures(&h, 5).await;

        let Some(SessionOutcome::Failed { cause }) = session.stop().await else {
            panic!("expected failure");
        };
        assert_eq!(session.state(), SessionState::Failed);
        assert!(cause.starts_with("Publish failed: storage full"), "{cause}");

        let kept = work_dir.with_extension("mp4");
        assert!(cause.contains(&*kept.to_string_lossy()), "{cause}");
        assert!(!work_dir.exists());
        let surviving: Vec<PathBuf> =
            std::fs::read_dir(&h.work_root).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(surviving, vec![kept.clone()]);
        assert_eq!(LoopbackContainer::read(&kept).unwrap().samples.len(), 5);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let h = harness(0);
        let mut session = controller(&h, FolderPublisher::new(&h.out_dir));
        let config = SessionConfig { speed_multiplier: 0, ..Default::default() };
        assert!(matches!(session.start(config), Err(SessionError::InvalidConfig { .. })));
        assert_eq!(session.state(), SessionState::Idle);
    }
}
