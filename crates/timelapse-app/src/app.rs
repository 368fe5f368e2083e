use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use timelapse_codec::{GstBackend, LoopbackBackend, MediaBackend};
use timelapse_core::OUTPUT_FPS;
use timelapse_pipeline::{FrameSource, SessionController, SessionOutcome};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{AppConfig, BackendKind};
use crate::publish::DirectoryPublisher;
use crate::source::{DirectoryFrameSource, GstFrameSource, DEFAULT_SOURCE_PIPELINE};

/// Log a progress line every this many frames (one second of output).
const PROGRESS_LOG_EVERY: u64 = OUTPUT_FPS as u64;

/// Record one session.
///
/// # Flow
/// 1. Load config (JSON file from the first argument, then `TIMELAPSE_*`)
/// 2. Pick the codec backend and frame source
/// 3. Start recording
/// 4. Stop on Ctrl-C or after `duration_secs`
/// 5. Compile, merge, publish; report the location or the cause
pub async fn run() -> Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref())?;
    debug!("Config: {:?}", config);

    // ── Codec backend ──────────────────────────────────────────────────────
    let backend: Arc<dyn MediaBackend> = match config.backend {
        BackendKind::Gstreamer => {
            Arc::new(GstBackend::new().context("Initialising GStreamer codec backend")?)
        }
        BackendKind::Loopback => Arc::new(LoopbackBackend),
    };
    info!("Codec backend: {}", backend.name());

    // ── Frame source ───────────────────────────────────────────────────────
    let source: Arc<dyn FrameSource> = match &config.source_dir {
        Some(dir) => Arc::new(DirectoryFrameSource::open(dir)?),
        None => Arc::new(GstFrameSource::start(
            config.source_pipeline.as_deref().unwrap_or(DEFAULT_SOURCE_PIPELINE),
        )?),
    };

    // ── Progress ───────────────────────────────────────────────────────────
    let (progress_tx, mut progress_rx) = mpsc::channel::<u64>(16);
    tokio::spawn(async move {
        while let Some(total) = progress_rx.recv().await {
            if total % PROGRESS_LOG_EVERY == 0 {
                info!(
                    "{} frames captured ({:.1}s of video)",
                    total,
                    total as f64 / OUTPUT_FPS as f64
                );
            }
        }
    });

    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("Creating work dir {}", config.work_dir.display()))?;
    let mut controller = SessionController::new(
        backend,
        source,
        Arc::new(DirectoryPublisher::new(&config.output_dir).with_extension(config.backend.artifact_extension())),
        Arc::new(progress_tx),
        &config.work_dir,
    );
    controller.start(config.session.clone()).context("Starting session")?;

    match config.duration_secs {
        Some(secs) => {
            info!("Recording for {}s (Ctrl-C to stop early)", secs);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                r = tokio::signal::ctrl_c() => r.context("Waiting for Ctrl-C")?,
            }
        }
        None => {
            info!("Recording. Press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await.context("Waiting for Ctrl-C")?;
        }
    }

    info!("Stopping after {} frames...", controller.frame_count());
    match controller.stop().await {
        Some(SessionOutcome::Completed { location }) => {
            info!("Time-lapse saved to {}", location.display());
            Ok(())
        }
        Some(SessionOutcome::Failed { cause }) => Err(anyhow::anyhow!("Session failed: {cause}")),
        None => Ok(()),
    }
}
