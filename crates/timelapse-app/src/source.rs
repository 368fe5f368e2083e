//! Frame sources for the binary.
//!
//! | Source | Input |
//! |--------|-------|
//! | [`DirectoryFrameSource`] | Stills in a folder, replayed in name order and cycled |
//! | [`GstFrameSource`] | Latest frame of a GStreamer source pipeline, saved as JPEG |

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use gstreamer::prelude::*;
use gstreamer_app::AppSink;
use image::{ImageFormat, RgbImage};
use timelapse_core::errors::CaptureError;
use timelapse_pipeline::FrameSource;
use tracing::{debug, info};

/// Used when neither a source folder nor a pipeline is configured.
pub const DEFAULT_SOURCE_PIPELINE: &str = "videotestsrc is-live=true pattern=smpte";

const STILL_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Wait for the live source to deliver a frame.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

// ── DirectoryFrameSource ──────────────────────────────────────────────────────

pub struct DirectoryFrameSource {
    stills: Vec<PathBuf>,
    next: AtomicUsize,
}

impl DirectoryFrameSource {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut stills: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Reading source folder {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| STILL_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        if stills.is_empty() {
            bail!("No stills (jpg/png) in {}", dir.display());
        }
        stills.sort();
        info!("Replaying {} stills from {}", stills.len(), dir.display());
        Ok(Self { stills, next: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl FrameSource for DirectoryFrameSource {
    async fn capture(&self, destination: &Path) -> Result<(), CaptureError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.stills.len();
        tokio::fs::copy(&self.stills[index], destination).await?;
        Ok(())
    }
}

// ── GstFrameSource ────────────────────────────────────────────────────────────

/// Keeps a source pipeline running and snapshots its newest frame per capture.
///
/// ```text
/// <source description> ! videoconvert ! video/x-raw,format=RGB
///   ! appsink (max-buffers=1 drop=true)
/// ```
pub struct GstFrameSource {
    pipeline: gstreamer::Pipeline,
    appsink: AppSink,
}

impl GstFrameSource {
    pub fn start(source: &str) -> Result<Self> {
        gstreamer::init().context("Initialising GStreamer")?;

        let desc = format!(
            "{source} \
             ! videoconvert \
             ! video/x-raw,format=RGB \
             ! appsink name=sink max-buffers=1 drop=true sync=false emit-signals=false"
        );
        debug!("Source pipeline: {}", desc);

        let pipeline = gstreamer::parse::launch(&desc)
            .context("Parsing source pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("Expected a Pipeline"))?;
        let appsink = pipeline
            .by_name("sink")
            .context("Finding appsink 'sink'")?
            .downcast::<AppSink>()
            .map_err(|_| anyhow::anyhow!("Expected AppSink"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("Starting source pipeline")?;
        info!("Live source started: {}", source);
        Ok(Self { pipeline, appsink })
    }
}

#[async_trait]
impl FrameSource for GstFrameSource {
    async fn capture(&self, destination: &Path) -> Result<(), CaptureError> {
        let appsink = self.appsink.clone();
        let destination = destination.to_path_buf();
        tokio::task::spawn_blocking(move || snapshot(&appsink, &destination))
            .await
            .map_err(|e| CaptureError::Failed { reason: format!("capture task: {e}") })?
    }
}

impl Drop for GstFrameSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

fn snapshot(appsink: &AppSink, destination: &Path) -> Result<(), CaptureError> {
    let failed = |reason: String| CaptureError::Failed { reason };

    let timeout = gstreamer::ClockTime::from_mseconds(FRAME_TIMEOUT.as_millis() as u64);
    let sample = match appsink.try_pull_sample(timeout) {
        Some(sample) => sample,
        None if appsink.is_eos() => return Err(CaptureError::SourceClosed),
        None => return Err(failed("no frame within timeout".into())),
    };
    let caps = sample.caps().ok_or_else(|| failed("sample without caps".into()))?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).map_err(|e| failed(format!("caps: {e}")))?;
    let buffer = sample.buffer().ok_or_else(|| failed("sample without buffer".into()))?;
    let map = buffer.map_readable().map_err(|_| failed("failed to map buffer".into()))?;

    let width = info.width() as usize;
    let height = info.height() as usize;
    let stride = info.stride()[0] as usize;
    let offset = info.offset()[0];
    let row_bytes = width * 3;
    let data = map.as_slice();

    let mut pixels = Vec::with_capacity(row_bytes * height);
    for row in 0..height {
        let start = offset + row * stride;
        let line = data
            .get(start..start + row_bytes)
            .ok_or_else(|| failed("short frame buffer".into()))?;
        pixels.extend_from_slice(line);
    }
    let image = RgbImage::from_raw(info.width(), info.height(), pixels)
        .ok_or_else(|| failed("frame size mismatch".into()))?;
    image
        .save_with_format(destination, ImageFormat::Jpeg)
        .map_err(|e| failed(format!("saving {}: {e}", destination.display())))
}
