//! Fixtures shared by the pipeline tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use image::{Rgb, RgbImage};
use timelapse_codec::{
    ContainerMuxer, EncodedSample, EncoderSettings, FrameEncoder, GstBackend, LoopbackBackend,
    MediaBackend, SampleExtractor, TrackFormat,
};
use timelapse_core::errors::{CaptureError, CodecError, PublishError};
use timelapse_core::Frame;

use crate::collaborators::{FrameSource, ProgressSink, Publisher};

/// Small solid-colour JPEG.
pub fn write_still(path: &Path, width: u32, height: u32, shade: u8) {
    RgbImage::from_pixel(width, height, Rgb([shade, shade, shade]))
        .save(path)
        .unwrap();
}

/// `count` stills named the way the scheduler names them.
pub fn write_frames(dir: &Path, count: u64) -> Vec<Frame> {
    write_frames_sized(dir, count, 16, 12)
}

pub fn write_frames_sized(dir: &Path, count: u64, width: u32, height: u32) -> Vec<Frame> {
    (0..count)
        .map(|sequence| {
            let path = dir.join(Frame::file_name(sequence));
            write_still(&path, width, height, (sequence % 200) as u8 + 20);
            Frame { sequence, path, captured_at: Local::now() }
        })
        .collect()
}

/// Copies a template still on every call until `limit` captures succeeded,
/// then reports the source as closed.
pub struct ScriptedSource {
    template: PathBuf,
    limit: u64,
    captured: AtomicU64,
}

impl ScriptedSource {
    pub fn new(dir: &Path, limit: u64) -> Self {
        let template = dir.join("template.jpg");
        write_still(&template, 16, 12, 90);
        Self { template, limit, captured: AtomicU64::new(0) }
    }

    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn capture(&self, destination: &Path) -> Result<(), CaptureError> {
        if self.captured.load(Ordering::SeqCst) >= self.limit {
            return Err(CaptureError::SourceClosed);
        }
        tokio::fs::copy(&self.template, destination).await?;
        self.captured.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Moves the artifact into `dir`, or fails on demand.
pub struct FolderPublisher {
    pub dir: PathBuf,
    pub fail: bool,
    pub published: Mutex<Vec<PathBuf>>,
}

impl FolderPublisher {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf(), fail: false, published: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl Publisher for FolderPublisher {
    async fn publish(&self, artifact: &Path) -> Result<PathBuf, PublishError> {
        if self.fail {
            return Err(PublishError::Failed { reason: "storage full".into() });
        }
        let target = self.dir.join("published.mp4");
        tokio::fs::rename(artifact, &target).await?;
        self.published.lock().unwrap().push(target.clone());
        Ok(target)
    }
}

/// Records the latest reported count.
#[derive(Default)]
pub struct LastCount(pub AtomicU64);

impl ProgressSink for LastCount {
    fn on_frame_count(&self, total: u64) {
        self.0.store(total, Ordering::SeqCst);
    }
}

/// Loopback backend that logs, per finished container, its file name and
/// the number of media samples written to it.
#[derive(Default)]
pub struct RecordingBackend {
    inner: LoopbackBackend,
    written: Arc<Mutex<Vec<(String, usize)>>>,
}

impl RecordingBackend {
    /// Sample counts of every `segment_*` container, in the order they were
    /// finished.
    pub fn segment_sample_counts(&self) -> Vec<usize> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name.starts_with("segment_"))
            .map(|(_, count)| *count)
            .collect()
    }
}

impl MediaBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn create_encoder(&self, settings: &EncoderSettings) -> Result<Box<dyn FrameEncoder>, CodecError> {
        self.inner.create_encoder(settings)
    }

    fn create_muxer(&self, path: &Path) -> Result<Box<dyn ContainerMuxer>, CodecError> {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        Ok(Box::new(RecordingMuxer {
            inner: self.inner.create_muxer(path)?,
            name,
            samples: 0,
            written: self.written.clone(),
        }))
    }

    fn open_extractor(&self, path: &Path) -> Result<Box<dyn SampleExtractor>, CodecError> {
        self.inner.open_extractor(path)
    }
}

struct RecordingMuxer {
    inner: Box<dyn ContainerMuxer>,
    name: String,
    samples: usize,
    written: Arc<Mutex<Vec<(String, usize)>>>,
}

impl ContainerMuxer for RecordingMuxer {
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize, CodecError> {
        self.inner.add_track(format)
    }

    fn start(&mut self) -> Result<(), CodecError> {
        self.inner.start()
    }

    fn write_sample(&mut self, track: usize, sample: &EncodedSample) -> Result<(), CodecError> {
        if !sample.flags.codec_config && !sample.data.is_empty() {
            self.samples += 1;
        }
        self.inner.write_sample(track, sample)
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        self.written.lock().unwrap().push((self.name.clone(), self.samples));
        self.inner.stop()
    }

    fn release(&mut self) {
        self.inner.release()
    }
}

/// The system GStreamer backend, or `None` when its plugins are missing.
/// Tests that need real H.264 return early on `None`.
pub fn gst_backend() -> Option<Arc<GstBackend>> {
    match GstBackend::new() {
        Ok(backend) => Some(Arc::new(backend)),
        Err(e) => {
            eprintln!("GStreamer unavailable, skipping: {e}");
            None
        }
    }
}

/// Track format and media samples of a container, in decode order.
pub fn read_samples(backend: &dyn MediaBackend, path: &Path) -> (TrackFormat, Vec<EncodedSample>) {
    let mut extractor = backend.open_extractor(path).unwrap();
    let format = extractor.track_format().cloned().unwrap();
    let mut samples = Vec::new();
    while let Some(sample) = extractor.read_sample().unwrap() {
        if !sample.flags.codec_config && !sample.data.is_empty() {
            samples.push(sample);
        }
    }
    extractor.release();
    (format, samples)
}
