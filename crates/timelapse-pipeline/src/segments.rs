//! SegmentManager: ordered segment list and stream-copy concatenation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use timelapse_codec::{ContainerMuxer, MediaBackend, SampleExtractor, TrackFormat};
use timelapse_core::errors::MergeError;
use timelapse_core::{presentation_time_us, Segment, SessionError};
use tracing::{debug, info, warn};

pub const MERGED_FILE_NAME: &str = "timelapse_merged.mp4";

pub struct SegmentManager {
    backend: Arc<dyn MediaBackend>,
    work_dir: PathBuf,
    segments: Vec<Segment>,
}

impl SegmentManager {
    pub fn new(backend: Arc<dyn MediaBackend>, work_dir: impl Into<PathBuf>) -> Self {
        Self { backend, work_dir: work_dir.into(), segments: Vec::new() }
    }

    pub fn push(&mut self, segment: Segment) {
        debug!("Segment {} registered ({} frames)", segment.index, segment.frame_count);
        self.segments.push(segment);
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn total_frames(&self) -> usize {
        self.segments.iter().map(|s| s.frame_count).sum()
    }

    /// Consume the segment list and produce the single final artifact.
    ///
    /// One segment is returned as-is. Several are merged into
    /// [`MERGED_FILE_NAME`] and then deleted.
    pub fn finalize(&mut self) -> Result<PathBuf, SessionError> {
        let segments = std::mem::take(&mut self.segments);
        match segments.as_slice() {
            [] => Err(SessionError::NoFrames),
            [only] => {
                info!("Single segment, no merge needed: {}", only.path.display());
                Ok(only.path.clone())
            }
            many => {
                let output = self.work_dir.join(MERGED_FILE_NAME);
                let samples = merge_segments(self.backend.as_ref(), many, &output)?;
                info!("Merged {} segments ({} samples) → {}", many.len(), samples, output.display());
                for segment in many {
                    if let Err(e) = fs::remove_file(&segment.path) {
                        warn!("Could not delete {}: {}", segment.path.display(), e);
                    }
                }
                Ok(output)
            }
        }
    }
}

/// Concatenate `segments` into `output` without re-encoding.
///
/// The track format comes from the first segment. Sample timestamps are
/// rewritten to `n × FRAME_DURATION_US` across the whole output; sync flags
/// are kept. Returns the number of samples written.
pub fn merge_segments(
    backend: &dyn MediaBackend,
    segments: &[Segment],
    output: &Path,
) -> Result<u64, MergeError> {
    let Some(first) = segments.first() else {
        return Ok(0);
    };
    let first_extractor = backend.open_extractor(&first.path)?;
    let format = first_extractor
        .track_format()
        .cloned()
        .ok_or_else(|| MergeError::NoVideoTrack { path: first.path.clone() })?;

    let mut muxer = backend.create_muxer(output)?;
    let copied = copy_samples(backend, muxer.as_mut(), first_extractor, &format, segments);
    let stopped = muxer.stop();
    muxer.release();

    let samples = copied?;
    stopped?;
    Ok(samples)
}

fn copy_samples(
    backend: &dyn MediaBackend,
    muxer: &mut dyn ContainerMuxer,
    first_extractor: Box<dyn SampleExtractor>,
    format: &TrackFormat,
    segments: &[Segment],
) -> Result<u64, MergeError> {
    let track = muxer.add_track(format)?;
    muxer.start()?;

    let mut written: u64 = 0;
    let mut pending_first = Some(first_extractor);
    for segment in segments {
        let mut extractor = match pending_first.take() {
            Some(extractor) => extractor,
            None => backend.open_extractor(&segment.path)?,
        };
        let found = extractor
            .track_format()
            .cloned()
            .ok_or_else(|| MergeError::NoVideoTrack { path: segment.path.clone() })?;
        if !format.is_compatible(&found) {
            extractor.release();
            return Err(MergeError::FormatMismatch {
                path: segment.path.clone(),
                expected: format.to_string(),
                found: found.to_string(),
            });
        }

        let before = written;
        while let Some(mut sample) = extractor.read_sample()? {
            if sample.flags.codec_config || sample.data.is_empty() {
                continue;
            }
            sample.pts_us = presentation_time_us(written);
            muxer.write_sample(track, &sample)?;
            written += 1;
        }
        extractor.release();
        debug!("Copied {} samples from {}", written - before, segment.path.display());
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use timelapse_codec::loopback::LoopbackContainer;
    use timelapse_codec::{EncodedSample, LoopbackBackend, SampleFlags, H264_MIME};
    use timelapse_core::{Resolution, ResolutionClass, FRAME_DURATION_US};
    use timelapse_normalizer::FrameNormalizer;

    use super::*;
    use crate::encoder::VideoEncoder;
    use crate::testutil::{gst_backend, read_samples, write_frames_sized};

    fn track(width: u32) -> TrackFormat {
        TrackFormat {
            mime: H264_MIME.into(),
            resolution: Resolution::new(width, 12),
            fps: 30,
            codec_data: None,
        }
    }

    /// Segment whose samples carry `tag` and restart at pts 0, every fifth one sync.
    fn write_segment(dir: &Path, index: usize, frames: usize, tag: u8, format: TrackFormat) -> Segment {
        let path = dir.join(Segment::file_name(index));
        let samples = (0..frames)
            .map(|i| EncodedSample {
                data: Bytes::from(vec![tag, i as u8]),
                pts_us: i as u64 * FRAME_DURATION_US,
                flags: SampleFlags { sync: i % 5 == 0, ..Default::default() },
            })
            .collect();
        LoopbackContainer { format: Some(format), samples }.write(&path).unwrap();
        Segment { index, path, frame_count: frames }
    }

    fn manager(dir: &Path) -> SegmentManager {
        SegmentManager::new(Arc::new(LoopbackBackend), dir)
    }

    #[test]
    fn merge_preserves_order_and_rewrites_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let mut segments = manager(dir.path());
        for (index, (frames, tag)) in [(300, 0u8), (300, 1), (100, 2)].into_iter().enumerate() {
            segments.push(write_segment(dir.path(), index, frames, tag, track(16)));
        }
        assert_eq!(segments.total_frames(), 700);

        let merged = segments.finalize().unwrap();
        assert_eq!(merged, dir.path().join(MERGED_FILE_NAME));
        assert!(segments.segments().is_empty());

        let container = LoopbackContainer::read(&merged).unwrap();
        assert_eq!(container.samples.len(), 700);
        let tags: Vec<u8> = container.samples.iter().map(|s| s.data[0]).collect();
        assert!(tags.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(tags.iter().filter(|&&t| t == 2).count(), 100);
        for (n, sample) in container.samples.iter().enumerate() {
            assert_eq!(sample.pts_us, n as u64 * FRAME_DURATION_US);
        }
        // Sync flags travel with their samples, not their new positions.
        assert!(container.samples[300].flags.sync);
        assert!(!container.samples[301].flags.sync);
        assert_eq!(container.samples[699].pts_us, 699 * FRAME_DURATION_US);

        for index in 0..3 {
            assert!(!dir.path().join(Segment::file_name(index)).exists());
        }
    }

    #[test]
    fn single_segment_passes_through_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut segments = manager(dir.path());
        let only = write_segment(dir.path(), 0, 42, 7, track(16));
        let before = std::fs::read(&only.path).unwrap();
        segments.push(only.clone());

        let artifact = segments.finalize().unwrap();
        assert_eq!(artifact, only.path);
        assert_eq!(std::fs::read(&artifact).unwrap(), before);
        assert!(!dir.path().join(MERGED_FILE_NAME).exists());
    }

    #[test]
    fn no_segments_means_no_frames() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(manager(dir.path()).finalize(), Err(SessionError::NoFrames)));
    }

    #[test]
    fn mismatched_geometry_aborts_merge_and_keeps_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut segments = manager(dir.path());
        segments.push(write_segment(dir.path(), 0, 3, 0, track(16)));
        segments.push(write_segment(dir.path(), 1, 3, 1, track(32)));

        let err = segments.finalize().unwrap_err();
        assert!(matches!(err, SessionError::Merge(MergeError::FormatMismatch { .. })));
        assert!(dir.path().join(Segment::file_name(0)).exists());
        assert!(dir.path().join(Segment::file_name(1)).exists());
    }

    #[test]
    fn missing_track_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(Segment::file_name(0));
        LoopbackContainer::default().write(&path).unwrap();
        let segments = [
            Segment { index: 0, path, frame_count: 1 },
            write_segment(dir.path(), 1, 1, 0, track(16)),
        ];

        let err = merge_segments(&LoopbackBackend, &segments, &dir.path().join("out.mp4")).unwrap_err();
        assert!(matches!(err, MergeError::NoVideoTrack { .. }));
    }

    #[test]
    fn gst_segments_concatenate_without_reencoding() {
        let Some(backend) = gst_backend() else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let encoder = VideoEncoder::new(backend.clone(), FrameNormalizer::new(ResolutionClass::Hd, false));
        let frames = write_frames_sized(dir.path(), 20, 64, 48);
        let segments: Vec<Segment> = frames
            .chunks(10)
            .enumerate()
            .map(|(index, batch)| {
                let output = dir.path().join(Segment::file_name(index));
                encoder.encode_segment(index, batch, &output).unwrap()
            })
            .collect();

        let output = dir.path().join(MERGED_FILE_NAME);
        assert_eq!(merge_segments(backend.as_ref(), &segments, &output).unwrap(), 20);

        let (format, samples) = read_samples(backend.as_ref(), &output);
        assert_eq!(format.resolution, Resolution::new(64, 48));
        assert_eq!(samples.len(), 20);
        assert!(samples[0].flags.sync);
        assert!(samples[10].flags.sync);
        assert!(samples.windows(2).all(|pair| pair[1].pts_us > pair[0].pts_us));
    }
}
