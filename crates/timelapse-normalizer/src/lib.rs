//! timelapse-normalizer: turns a captured still into an encoder input buffer.
//!
//! # Steps (per frame)
//!
//! ```text
//! JPEG/PNG on disk
//!   → decode, then thin by a power-of-two factor (size stays ≥ target)
//!   → rotate / flip per EXIF orientation
//!   → scale to the exact segment geometry
//!   → (optional) date + time overlay, top-right
//!   → RGB → NV12 (BT.601 integer coefficients)
//! ```
//!
//! A frame that fails to decode yields [`NormalizeError`]; the caller skips it.

mod orientation;
mod overlay;
mod yuv;

use std::path::Path;

use chrono::{DateTime, Local};
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageReader, RgbImage};
use timelapse_core::errors::NormalizeError;
use timelapse_core::{Frame, Resolution, ResolutionClass};
use tracing::debug;

pub use orientation::{oriented_size, sample_size};
pub use overlay::draw_timestamp;
pub use yuv::{nv12_len, rgb_to_nv12};

/// Size and orientation of a still, read without decoding pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    /// Stored pixel size, before orientation is applied.
    pub stored: Resolution,
    pub orientation: Orientation,
}

impl Probe {
    /// Size as displayed, after the orientation transform.
    pub fn oriented(&self) -> Resolution {
        oriented_size(self.stored, self.orientation)
    }
}

/// One NV12 buffer ready for the encoder.
#[derive(Debug, Clone)]
pub struct NormalizedFrame {
    pub data: Vec<u8>,
    pub resolution: Resolution,
}

/// Per-session normalizer settings.
#[derive(Debug, Clone, Copy)]
pub struct FrameNormalizer {
    resolution_class: ResolutionClass,
    show_timestamp: bool,
}

impl FrameNormalizer {
    pub fn new(resolution_class: ResolutionClass, show_timestamp: bool) -> Self {
        Self { resolution_class, show_timestamp }
    }

    /// Read a still's header: stored size and EXIF orientation.
    pub fn probe(&self, path: &Path) -> Result<Probe, NormalizeError> {
        let mut decoder = open_decoder(path)?;
        let orientation = decoder.orientation().map_err(|e| decode_error(path, e))?;
        let (width, height) = decoder.dimensions();
        Ok(Probe { stored: Resolution::new(width, height), orientation })
    }

    /// Video geometry for a segment whose first frame is `path`.
    pub fn segment_geometry(&self, path: &Path) -> Result<Resolution, NormalizeError> {
        let probe = self.probe(path)?;
        let geometry = self.resolution_class.fit(probe.oriented());
        debug!(
            "Segment geometry {} (source {} {:?}, class {})",
            geometry, probe.stored, probe.orientation, self.resolution_class
        );
        Ok(geometry)
    }

    /// Decode `frame` and convert it to an NV12 buffer of exactly `target`.
    pub fn normalize(&self, frame: &Frame, target: Resolution) -> Result<NormalizedFrame, NormalizeError> {
        let target = target.even();
        let rgb = self.load_rgb(&frame.path, target, frame.captured_at)?;
        Ok(NormalizedFrame { data: rgb_to_nv12(&rgb), resolution: target })
    }

    /// Decode, orient, scale and (optionally) annotate a still as RGB.
    ///
    /// `image` 0.25 has no scaled JPEG decode, so the still is decoded at full
    /// resolution and then thinned by the power-of-two [`sample_size`] factor
    /// with a nearest-neighbour pass. Peak memory is one full-size RGB buffer
    /// per frame; the reduced copy only bounds the cost of the final filter.
    pub fn load_rgb(
        &self,
        path: &Path,
        target: Resolution,
        captured_at: DateTime<Local>,
    ) -> Result<RgbImage, NormalizeError> {
        let mut decoder = open_decoder(path)?;
        let orientation = decoder.orientation().map_err(|e| decode_error(path, e))?;
        let (width, height) = decoder.dimensions();
        let stored = Resolution::new(width, height);

        let mut image = DynamicImage::from_decoder(decoder).map_err(|e| decode_error(path, e))?;

        // Compare against the target in stored orientation so a rotated
        // portrait still is not over-downsampled.
        let stored_target = oriented_size(target, orientation);
        let factor = sample_size(stored, stored_target);
        if factor > 1 {
            image = image.resize_exact(
                (width / factor).max(1),
                (height / factor).max(1),
                FilterType::Nearest,
            );
        }

        image.apply_orientation(orientation);

        let mut rgb = if image.width() != target.width || image.height() != target.height {
            image.resize_exact(target.width, target.height, FilterType::Triangle).to_rgb8()
        } else {
            image.to_rgb8()
        };

        if self.show_timestamp {
            draw_timestamp(&mut rgb, captured_at);
        }
        Ok(rgb)
    }
}

fn open_decoder(path: &Path) -> Result<impl ImageDecoder, NormalizeError> {
    ImageReader::open(path)?
        .with_guessed_format()?
        .into_decoder()
        .map_err(|e| decode_error(path, e))
}

fn decode_error(path: &Path, e: image::ImageError) -> NormalizeError {
    NormalizeError::Decode { path: path.to_path_buf(), reason: e.to_string() }
}
