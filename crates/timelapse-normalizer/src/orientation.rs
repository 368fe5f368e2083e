use image::metadata::Orientation;
use timelapse_core::Resolution;

/// Size of an image after `orientation` is applied to a still of `stored` size.
/// Quarter-turn orientations swap width and height. The mapping is its own
/// inverse, so it also converts an oriented size back to stored orientation.
pub fn oriented_size(stored: Resolution, orientation: Orientation) -> Resolution {
    match orientation {
        Orientation::Rotate90
        | Orientation::Rotate270
        | Orientation::Rotate90FlipH
        | Orientation::Rotate270FlipH => Resolution::new(stored.height, stored.width),
        _ => stored,
    }
}

/// Largest power-of-two downsample factor that keeps the decoded image at
/// least as large as `target` in both dimensions.
pub fn sample_size(source: Resolution, target: Resolution) -> u32 {
    let mut factor = 1;
    if source.height > target.height || source.width > target.width {
        let half_height = source.height / 2;
        let half_width = source.width / 2;
        while half_height / factor >= target.height && half_width / factor >= target.width {
            factor *= 2;
        }
    }
    factor
}
