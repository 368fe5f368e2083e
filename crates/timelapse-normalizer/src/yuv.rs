use image::RgbImage;
use timelapse_core::Resolution;

/// Byte length of an NV12 buffer: full-resolution luma plus one interleaved
/// U/V pair per 2×2 block.
pub fn nv12_len(resolution: Resolution) -> usize {
    let (w, h) = (resolution.width as usize, resolution.height as usize);
    w * h + w.div_ceil(2) * h.div_ceil(2) * 2
}

/// Convert RGB to semi-planar 4:2:0 (NV12: Y plane, then interleaved U,V).
///
/// BT.601 studio-swing integer coefficients. Chroma is point-sampled at even
/// rows and even columns.
pub fn rgb_to_nv12(image: &RgbImage) -> Vec<u8> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let luma_len = width * height;
    let mut out = vec![0u8; nv12_len(Resolution::new(image.width(), image.height()))];
    let (luma, chroma) = out.split_at_mut(luma_len);

    let mut uv = 0;
    for (row, pixels) in image.as_raw().chunks_exact(width * 3).enumerate() {
        for (col, px) in pixels.chunks_exact(3).enumerate() {
            let (r, g, b) = (px[0] as i32, px[1] as i32, px[2] as i32);

            let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            luma[row * width + col] = clamp(y);

            if row % 2 == 0 && col % 2 == 0 {
                let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                chroma[uv] = clamp(u);
                chroma[uv + 1] = clamp(v);
                uv += 2;
            }
        }
    }
    out
}

#[inline]
fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}
