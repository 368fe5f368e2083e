use chrono::{DateTime, Local};
use image::{Rgb, RgbImage};

const GLYPH_W: u32 = 5;
const GLYPH_H: u32 = 7;

/// Text height as a fraction of image width.
const TEXT_SIZE_RATIO: f32 = 0.025;

const TEXT: Rgb<u8> = Rgb([255, 255, 255]);
const SHADOW: Rgb<u8> = Rgb([0, 0, 0]);

/// Draw the capture date and time in the top-right corner: `YYYY-MM-DD` on
/// the first line, `HH:MM:SS` below it, white with a dark halo.
pub fn draw_timestamp(image: &mut RgbImage, captured_at: DateTime<Local>) {
    let date = captured_at.format("%Y-%m-%d").to_string();
    let time = captured_at.format("%H:%M:%S").to_string();

    let text_size = image.width() as f32 * TEXT_SIZE_RATIO;
    let scale = ((text_size / GLYPH_H as f32).round() as u32).max(1);
    let padding = (text_size * 0.8).round() as i64;
    let line_gap = (text_size * 0.3).round() as i64;
    let halo = ((text_size * 0.15) / 2.0).round().max(1.0) as i64;

    let line_height = (GLYPH_H * scale) as i64;
    let date_y = padding;
    let time_y = date_y + line_height + line_gap;

    let image_width = image.width() as i64;
    let placed = [(date.as_str(), date_y), (time.as_str(), time_y)]
        .map(|(text, y)| (text, image_width - text_width(text, scale) - padding, y));

    // Shadows first so no halo lands on top of an already drawn glyph.
    for &(text, x, y) in &placed {
        for dy in -halo..=halo {
            for dx in -halo..=halo {
                draw_text(image, text, x + dx, y + dy, scale, SHADOW);
            }
        }
    }
    for &(text, x, y) in &placed {
        draw_text(image, text, x, y, scale, TEXT);
    }
}

fn text_width(text: &str, scale: u32) -> i64 {
    let n = text.chars().count() as i64;
    if n == 0 {
        return 0;
    }
    n * ((GLYPH_W + 1) * scale) as i64 - scale as i64
}

fn draw_text(image: &mut RgbImage, text: &str, x: i64, y: i64, scale: u32, color: Rgb<u8>) {
    let advance = ((GLYPH_W + 1) * scale) as i64;
    for (i, ch) in text.chars().enumerate() {
        draw_glyph(image, glyph(ch), x + i as i64 * advance, y, scale, color);
    }
}

fn draw_glyph(image: &mut RgbImage, rows: [u8; 7], x: i64, y: i64, scale: u32, color: Rgb<u8>) {
    let (w, h) = (image.width() as i64, image.height() as i64);
    for (row, bits) in rows.iter().enumerate() {
        for col in 0..GLYPH_W {
            if bits & (1 << (GLYPH_W - 1 - col)) == 0 {
                continue;
            }
            for sy in 0..scale as i64 {
                for sx in 0..scale as i64 {
                    let px = x + col as i64 * scale as i64 + sx;
                    let py = y + row as i64 * scale as i64 + sy;
                    if px >= 0 && py >= 0 && px < w && py < h {
                        image.put_pixel(px as u32, py as u32, color);
                    }
                }
            }
        }
    }
}

/// 5×7 bitmap for the characters a timestamp needs; anything else is blank.
fn glyph(ch: char) -> [u8; 7] {
    match ch {
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '-' => [0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000],
        ':' => [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b01100, 0b00000],
        _ => [0; 7],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).single().unwrap()
    }

    #[test]
    fn text_size_tracks_image_width() {
        let mut small = RgbImage::new(400, 300);
        let mut large = RgbImage::new(1920, 1080);
        draw_timestamp(&mut small, sample_time());
        draw_timestamp(&mut large, sample_time());

        let lit = |img: &RgbImage| img.pixels().filter(|p| p.0 == [255, 255, 255]).count();
        assert!(lit(&large) > lit(&small) * 20);
    }

    #[test]
    fn text_is_right_aligned_with_padding() {
        let mut image = RgbImage::new(1920, 1080);
        draw_timestamp(&mut image, sample_time());

        // text_size = 48 → padding ≈ 38 px from the right edge.
        let rightmost = image
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0 == [255, 255, 255])
            .map(|(x, _, _)| x)
            .max()
            .unwrap();
        assert!(rightmost < 1920 - 30 && rightmost > 1920 - 50);
    }

    #[test]
    fn unknown_characters_render_blank() {
        assert_eq!(glyph('x'), [0; 7]);
        assert_ne!(glyph('7'), [0; 7]);
        assert_eq!(text_width("", 3), 0);
        assert_eq!(text_width("12", 1), 11);
    }
}
