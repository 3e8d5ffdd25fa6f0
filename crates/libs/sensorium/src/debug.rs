//! Debug dump helpers: save sensor frames as PNG images and draw box
//! outlines into colour buffers for visual inspection.

use std::path::Path;

use crate::{decode::BoundingBox2d, error::Error};

/// Saves a tightly packed 3-channel RGB buffer as a PNG.
pub fn save_rgb_png(
    path: impl AsRef<Path>,
    rgb: &[u8],
    width: u32,
    height: u32,
) -> Result<(), Error> {
    image::save_buffer(
        path,
        rgb,
        width,
        height,
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(())
}

/// Saves a single-channel float buffer as an 8-bit grayscale PNG, mapping
/// `[min, max]` linearly onto `[0, 255]`. Useful for depth and range scans.
pub fn save_gray_png(
    path: impl AsRef<Path>,
    values: &[f32],
    width: u32,
    height: u32,
    min: f32,
    max: f32,
) -> Result<(), Error> {
    let span = (max - min).max(f32::EPSILON);
    let pixels: Vec<u8> = values
        .iter()
        .map(|&v| (((v - min) / span).clamp(0.0, 1.0) * 255.0) as u8)
        .collect();
    image::save_buffer(path, &pixels, width, height, image::ExtendedColorType::L8)?;
    Ok(())
}

/// Draws one-pixel box outlines into an RGB buffer, clipping against the
/// image bounds. Box centers and sizes are in pixels.
pub fn draw_boxes_2d(
    rgb: &mut [u8],
    width: u32,
    height: u32,
    boxes: &[BoundingBox2d],
    color: [u8; 3],
) {
    let mut put = |x: i64, y: i64| {
        if x < 0 || y < 0 || x >= i64::from(width) || y >= i64::from(height) {
            return;
        }
        let at = 3 * (y as usize * width as usize + x as usize);
        rgb[at..at + 3].copy_from_slice(&color);
    };
    for b in boxes {
        let x0 = (b.center.x - b.size.x * 0.5).round() as i64;
        let x1 = (b.center.x + b.size.x * 0.5).round() as i64;
        let y0 = (b.center.y - b.size.y * 0.5).round() as i64;
        let y1 = (b.center.y + b.size.y * 0.5).round() as i64;
        for x in x0..=x1 {
            put(x, y0);
            put(x, y1);
        }
        for y in y0..=y1 {
            put(x0, y);
            put(x1, y);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec2;

    #[test]
    fn box_outline_stays_inside_the_image() {
        let mut rgb = vec![0u8; 4 * 4 * 3];
        let boxes = [BoundingBox2d {
            center: Vec2::new(0.0, 0.0),
            size: Vec2::new(10.0, 10.0),
            label: 1,
        }];
        draw_boxes_2d(&mut rgb, 4, 4, &boxes, [255, 0, 0]);
        // Out-of-bounds parts are clipped, nothing panics, and at least
        // the origin pixel is painted.
        assert_eq!(&rgb[0..3], &[255, 0, 0]);
    }

    #[test]
    fn outline_leaves_the_interior_untouched() {
        let mut rgb = vec![0u8; 8 * 8 * 3];
        let boxes = [BoundingBox2d {
            center: Vec2::new(4.0, 4.0),
            size: Vec2::new(4.0, 4.0),
            label: 0,
        }];
        draw_boxes_2d(&mut rgb, 8, 8, &boxes, [0, 255, 0]);
        let at = |x: usize, y: usize| &rgb[3 * (y * 8 + x)..3 * (y * 8 + x) + 3];
        assert_eq!(at(2, 2), &[0, 255, 0]);
        assert_eq!(at(6, 6), &[0, 255, 0]);
        assert_eq!(at(4, 4), &[0, 0, 0]);
    }
}
