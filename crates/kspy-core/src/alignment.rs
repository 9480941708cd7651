//! Face crop normalization for the encoder.
//!
//! The detection seam only carries `(top, right, bottom, left)` boxes, so
//! faces are normalized by cropping a square region centred on the box,
//! widened by a fixed margin, and resampling it to the encoder's input size.

use crate::types::FaceBox;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

/// Edge of the square crop handed to ArcFace.
pub const ALIGNED_SIZE: u32 = 112;

/// Extra context around the box, as a fraction of its longest edge.
const CROP_MARGIN: f32 = 0.1;

/// Square source region for a face box: `(x, y, edge)`.
///
/// May extend past the frame; out-of-frame pixels are filled with black.
fn square_region(face: &FaceBox) -> (i64, i64, u32) {
    let w = face.width().max(1) as f32;
    let h = face.height().max(1) as f32;
    let edge = (w.max(h) * (1.0 + 2.0 * CROP_MARGIN)).round().max(1.0);
    let cx = face.left as f32 + w / 2.0;
    let cy = face.top as f32 + h / 2.0;
    (
        (cx - edge / 2.0).round() as i64,
        (cy - edge / 2.0).round() as i64,
        edge as u32,
    )
}

/// Crop and resample one face to an `ALIGNED_SIZE` square.
pub fn crop_face(frame: &RgbImage, face: &FaceBox) -> RgbImage {
    let (x0, y0, edge) = square_region(face);

    let mut square = RgbImage::from_pixel(edge, edge, Rgb([0, 0, 0]));
    let (fw, fh) = (frame.width() as i64, frame.height() as i64);
    for y in 0..edge {
        let sy = y0 + y as i64;
        if sy < 0 || sy >= fh {
            continue;
        }
        for x in 0..edge {
            let sx = x0 + x as i64;
            if sx < 0 || sx >= fw {
                continue;
            }
            square.put_pixel(x, y, *frame.get_pixel(sx as u32, sy as u32));
        }
    }

    if edge == ALIGNED_SIZE {
        square
    } else {
        imageops::resize(&square, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle)
    }
}
