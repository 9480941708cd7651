//! Drawing recognized faces onto images.

use crate::types::{FaceBox, Identity, TrackedBox};
use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

const ACCENT_COLOR: Rgb<u8> = Rgb([0, 0, 255]); // blue
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const OUTLINE_WIDTH: i32 = 4;
const LABEL_FONT_SIZE: f32 = 48.0;
/// Horizontal padding on each side of the label text.
const LABEL_PAD_X: i32 = 16;
/// The tag overlaps the bottom edge of the box by this much.
const LABEL_LIFT: i32 = 12;
const LABEL_PAD_BOTTOM: i32 = 4;
/// Rough per-character advance when no font is loaded.
const FALLBACK_CHAR_WIDTH: f32 = 0.55;

const LIVE_COLOR: Rgb<u8> = Rgb([255, 0, 0]); // red
const LIVE_OUTLINE_WIDTH: i32 = 2;
const LIVE_FONT_SIZE: f32 = 36.0;
const LIVE_NAMES_ORIGIN: (i32, i32) = (40, 80);
const LIVE_NAMES_STEP: i32 = 40;

/// Fonts probed when no font path is configured.
pub const SYSTEM_FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
];

#[derive(Error, Debug)]
pub enum FontError {
    #[error("failed to read font {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid font file {0}")]
    Invalid(PathBuf),
}

/// Load a TTF/OTF font from disk.
pub fn load_font(path: &Path) -> Result<FontVec, FontError> {
    let bytes = std::fs::read(path).map_err(|source| FontError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    FontVec::try_from_vec(bytes).map_err(|_| FontError::Invalid(path.to_path_buf()))
}

/// Renders face boxes and labels.
///
/// Without a font the label tags are still drawn, sized from an estimated
/// text width, but the text itself is omitted.
pub struct Annotator {
    font: Option<FontVec>,
    warned_missing_font: AtomicBool,
}

impl Annotator {
    pub fn new(font: Option<FontVec>) -> Self {
        Self {
            font,
            warned_missing_font: AtomicBool::new(false),
        }
    }

    /// Use the configured font, or the first system font that loads.
    pub fn from_font_path(path: Option<&Path>) -> Self {
        let font = match path {
            Some(p) => match load_font(p) {
                Ok(f) => Some(f),
                Err(e) => {
                    tracing::warn!(error = %e, "configured font unavailable; labels will have no text");
                    None
                }
            },
            None => SYSTEM_FONT_CANDIDATES
                .iter()
                .find_map(|p| load_font(Path::new(p)).ok()),
        };
        Self::new(font)
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Outline a face and attach a filled label tag just below it.
    pub fn annotate_face(&self, image: &mut RgbImage, face: &FaceBox, identity: &Identity) {
        let label = identity.to_string();
        draw_outline(image, face, OUTLINE_WIDTH, ACCENT_COLOR);

        let scale = PxScale::from(LABEL_FONT_SIZE);
        let (text_w, text_h) = self.measure(scale, &label);

        let text_x = face.left + LABEL_PAD_X;
        let text_y = face.bottom - LABEL_LIFT;
        let tag_w = text_w as i32 + 2 * LABEL_PAD_X;
        let tag_h = text_h as i32 + LABEL_PAD_BOTTOM;

        if let Some(tag) = clipped_rect(image, face.left, text_y, tag_w, tag_h) {
            draw_filled_rect_mut(image, tag, ACCENT_COLOR);
        }

        match &self.font {
            Some(font) => draw_text_mut(image, TEXT_COLOR, text_x, text_y, scale, font, &label),
            None => self.warn_missing_font(),
        }
    }

    /// Draw live-session boxes and the stacked name list.
    ///
    /// Names are placed by list index, not next to any particular box.
    pub fn draw_live_overlay(&self, frame: &mut RgbImage, boxes: &[TrackedBox], names: &[Identity]) {
        for tracked in boxes {
            draw_outline(frame, &tracked.to_face_box(), LIVE_OUTLINE_WIDTH, LIVE_COLOR);
        }

        let Some(font) = &self.font else {
            if !names.is_empty() {
                self.warn_missing_font();
            }
            return;
        };
        let scale = PxScale::from(LIVE_FONT_SIZE);
        let (x, y0) = LIVE_NAMES_ORIGIN;
        for (i, identity) in names.iter().enumerate() {
            // The origin is the text baseline; imageproc draws from the top.
            let y = y0 + i as i32 * LIVE_NAMES_STEP - LIVE_FONT_SIZE as i32;
            draw_text_mut(frame, LIVE_COLOR, x, y, scale, font, &identity.to_string());
        }
    }

    fn measure(&self, scale: PxScale, text: &str) -> (u32, u32) {
        match &self.font {
            Some(font) => text_size(scale, font, text),
            None => (
                (text.chars().count() as f32 * scale.x * FALLBACK_CHAR_WIDTH) as u32,
                scale.y as u32,
            ),
        }
    }

    fn warn_missing_font(&self) {
        if !self.warned_missing_font.swap(true, Ordering::Relaxed) {
            tracing::warn!("no font loaded; drawing label tags without text");
        }
    }
}

/// Clip a rectangle to the image; `None` when nothing is visible.
fn clipped_rect(image: &RgbImage, x: i32, y: i32, w: i32, h: i32) -> Option<Rect> {
    let x0 = x.max(0);
    let y0 = y.max(0);
    let x1 = (x + w).min(image.width() as i32);
    let y1 = (y + h).min(image.height() as i32);
    (x1 > x0 && y1 > y0).then(|| Rect::at(x0, y0).of_size((x1 - x0) as u32, (y1 - y0) as u32))
}

/// Outline `face` with `width` pixels drawn inward from its edges.
fn draw_outline(image: &mut RgbImage, face: &FaceBox, width: i32, color: Rgb<u8>) {
    for i in 0..width {
        let w = face.width() + 1 - 2 * i;
        let h = face.height() + 1 - 2 * i;
        if w <= 0 || h <= 0 {
            break;
        }
        draw_hollow_rect_mut(
            image,
            Rect::at(face.left + i, face.top + i).of_size(w as u32, h as u32),
            color,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

    #[test]
    fn test_outline_and_tag_without_font() {
        let mut img = RgbImage::from_pixel(200, 200, BLACK);
        let annotator = Annotator::new(None);
        annotator.annotate_face(
            &mut img,
            &FaceBox::new(20, 120, 100, 20),
            &Identity::Known("alice".into()),
        );

        // Outline on all four edges, inset up to the outline width.
        assert_eq!(*img.get_pixel(20, 50), ACCENT_COLOR);
        assert_eq!(*img.get_pixel(23, 50), ACCENT_COLOR);
        assert_eq!(*img.get_pixel(120, 50), ACCENT_COLOR);
        assert_eq!(*img.get_pixel(70, 20), ACCENT_COLOR);
        // Interior untouched.
        assert_eq!(*img.get_pixel(70, 50), BLACK);
        // Tag fills just below the box.
        assert_eq!(*img.get_pixel(30, 110), ACCENT_COLOR);
    }

    #[test]
    fn test_tag_grows_with_label_length() {
        let annotator = Annotator::new(None);
        let scale = PxScale::from(LABEL_FONT_SIZE);
        let (short, _) = annotator.measure(scale, "al");
        let (long, _) = annotator.measure(scale, "alexandria");
        assert!(long > short);
    }

    #[test]
    fn test_annotate_near_edge_does_not_panic() {
        let mut img = RgbImage::from_pixel(50, 50, BLACK);
        let annotator = Annotator::new(None);
        annotator.annotate_face(&mut img, &FaceBox::new(30, 49, 49, 30), &Identity::Unknown);
        annotator.annotate_face(&mut img, &FaceBox::new(0, 0, 0, 0), &Identity::Unknown);
    }

    #[test]
    fn test_live_overlay_draws_rounded_boxes() {
        let mut img = RgbImage::from_pixel(100, 100, BLACK);
        let annotator = Annotator::new(None);
        let tracked = TrackedBox {
            top: 10.4,
            right: 50.6,
            bottom: 50.2,
            left: 9.6,
        };
        annotator.draw_live_overlay(&mut img, &[tracked], &[Identity::Unknown]);
        assert_eq!(*img.get_pixel(10, 30), LIVE_COLOR);
        assert_eq!(*img.get_pixel(51, 30), LIVE_COLOR);
        assert_eq!(*img.get_pixel(30, 30), BLACK);
    }

    #[test]
    fn test_clipped_rect() {
        let img = RgbImage::new(100, 100);
        let r = clipped_rect(&img, -10, 90, 50, 50).unwrap();
        assert_eq!((r.left(), r.top(), r.width(), r.height()), (0, 90, 40, 10));
        assert!(clipped_rect(&img, 100, 0, 10, 10).is_none());
    }

    #[test]
    fn test_missing_font_path_falls_back_to_none() {
        let annotator = Annotator::from_font_path(Some(Path::new("/nonexistent/font.ttf")));
        assert!(!annotator.has_font());
    }
}
