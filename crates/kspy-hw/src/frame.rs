//! Frame type and pixel conversions from camera formats to RGB.

use image::RgbImage;

/// A captured camera frame, converted to RGB.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Driver frame counter; gaps mean dropped frames.
    pub sequence: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 limited-range integer
/// coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share
/// the chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("YUYV", yuyv, pixels * 2)?;

    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in yuyv[..pixels * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    // Odd widths leave a trailing half pair.
    if pixels % 2 == 1 {
        let tail = &yuyv[(pixels - 1) * 2..];
        let v = if pixels >= 2 { yuyv[(pixels - 2) * 2 + 1] } else { 128 };
        rgb.extend_from_slice(&ycbcr_to_rgb(tail[0], tail[1], v));
    }

    Ok(RgbImage::from_raw(width, height, rgb).unwrap_or_else(|| RgbImage::new(width, height)))
}

/// Expand 8-bit grayscale to RGB.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("GREY", gray, pixels)?;
    let rgb = gray[..pixels].iter().flat_map(|&p| [p, p, p]).collect();
    Ok(RgbImage::from_raw(width, height, rgb).unwrap_or_else(|| RgbImage::new(width, height)))
}

/// Copy a packed RGB24 buffer.
pub fn rgb24_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let len = (width * height * 3) as usize;
    check_len("RGB3", buf, len)?;
    Ok(RgbImage::from_raw(width, height, buf[..len].to_vec()).unwrap_or_else(|| RgbImage::new(width, height)))
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_yuyv_black_white_grey() {
        // 3 pairs: black, white, mid-grey; all with neutral chroma.
        let yuyv = vec![16, 128, 16, 128, 235, 128, 235, 128, 126, 128, 126, 128];
        let rgb = yuyv_to_rgb(&yuyv, 6, 1).unwrap();
        assert_eq!(*rgb.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*rgb.get_pixel(1, 0), Rgb([0, 0, 0]));
        assert_eq!(*rgb.get_pixel(2, 0), Rgb([255, 255, 255]));
        assert_eq!(*rgb.get_pixel(4, 0), Rgb([128, 128, 128]));
    }

    #[test]
    fn test_yuyv_chroma_shifts_channels() {
        // Strong V (Cr) pushes toward red.
        let rgb = yuyv_to_rgb(&[126, 128, 126, 240], 2, 1).unwrap();
        let Rgb([r, g, b]) = *rgb.get_pixel(0, 0);
        assert!(r > g && r > b, "expected reddish pixel, got {r},{g},{b}");
    }

    #[test]
    fn test_yuyv_dimensions() {
        let yuyv: Vec<u8> = (0..16).collect();
        let rgb = yuyv_to_rgb(&yuyv, 4, 2).unwrap();
        assert_eq!(rgb.dimensions(), (4, 2));
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let result = yuyv_to_rgb(&[100, 128], 2, 1);
        assert!(matches!(
            result,
            Err(FrameError::InvalidLength {
                expected: 4,
                actual: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_grey_to_rgb() {
        let rgb = grey_to_rgb(&[7, 200], 2, 1).unwrap();
        assert_eq!(*rgb.get_pixel(0, 0), Rgb([7, 7, 7]));
        assert_eq!(*rgb.get_pixel(1, 0), Rgb([200, 200, 200]));
        assert!(grey_to_rgb(&[1], 2, 1).is_err());
    }

    #[test]
    fn test_rgb24_ignores_trailing_bytes() {
        let rgb = rgb24_to_rgb(&[1, 2, 3, 4, 5, 6, 99], 2, 1).unwrap();
        assert_eq!(*rgb.get_pixel(1, 0), Rgb([4, 5, 6]));
    }
}
