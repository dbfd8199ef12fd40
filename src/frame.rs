//! Owned frame buffers.
//!
//! Every iteration of the estimation loop works on exactly one `Frame`: an
//! owned grayscale buffer plus the monotonically increasing counter value
//! assigned by the feed. Region reads hand out owned copies, never views,
//! so measurement can never race against annotation or later mutation of
//! the same buffer.

use anyhow::{anyhow, Result};
use image::GrayImage;

/// One captured timestep.
///
/// `index` is the feed's frame counter at capture time and is the clock
/// used for tick-interval RPM math. Frames are created and discarded every
/// iteration; nothing holds one across loop turns.
pub struct Frame {
    pub index: u64,
    pub gray: GrayImage,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.gray.width()
    }

    pub fn height(&self) -> u32 {
        self.gray.height()
    }

    /// Owned copy of a square region. The caller may draw on or process
    /// the copy freely without affecting this frame.
    pub fn region(&self, x: u32, y: u32, side: u32) -> GrayImage {
        image::imageops::crop_imm(&self.gray, x, y, side, side).to_image()
    }

    /// Mean intensity over the whole frame.
    pub fn mean_intensity(&self) -> f64 {
        region_mean(&self.gray)
    }
}

/// Mean intensity of a grayscale buffer. Returns 0.0 for an empty image.
pub fn region_mean(region: &GrayImage) -> f64 {
    let pixels = region.as_raw();
    if pixels.is_empty() {
        return 0.0;
    }
    pixels.iter().map(|&p| p as u64).sum::<u64>() as f64 / pixels.len() as f64
}

/// Convert packed RGB24 bytes to grayscale using BT.601 luma weights.
pub fn luma_from_rgb(rgb: &[u8], width: u32, height: u32) -> Result<GrayImage> {
    let expected = width as usize * height as usize * 3;
    if rgb.len() != expected {
        return Err(anyhow!(
            "rgb buffer size mismatch: got {} bytes, expected {} for {}x{}",
            rgb.len(),
            expected,
            width,
            height
        ));
    }
    let mut gray = Vec::with_capacity(width as usize * height as usize);
    for pixel in rgb.chunks_exact(3) {
        let luma = 0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32;
        gray.push(luma.round().clamp(0.0, 255.0) as u8);
    }
    GrayImage::from_raw(width, height, gray)
        .ok_or_else(|| anyhow!("failed to build {}x{} grayscale buffer", width, height))
}

/// Rescale intensity in place: `out = clamp(in * multiplier)`.
pub fn apply_contrast(image: &mut GrayImage, multiplier: f32) {
    for pixel in image.pixels_mut() {
        pixel.0[0] = (pixel.0[0] as f32 * multiplier).round().clamp(0.0, 255.0) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_an_owned_copy() {
        let mut gray = GrayImage::from_pixel(8, 8, image::Luma([10u8]));
        gray.put_pixel(2, 2, image::Luma([200u8]));
        let frame = Frame { index: 1, gray };

        let mut region = frame.region(1, 1, 4);
        assert_eq!(region.get_pixel(1, 1).0[0], 200);
        // Mutating the copy leaves the frame untouched.
        region.put_pixel(1, 1, image::Luma([0u8]));
        assert_eq!(frame.gray.get_pixel(2, 2).0[0], 200);
    }

    #[test]
    fn luma_conversion_matches_bt601() {
        let rgb = [255u8, 0, 0, 0, 255, 0, 0, 0, 255];
        let gray = luma_from_rgb(&rgb, 3, 1).unwrap();
        assert_eq!(gray.get_pixel(0, 0).0[0], 76);
        assert_eq!(gray.get_pixel(1, 0).0[0], 150);
        assert_eq!(gray.get_pixel(2, 0).0[0], 29);
    }

    #[test]
    fn luma_conversion_rejects_short_buffer() {
        assert!(luma_from_rgb(&[0u8; 5], 2, 1).is_err());
    }

    #[test]
    fn contrast_clamps_at_white() {
        let mut img = GrayImage::from_pixel(2, 1, image::Luma([200u8]));
        apply_contrast(&mut img, 2.0);
        assert_eq!(img.get_pixel(0, 0).0[0], 255);

        let mut img = GrayImage::from_pixel(2, 1, image::Luma([100u8]));
        apply_contrast(&mut img, 0.5);
        assert_eq!(img.get_pixel(0, 0).0[0], 50);
    }
}
