//! Frame geometry for detection setup.
//!
//! Everything here is computed once per run: the frame center, the corner
//! of the active quadrant, the per-quadrant axis directions the box
//! cascade steps along, the hub exclusion mask for optical-flow feature
//! selection, and the fixed perspective transform that squares an
//! obliquely-viewed rectangular crop.
//!
//! Quadrants use mathematical numbering (1 = upper-right, 2 = upper-left,
//! 3 = lower-left, 4 = lower-right), independent of the image coordinate
//! system's flipped y axis.

use anyhow::{anyhow, Result};
use image::{GrayImage, Luma};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::rect::Rect;

/// Center pixel of a `w` by `h` frame.
pub fn center_pixel(width: u32, height: u32) -> (u32, u32) {
    (width / 2, height / 2)
}

/// Corner pixel of the given mathematical quadrant.
pub fn quadrant_corner(quadrant: u8, width: u32, height: u32) -> Result<(u32, u32)> {
    let corner = match quadrant {
        1 => (width - 1, 0),
        2 => (0, 0),
        3 => (0, height - 1),
        4 => (width - 1, height - 1),
        q => return Err(anyhow!("quadrant must be 1..=4, got {}", q)),
    };
    Ok(corner)
}

/// Outward axis directions for a quadrant, in image coordinates.
///
/// The x component points toward the quadrant corner horizontally, the y
/// component vertically. Quadrants 1 and 2 sit above the centerline, so
/// their y direction is negative in image coordinates.
pub fn axis_mapping(quadrant: u8) -> Result<(i32, i32)> {
    let axes = match quadrant {
        1 => (1, -1),
        2 => (-1, -1),
        3 => (-1, 1),
        4 => (1, 1),
        q => return Err(anyhow!("quadrant must be 1..=4, got {}", q)),
    };
    Ok(axes)
}

/// Euclidean distance from the frame center to the active corner: the
/// maximum radius available for diagonal box placement.
pub fn hypotenuse(center: (u32, u32), corner: (u32, u32)) -> f64 {
    let dx = center.0 as f64 - corner.0 as f64;
    let dy = center.1 as f64 - corner.1 as f64;
    (dx * dx + dy * dy).sqrt()
}

/// Shape of the hub exclusion region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskShape {
    Circle,
    Rect,
}

/// Binary feature mask: 255 where features may be selected, 0 inside the
/// excluded region centered at (frame center + offset).
///
/// The excluded region covers the rotor hub, where blade motion is least
/// informative for optical flow.
pub fn feature_mask(
    shape: MaskShape,
    size: (u32, u32),
    offset: (i32, i32),
    width: u32,
    height: u32,
) -> GrayImage {
    let mut mask = GrayImage::from_pixel(width, height, Luma([255u8]));
    let center = center_pixel(width, height);
    let cx = center.0 as i32 + offset.0;
    let cy = center.1 as i32 + offset.1;

    match shape {
        MaskShape::Rect => {
            let (w, h) = (size.0.max(1) as i32, size.1.max(1) as i32);
            let rect = Rect::at(cx - w / 2, cy - h / 2).of_size(w as u32, h as u32);
            draw_filled_rect_mut(&mut mask, rect, Luma([0u8]));
        }
        MaskShape::Circle => {
            let radius = (size.0.max(size.1) / 2).max(1) as i32;
            draw_filled_circle_mut(&mut mask, (cx, cy), radius, Luma([0u8]));
        }
    }
    mask
}

/// Fixed perspective transform squaring a non-square crop.
///
/// A rectangular crop of an obliquely mounted camera is stretched onto a
/// `side x side` square (side = the longer crop edge), approximating a
/// head-on view. Returns `None` for an already-square crop.
pub fn squaring_projection(width: u32, height: u32) -> Option<(Projection, u32)> {
    if width == height {
        return None;
    }
    let side = width.max(height) as f32;
    let (w, h) = (width as f32, height as f32);
    let from = [(0.0, 0.0), (w - 1.0, 0.0), (w - 1.0, h - 1.0), (0.0, h - 1.0)];
    let to = [
        (0.0, 0.0),
        (side - 1.0, 0.0),
        (side - 1.0, side - 1.0),
        (0.0, side - 1.0),
    ];
    Projection::from_control_points(from, to).map(|p| (p, side as u32))
}

/// Warp a frame through a squaring projection into a `side x side` buffer.
pub fn square_frame(image: &GrayImage, projection: &Projection, side: u32) -> GrayImage {
    let mut out = GrayImage::new(side, side);
    warp_into(
        image,
        projection,
        Interpolation::Bilinear,
        Luma([0u8]),
        &mut out,
    );
    out
}
