//! Pyramidal Lucas-Kanade point tracker.
//!
//! Tracks sparse feature points from one grayscale frame into the next.
//! Coarse-to-fine refinement over a box-filtered pyramid keeps the solver
//! inside its linearization range for displacements larger than the
//! window. Works on plain luma buffers; no external CV runtime.

use image::GrayImage;

/// Tracker parameters.
#[derive(Clone, Debug)]
pub struct LkParams {
    /// Half extent of the correlation window (7 -> 15x15 window).
    pub window_radius: u32,
    /// Pyramid depth including the full-resolution base level.
    pub pyramid_levels: u32,
    /// Newton iterations per pyramid level.
    pub max_iterations: u32,
    /// Convergence threshold on the per-iteration update, in pixels.
    pub epsilon: f32,
}

impl Default for LkParams {
    fn default() -> Self {
        Self {
            window_radius: 7,
            pyramid_levels: 2,
            max_iterations: 10,
            epsilon: 0.01,
        }
    }
}

/// Outcome of tracking a single point.
#[derive(Clone, Copy, Debug)]
pub struct TrackedPoint {
    /// Position in the next frame.
    pub pos: (f32, f32),
    /// False when the solver lost the point (flat texture, out of frame,
    /// or divergence).
    pub tracked: bool,
    /// Mean absolute residual over the window, in intensity units.
    pub error: f32,
}

struct FloatImage {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl FloatImage {
    fn from_gray(image: &GrayImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            data: image.as_raw().iter().map(|&p| p as f32).collect(),
        }
    }

    /// 2x2 box-filtered half-resolution copy.
    fn downsample(&self) -> Self {
        let width = (self.width / 2).max(1);
        let height = (self.height / 2).max(1);
        let mut data = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                let x0 = (2 * x).min(self.width - 1);
                let y0 = (2 * y).min(self.height - 1);
                let x1 = (2 * x + 1).min(self.width - 1);
                let y1 = (2 * y + 1).min(self.height - 1);
                let sum = self.at(x0, y0) + self.at(x1, y0) + self.at(x0, y1) + self.at(x1, y1);
                data.push(sum / 4.0);
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    #[inline]
    fn at(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }

    /// Bilinear sample with edge clamping.
    fn sample(&self, x: f32, y: f32) -> f32 {
        let x = x.clamp(0.0, (self.width - 1) as f32);
        let y = y.clamp(0.0, (self.height - 1) as f32);
        let x0 = x.floor() as u32;
        let y0 = y.floor() as u32;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let top = self.at(x0, y0) * (1.0 - fx) + self.at(x1, y0) * fx;
        let bottom = self.at(x0, y1) * (1.0 - fx) + self.at(x1, y1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    fn in_tracking_bounds(&self, x: f32, y: f32, margin: f32) -> bool {
        x >= margin
            && y >= margin
            && x <= (self.width - 1) as f32 - margin
            && y <= (self.height - 1) as f32 - margin
    }
}

fn build_pyramid(image: &GrayImage, levels: u32) -> Vec<FloatImage> {
    let mut pyramid = vec![FloatImage::from_gray(image)];
    for _ in 1..levels.max(1) {
        let next = pyramid.last().unwrap().downsample();
        if next.width < 8 || next.height < 8 {
            break;
        }
        pyramid.push(next);
    }
    pyramid
}

/// Track `points` from `prev` into `next`.
///
/// The result vector is index-aligned with `points`; callers filter on
/// `tracked` and `error` afterwards.
pub fn track_points(
    prev: &GrayImage,
    next: &GrayImage,
    points: &[(f32, f32)],
    params: &LkParams,
) -> Vec<TrackedPoint> {
    let prev_pyramid = build_pyramid(prev, params.pyramid_levels);
    let next_pyramid = build_pyramid(next, params.pyramid_levels);

    points
        .iter()
        .map(|&p| track_single(&prev_pyramid, &next_pyramid, p, params))
        .collect()
}

fn track_single(
    prev_pyramid: &[FloatImage],
    next_pyramid: &[FloatImage],
    point: (f32, f32),
    params: &LkParams,
) -> TrackedPoint {
    let levels = prev_pyramid.len().min(next_pyramid.len());
    let radius = params.window_radius as i32;
    let margin = (params.window_radius + 1) as f32;

    let lost = TrackedPoint {
        pos: point,
        tracked: false,
        error: f32::MAX,
    };

    // Displacement estimate, refined coarse to fine.
    let mut dx = 0.0f32;
    let mut dy = 0.0f32;
    let mut error = f32::MAX;

    for level in (0..levels).rev() {
        let prev_img = &prev_pyramid[level];
        let next_img = &next_pyramid[level];
        let scale = (1 << level) as f32;
        let px = point.0 / scale;
        let py = point.1 / scale;

        if !prev_img.in_tracking_bounds(px, py, margin) {
            return lost;
        }

        // Spatial gradient matrix over the window in the previous frame;
        // constant across iterations at this level.
        let mut gxx = 0.0f32;
        let mut gxy = 0.0f32;
        let mut gyy = 0.0f32;
        for wy in -radius..=radius {
            for wx in -radius..=radius {
                let x = px + wx as f32;
                let y = py + wy as f32;
                let ix = (prev_img.sample(x + 1.0, y) - prev_img.sample(x - 1.0, y)) / 2.0;
                let iy = (prev_img.sample(x, y + 1.0) - prev_img.sample(x, y - 1.0)) / 2.0;
                gxx += ix * ix;
                gxy += ix * iy;
                gyy += iy * iy;
            }
        }
        let det = gxx * gyy - gxy * gxy;
        if det.abs() < 1e-4 {
            // Flat or single-edge texture: the system is degenerate.
            return lost;
        }

        for _ in 0..params.max_iterations {
            if !next_img.in_tracking_bounds(px + dx, py + dy, 1.0) {
                return lost;
            }

            let mut bx = 0.0f32;
            let mut by = 0.0f32;
            for wy in -radius..=radius {
                for wx in -radius..=radius {
                    let x = px + wx as f32;
                    let y = py + wy as f32;
                    let residual = prev_img.sample(x, y) - next_img.sample(x + dx, y + dy);
                    let ix = (prev_img.sample(x + 1.0, y) - prev_img.sample(x - 1.0, y)) / 2.0;
                    let iy = (prev_img.sample(x, y + 1.0) - prev_img.sample(x, y - 1.0)) / 2.0;
                    bx += residual * ix;
                    by += residual * iy;
                }
            }

            let ux = (gyy * bx - gxy * by) / det;
            let uy = (gxx * by - gxy * bx) / det;
            dx += ux;
            dy += uy;

            if (ux * ux + uy * uy).sqrt() < params.epsilon {
                break;
            }
        }

        // Residual error at this level's solution.
        let mut residual_sum = 0.0f32;
        let window_area = ((2 * radius + 1) * (2 * radius + 1)) as f32;
        for wy in -radius..=radius {
            for wx in -radius..=radius {
                let x = px + wx as f32;
                let y = py + wy as f32;
                residual_sum +=
                    (prev_img.sample(x, y) - next_img.sample(x + dx, y + dy)).abs();
            }
        }
        error = residual_sum / window_area;

        if level > 0 {
            dx *= 2.0;
            dy *= 2.0;
        }
    }

    let pos = (point.0 + dx, point.1 + dy);
    if !next_pyramid[0].in_tracking_bounds(pos.0, pos.1, 1.0) {
        return lost;
    }

    TrackedPoint {
        pos,
        tracked: true,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Smooth, well-textured synthetic pattern.
    fn pattern(width: u32, height: u32, shift_x: f32, shift_y: f32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let fx = x as f32 - shift_x;
            let fy = y as f32 - shift_y;
            let v = 128.0 + 55.0 * (fx * 0.25).sin() * (fy * 0.19).cos()
                + 40.0 * ((fx * 0.11) + (fy * 0.07)).sin();
            image::Luma([v.clamp(0.0, 255.0) as u8])
        })
    }

    #[test]
    fn recovers_integer_translation() {
        let prev = pattern(96, 96, 0.0, 0.0);
        let next = pattern(96, 96, 3.0, 2.0);
        let points = [(30.0, 30.0), (48.0, 40.0), (60.0, 56.0)];

        let tracked = track_points(&prev, &next, &points, &LkParams::default());
        for (origin, result) in points.iter().zip(&tracked) {
            assert!(result.tracked, "point {:?} lost", origin);
            assert!(
                (result.pos.0 - origin.0 - 3.0).abs() < 0.7,
                "dx off: {:?} -> {:?}",
                origin,
                result.pos
            );
            assert!(
                (result.pos.1 - origin.1 - 2.0).abs() < 0.7,
                "dy off: {:?} -> {:?}",
                origin,
                result.pos
            );
            assert!(result.error < 20.0);
        }
    }

    #[test]
    fn flat_texture_is_reported_lost() {
        let prev = GrayImage::from_pixel(64, 64, image::Luma([128u8]));
        let next = GrayImage::from_pixel(64, 64, image::Luma([128u8]));
        let tracked = track_points(&prev, &next, &[(32.0, 32.0)], &LkParams::default());
        assert!(!tracked[0].tracked);
    }

    #[test]
    fn border_points_are_reported_lost() {
        let prev = pattern(64, 64, 0.0, 0.0);
        let next = pattern(64, 64, 1.0, 0.0);
        let tracked = track_points(&prev, &next, &[(2.0, 2.0)], &LkParams::default());
        assert!(!tracked[0].tracked);
    }
}
