//! Optical-flow rotor speed estimation.
//!
//! Strategy B tracks image features outside a masked hub region from
//! frame to frame. The averaged displacement magnitude of the surviving
//! tracks converts to angular velocity through the mean track radius, and
//! a perspective scaling factor compensates for the oblique view of the
//! rotor plane.
//!
//! Feature selection uses FAST corners with greedy minimum-distance
//! suppression; tracking is the in-crate pyramidal Lucas-Kanade solver.
//! A frame with no surviving tracks contributes no sample; that is
//! expected steady-state behavior, not an error.

pub mod lk;

use image::GrayImage;
use imageproc::corners::corners_fast9;

use crate::frame::Frame;
use crate::geometry::{self, MaskShape};
use crate::stats;
use lk::{LkParams, TrackedPoint};

/// Optical-flow parameters, immutable for a run.
#[derive(Clone, Debug)]
pub struct FlowConfig {
    pub deadzone_shape: MaskShape,
    pub deadzone_size: (u32, u32),
    pub deadzone_offset: (i32, i32),
    /// Camera elevation from the ground toward the hub, in degrees.
    pub ground_angle_deg: f64,
    /// Maximum tracking residual for a point to count.
    pub pixel_threshold: f64,
    pub max_features: usize,
    pub fast_threshold: u8,
    pub min_feature_distance: f64,
    /// Full extent of the tracking window in pixels.
    pub track_window: u32,
    pub pyramid_levels: u32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            deadzone_shape: MaskShape::Circle,
            deadzone_size: (60, 60),
            deadzone_offset: (0, 0),
            ground_angle_deg: 0.0,
            pixel_threshold: 10.0,
            max_features: 100,
            fast_threshold: 20,
            min_feature_distance: 7.0,
            track_window: 15,
            pyramid_levels: 2,
        }
    }
}

/// Perspective rotation induced by a non-square crop, in radians.
///
/// A square crop views the rotor plane head-on and yields zero rotation;
/// the more oblong the crop, the further the apparent plane is rotated.
pub fn perspective_rotation_angle(width: u32, height: u32) -> f64 {
    let long = width.max(height) as f64;
    let short = width.min(height) as f64;
    if long == 0.0 {
        return 0.0;
    }
    (short / long).acos()
}

/// Scaling factor recovering true in-plane speed from apparent speed.
///
/// The rotor plane normal, tilted by the ground angle `g` and rotated by
/// the perspective angle `r`, is dotted against the camera viewing axis
/// `(0, 1, 0)`; the reciprocal of that dot product stretches apparent
/// displacements back onto the rotor plane. Head-on at zero angles the
/// factor is exactly 1.
pub fn view_angle_scaling(ground_angle: f64, rotation_angle: f64) -> f64 {
    let normal = (
        rotation_angle.sin() * ground_angle.cos(),
        rotation_angle.cos() * ground_angle.cos(),
        ground_angle.sin(),
    );
    let view_axis = (0.0, 1.0, 0.0);
    let dot = normal.0 * view_axis.0 + normal.1 * view_axis.1 + normal.2 * view_axis.2;
    if dot.abs() < 1e-6 {
        // Degenerate edge-on view; no finite correction exists.
        return 1.0;
    }
    1.0 / dot
}

/// Frame-to-frame feature tracker producing RPM samples.
pub struct OpticalFlowTracker {
    config: FlowConfig,
    fps: f64,
    mask: GrayImage,
    scale: f64,
    /// Rotation center: frame center plus the deadzone offset.
    center: (f64, f64),
    lk: LkParams,
    prev: Option<GrayImage>,
    tracking_failures: u64,
}

impl OpticalFlowTracker {
    pub fn new(config: FlowConfig, fps: f64, width: u32, height: u32) -> Self {
        let rotation = perspective_rotation_angle(width, height);
        let scale = view_angle_scaling(config.ground_angle_deg.to_radians(), rotation);
        let mask = geometry::feature_mask(
            config.deadzone_shape,
            config.deadzone_size,
            config.deadzone_offset,
            width,
            height,
        );
        let frame_center = geometry::center_pixel(width, height);
        let center = (
            frame_center.0 as f64 + config.deadzone_offset.0 as f64,
            frame_center.1 as f64 + config.deadzone_offset.1 as f64,
        );
        let lk = LkParams {
            window_radius: (config.track_window / 2).max(1),
            pyramid_levels: config.pyramid_levels.max(1),
            ..LkParams::default()
        };
        log::info!(
            "optical flow: perspective rotation {:.1} deg, scaling factor {:.3}",
            rotation.to_degrees(),
            scale
        );
        Self {
            config,
            fps,
            mask,
            scale,
            center,
            lk,
            prev: None,
            tracking_failures: 0,
        }
    }

    /// Feed one frame; returns an RPM estimate when enough features
    /// survived tracking and filtering.
    pub fn next_rpm(&mut self, frame: &Frame) -> Option<f64> {
        let Some(prev) = self.prev.take() else {
            self.prev = Some(frame.gray.clone());
            return None;
        };

        let features = self.detect_features(&prev);
        let rpm = if features.is_empty() {
            self.tracking_failures += 1;
            log::debug!("frame {}: no trackable features outside deadzone", frame.index);
            None
        } else {
            let tracked = lk::track_points(&prev, &frame.gray, &features, &self.lk);
            let (old_points, new_points) = self.surviving_pairs(&features, &tracked);
            if old_points.is_empty() {
                self.tracking_failures += 1;
                log::debug!("frame {}: all {} tracks rejected", frame.index, features.len());
                None
            } else {
                self.velocity_from_vectors(&old_points, &new_points)
            }
        };

        self.prev = Some(frame.gray.clone());
        rpm
    }

    /// FAST corners outside the deadzone, strongest first, thinned by the
    /// minimum feature distance.
    fn detect_features(&self, gray: &GrayImage) -> Vec<(f32, f32)> {
        let margin = self.lk.window_radius + 1;
        let mut corners = corners_fast9(gray, self.config.fast_threshold);
        corners.retain(|c| {
            c.x >= margin
                && c.y >= margin
                && c.x + margin < gray.width()
                && c.y + margin < gray.height()
                && self.mask.get_pixel(c.x, c.y).0[0] > 0
        });
        corners.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let min_dist_sq = self.config.min_feature_distance * self.config.min_feature_distance;
        let mut selected: Vec<(f32, f32)> = Vec::new();
        for corner in corners {
            if selected.len() >= self.config.max_features {
                break;
            }
            let candidate = (corner.x as f32, corner.y as f32);
            let far_enough = selected.iter().all(|&(sx, sy)| {
                let dx = (sx - candidate.0) as f64;
                let dy = (sy - candidate.1) as f64;
                dx * dx + dy * dy >= min_dist_sq
            });
            if far_enough {
                selected.push(candidate);
            }
        }
        selected
    }

    fn surviving_pairs(
        &self,
        features: &[(f32, f32)],
        tracked: &[TrackedPoint],
    ) -> (Vec<(f32, f32)>, Vec<(f32, f32)>) {
        let mut old_points = Vec::new();
        let mut new_points = Vec::new();
        for (origin, result) in features.iter().zip(tracked) {
            if result.tracked && (result.error as f64) < self.config.pixel_threshold {
                old_points.push(*origin);
                new_points.push(result.pos);
            }
        }
        (old_points, new_points)
    }

    /// Convert surviving track displacements into RPM.
    ///
    /// Magnitudes outside two standard deviations of the batch mean are
    /// discarded as mistracks before averaging. The remaining mean speed
    /// over the mean track radius gives the angular velocity, which the
    /// perspective factor then corrects.
    pub fn velocity_from_vectors(
        &self,
        old_points: &[(f32, f32)],
        new_points: &[(f32, f32)],
    ) -> Option<f64> {
        let magnitudes: Vec<f64> = old_points
            .iter()
            .zip(new_points)
            .map(|(o, n)| {
                let dx = (n.0 - o.0) as f64;
                let dy = (n.1 - o.1) as f64;
                (dx * dx + dy * dy).sqrt()
            })
            .collect();

        let inliers = stats::magnitude_inliers(&magnitudes);
        if inliers.is_empty() {
            return None;
        }

        let speed = stats::mean(&inliers.iter().map(|&i| magnitudes[i]).collect::<Vec<_>>());
        let radii: Vec<f64> = inliers
            .iter()
            .map(|&i| {
                let mid_x = (old_points[i].0 + new_points[i].0) as f64 / 2.0;
                let mid_y = (old_points[i].1 + new_points[i].1) as f64 / 2.0;
                let dx = mid_x - self.center.0;
                let dy = mid_y - self.center.1;
                (dx * dx + dy * dy).sqrt()
            })
            .collect();
        let radius = stats::mean(&radii);
        if radius < 1.0 {
            // Tracks collapsed onto the hub; angular velocity is undefined.
            return None;
        }

        let angular_velocity = speed * self.fps / radius;
        let frequency = angular_velocity / (2.0 * std::f64::consts::PI);
        Some(60.0 * frequency * self.scale)
    }

    pub fn tracking_failures(&self) -> u64 {
        self.tracking_failures
    }

    pub fn scaling_factor(&self) -> f64 {
        self.scale
    }
}
