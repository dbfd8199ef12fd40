//! Blade-pass detection regions.
//!
//! This module owns the cascade of square bounding boxes swept from the
//! rotor hub outward. Each box keeps a bounded ring of region-intensity
//! samples; a blade shadow crossing a box shows up as a spike in that
//! box's intensity delta. Per-box delta averages are ranked and weighted
//! so the boxes currently carrying the strongest signal dominate the
//! combined scalar fed to the detection state machine.
//!
//! The cascade is responsible for:
//! - Fitting the requested box count/size to the available radius
//! - Placing boxes from the hub toward the active quadrant corner
//! - Per-frame region extraction, morphological cleanup, and sampling
//! - Aggregating per-box deltas into one global signal
//!
//! Regions are extracted as owned copies before any processing, so no
//! later drawing or annotation can feed back into measurement.

use std::collections::{BTreeMap, VecDeque};

use anyhow::{anyhow, Result};
use image::GrayImage;
use imageproc::distance_transform::Norm;
use imageproc::morphology::{dilate, erode};
use serde::{Deserialize, Serialize};

use crate::frame::{region_mean, Frame};
use crate::geometry;

/// Direction boxes are stacked along, from the hub outward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stacking {
    Horizontal,
    Vertical,
    Diagonal,
}

/// Cascade geometry and sampling parameters, immutable for a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Mathematical quadrant (1 = upper-right .. 4 = lower-right).
    pub quadrant: u8,
    pub target_num_boxes: u32,
    /// Half side length of each box, in pixels.
    pub target_box_size: u32,
    /// Shrink or grow the box size until the requested count fits.
    pub resize_boxes: bool,
    /// Clamp or grow the box count to what fits at the requested size.
    pub adjust_num_boxes: bool,
    /// 1-based index of the first cascaded box; earlier boxes sit over the
    /// hub and are excluded.
    pub start_from_box: u32,
    /// Number of boxes dropped at the frame-edge end of the cascade.
    pub trim_last_n_boxes: u32,
    pub stacking: Stacking,
    /// Ring capacity of each box's sample buffer.
    pub frame_buffer_size: usize,
    /// Recompute ranking and the global signal every N frames.
    pub color_delta_update_frequency: u64,
    /// Structuring-element extent for dilation/erosion.
    pub kernel_size: [u32; 2],
    pub dilation_iterations: u32,
    pub erosion_iterations: u32,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            quadrant: 1,
            target_num_boxes: 5,
            target_box_size: 10,
            resize_boxes: false,
            adjust_num_boxes: true,
            start_from_box: 1,
            trim_last_n_boxes: 0,
            stacking: Stacking::Diagonal,
            frame_buffer_size: 10,
            color_delta_update_frequency: 1,
            kernel_size: [3, 3],
            dilation_iterations: 1,
            erosion_iterations: 1,
        }
    }
}

/// One intensity observation: the region mean and its delta from the
/// previous observation in the same ring.
#[derive(Clone, Copy, Debug)]
pub struct Sample {
    pub intensity: f64,
    pub delta: f64,
}

/// Fixed-capacity ring of the most recent intensity samples for one box.
///
/// Capacity is fixed at construction and never resized. The very first
/// sample carries a delta of zero so a run never starts with a spike.
pub struct SampleRing {
    capacity: usize,
    entries: VecDeque<Sample>,
    average_delta: f64,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
            average_delta: 0.0,
        }
    }

    pub fn insert(&mut self, intensity: f64) {
        let delta = match self.entries.back() {
            Some(prev) => intensity - prev.intensity,
            None => 0.0,
        };
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(Sample { intensity, delta });
        self.average_delta =
            self.entries.iter().map(|s| s.delta).sum::<f64>() / self.entries.len() as f64;
    }

    /// Rolling average of the deltas currently in the ring.
    pub fn average_delta(&self) -> f64 {
        self.average_delta
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One square detection region with its own sample ring.
pub struct BoundingBox {
    pub id: u32,
    /// Center pixel in frame coordinates.
    pub center: (u32, u32),
    /// Half side length ("radius") in pixels.
    pub size: u32,
    /// 0 = strongest recent signal. Reassigned on every ranking pass.
    pub rank: usize,
    ring: SampleRing,
}

impl BoundingBox {
    fn new(id: u32, center: (u32, u32), size: u32, ring_capacity: usize) -> Self {
        Self {
            id,
            center,
            size,
            rank: 0,
            ring: SampleRing::new(ring_capacity),
        }
    }

    pub fn side_length(&self) -> u32 {
        self.size * 2
    }

    /// Top-left corner of the region in frame coordinates.
    pub fn origin(&self) -> (u32, u32) {
        (self.center.0 - self.size, self.center.1 - self.size)
    }

    pub fn average_delta(&self) -> f64 {
        self.ring.average_delta()
    }

    pub fn samples(&self) -> usize {
        self.ring.len()
    }

    fn observe(&mut self, frame: &Frame, morph: &MorphParams) {
        let (x, y) = self.origin();
        let region = frame.region(x, y, self.side_length());
        let processed = morph.apply(&region);
        self.ring.insert(region_mean(&processed));
    }
}

/// Dilation-then-erosion parameters applied to every region before its
/// mean is sampled. Suppresses single-pixel noise while keeping the
/// blade-edge contrast step.
struct MorphParams {
    radius: u8,
    dilation_iterations: u32,
    erosion_iterations: u32,
}

impl MorphParams {
    fn from_config(cfg: &CascadeConfig) -> Self {
        let extent = cfg.kernel_size[0].max(cfg.kernel_size[1]).max(1);
        Self {
            radius: (extent / 2).clamp(1, u8::MAX as u32) as u8,
            dilation_iterations: cfg.dilation_iterations,
            erosion_iterations: cfg.erosion_iterations,
        }
    }

    fn apply(&self, region: &GrayImage) -> GrayImage {
        let mut out = region.clone();
        for _ in 0..self.dilation_iterations {
            out = dilate(&out, Norm::LInf, self.radius);
        }
        for _ in 0..self.erosion_iterations {
            out = erode(&out, Norm::LInf, self.radius);
        }
        out
    }
}

/// Box id, center, and half-size; enough to compare two cascade layouts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxLayout {
    pub id: u32,
    pub center: (u32, u32),
    pub size: u32,
}

/// The cascade of detection boxes for one estimation run.
pub struct BoxCascade {
    config: CascadeConfig,
    center: (u32, u32),
    corner: (u32, u32),
    axis: (i32, i32),
    hypotenuse: f64,
    width: u32,
    height: u32,
    morph: MorphParams,
    boxes: BTreeMap<u32, BoundingBox>,
    global_average: f64,
}

impl BoxCascade {
    pub fn new(config: CascadeConfig, width: u32, height: u32) -> Result<Self> {
        let center = geometry::center_pixel(width, height);
        let corner = geometry::quadrant_corner(config.quadrant, width, height)?;
        let axis = geometry::axis_mapping(config.quadrant)?;
        let hypotenuse = geometry::hypotenuse(center, corner);
        let morph = MorphParams::from_config(&config);

        let mut cascade = Self {
            config,
            center,
            corner,
            axis,
            hypotenuse,
            width,
            height,
            morph,
            boxes: BTreeMap::new(),
            global_average: 0.0,
        };

        let (count, size) = cascade.fit_box_parameters(
            cascade.config.target_num_boxes,
            cascade.config.target_box_size,
            cascade.config.resize_boxes,
            cascade.config.adjust_num_boxes,
        );
        cascade.boxes = cascade.cascade_boxes(count, size);
        if cascade.boxes.is_empty() {
            return Err(anyhow!(
                "no detection boxes fit: count={} size={} start={} trim={} in {}x{}",
                count,
                size,
                cascade.config.start_from_box,
                cascade.config.trim_last_n_boxes,
                width,
                height
            ));
        }
        Ok(cascade)
    }

    /// How many boxes of the given half-size fit along the cascade
    /// direction.
    pub fn boxes_in_radius(&self, box_size: u32) -> u32 {
        let diameter = 2 * box_size.max(1);
        match self.config.stacking {
            Stacking::Horizontal => self.center.0 / diameter,
            Stacking::Vertical => self.center.1 / diameter,
            Stacking::Diagonal => {
                let diagonal = (diameter as f64 * std::f64::consts::SQRT_2).round();
                (self.hypotenuse / diagonal).floor() as u32
            }
        }
    }

    /// Reconcile the requested box count and size with the available
    /// radius.
    ///
    /// With `resize_boxes`, the size shrinks one unit at a time until the
    /// requested count fits (or grows until one more unit would overflow
    /// when the request already fits). With `adjust_num_boxes`, the count
    /// is set to the maximum that fits at the requested size. With both
    /// flags off the request is returned unmodified even if infeasible.
    pub fn fit_box_parameters(
        &self,
        wanted_num_boxes: u32,
        wanted_box_size: u32,
        resize_boxes: bool,
        adjust_num_boxes: bool,
    ) -> (u32, u32) {
        let wanted_num_boxes = wanted_num_boxes.max(1);
        let initial_limit = self.boxes_in_radius(wanted_box_size);

        let mut result_boxes = wanted_num_boxes;
        let mut result_size = wanted_box_size;

        if wanted_num_boxes > initial_limit {
            if adjust_num_boxes {
                result_boxes = initial_limit;
            } else if resize_boxes {
                while result_size > 1 && self.boxes_in_radius(result_size) < wanted_num_boxes {
                    result_size -= 1;
                }
            }
        } else if resize_boxes {
            while self.boxes_in_radius(result_size + 1) >= wanted_num_boxes {
                result_size += 1;
            }
        } else if adjust_num_boxes {
            result_boxes = initial_limit;
        }

        (result_boxes, result_size)
    }

    /// Place boxes from the hub outward along the quadrant axis
    /// directions, skipping `start_from_box - 1` hub-adjacent boxes and
    /// trimming `trim_last_n_boxes` edge-adjacent ones.
    ///
    /// Box `i` sits `(2i + 1) * size` pixels from the center along each
    /// active stacking axis; the inactive axis is pinned one half-box
    /// inside the quadrant, which keeps every region inside the active
    /// quadrant for all four quadrants.
    fn cascade_boxes(&self, num_boxes: u32, box_size: u32) -> BTreeMap<u32, BoundingBox> {
        let (ax, ay) = self.axis;
        let first = self.config.start_from_box.saturating_sub(1);
        let stop = num_boxes.saturating_sub(self.config.trim_last_n_boxes);

        let mut boxes = BTreeMap::new();
        for i in first..stop {
            let step = ((2 * i + 1) * box_size) as i64;
            let (dx, dy) = match self.config.stacking {
                Stacking::Horizontal => (step, box_size as i64),
                Stacking::Vertical => (box_size as i64, step),
                Stacking::Diagonal => (step, step),
            };
            let cx = self.center.0 as i64 + ax as i64 * dx;
            let cy = self.center.1 as i64 + ay as i64 * dy;

            // The diagonal capacity formula measures along the hypotenuse
            // and can overshoot the nearer frame edge on non-square
            // frames; boxes that poke outside are excluded rather than
            // placed clipped.
            let size = box_size as i64;
            if cx - size < 0
                || cy - size < 0
                || cx + size > self.width as i64
                || cy + size > self.height as i64
            {
                log::debug!(
                    "skipping box {} at ({}, {}): outside the {}x{} frame",
                    i,
                    cx,
                    cy,
                    self.width,
                    self.height
                );
                continue;
            }

            boxes.insert(
                i,
                BoundingBox::new(
                    i,
                    (cx as u32, cy as u32),
                    box_size,
                    self.config.frame_buffer_size,
                ),
            );
        }
        boxes
    }

    /// Sample every box from the current frame and refresh the aggregate
    /// signal on the configured cadence.
    pub fn observe(&mut self, frame: &Frame) {
        for bounding_box in self.boxes.values_mut() {
            bounding_box.observe(frame, &self.morph);
        }
        if frame.index % self.config.color_delta_update_frequency.max(1) == 0 {
            self.rank_and_weight();
        }
    }

    /// Rank boxes by delta average (0 = strongest) and recompute the
    /// weighted global signal. Weights follow `linspace(1, 0, N)` over the
    /// ranks, so quiescent boxes contribute little.
    pub fn rank_and_weight(&mut self) {
        let mut order: Vec<(u32, f64)> = self
            .boxes
            .values()
            .map(|b| (b.id, b.average_delta()))
            .collect();
        order.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let n = order.len();
        let mut weighted_sum = 0.0;
        for (rank, (id, average)) in order.into_iter().enumerate() {
            if let Some(bounding_box) = self.boxes.get_mut(&id) {
                bounding_box.rank = rank;
            }
            let weight = if n > 1 {
                1.0 - rank as f64 / (n - 1) as f64
            } else {
                1.0
            };
            weighted_sum += average * weight;
        }
        if n > 0 {
            self.global_average = weighted_sum / n as f64;
        }
    }

    /// The single scalar signal fed to the detection state machine.
    pub fn global_average(&self) -> f64 {
        self.global_average
    }

    /// Frame center the cascade radiates from.
    pub fn center(&self) -> (u32, u32) {
        self.center
    }

    /// Corner pixel of the active quadrant.
    pub fn corner(&self) -> (u32, u32) {
        self.corner
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&BoundingBox> {
        self.boxes.get(&id)
    }

    pub fn boxes(&self) -> impl Iterator<Item = &BoundingBox> {
        self.boxes.values()
    }

    /// Layout snapshot for comparison across construction round-trips.
    pub fn layout(&self) -> Vec<BoxLayout> {
        self.boxes
            .values()
            .map(|b| BoxLayout {
                id: b.id,
                center: b.center,
                size: b.size,
            })
            .collect()
    }
}
