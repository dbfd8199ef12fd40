//! Run configuration.
//!
//! One JSON file, loaded once at startup, fully resolved and validated
//! before the estimation loop starts. Every key is an explicit field on
//! the file struct; unknown keys and malformed values abort the load
//! instead of surfacing at first use mid-run. Environment variables can
//! override the capture target and log path for deployments where the
//! config file is baked into the image.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cascade::{CascadeConfig, Stacking};
use crate::detect::{DetectionConfig, RpmCeiling};
use crate::flow::FlowConfig;
use crate::geometry::MaskShape;
use crate::ingest::{CropRect, FeedConfig};
use crate::output::OutputConfig;

const DEFAULT_RUN_ID: &str = "run:1";
const DEFAULT_QUADRANT: u8 = 1;
const DEFAULT_NUM_BOXES: u32 = 5;
const DEFAULT_BOX_SIZE: u32 = 10;
const DEFAULT_START_FROM_BOX: u32 = 1;
const DEFAULT_FRAME_BUFFER_SIZE: usize = 10;
const DEFAULT_UPDATE_FREQUENCY: u64 = 1;
const DEFAULT_CONTRAST_MULTIPLIER: f32 = 1.0;
const DEFAULT_THRESHOLD_MULTIPLIER: f64 = 2.0;
const DEFAULT_KERNEL_SIZE: [u32; 2] = [3, 3];
const DEFAULT_MORPH_ITERATIONS: u32 = 1;
const DEFAULT_DEADZONE_SIZE: [u32; 2] = [60, 60];
const DEFAULT_GROUND_ANGLE: f64 = 0.0;
const DEFAULT_PIXEL_THRESHOLD: f64 = 10.0;
const DEFAULT_MAX_RPM: f64 = 30.0;
const DEFAULT_MAX_RPM_DROP: f64 = 5.0;
const DEFAULT_COOLDOWN_FRAMES: u64 = 5;
const DEFAULT_RPM_HISTORY: usize = 5;
const DEFAULT_MAX_FEATURES: usize = 100;
const DEFAULT_FAST_THRESHOLD: u8 = 20;
const DEFAULT_MIN_FEATURE_DISTANCE: f64 = 7.0;
const DEFAULT_TRACK_WINDOW: u32 = 15;
const DEFAULT_PYRAMID_LEVELS: u32 = 2;
const DEFAULT_OUTPUT_PATH: &str = "rpm_log.csv";

/// Raw file schema. Only `target`, `fps`, and `mode` are required;
/// everything else falls back to calibrated defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RunConfigFile {
    target: Option<String>,
    fps: Option<f64>,
    mode: Option<String>,
    id: Option<String>,
    crop_points: Option<[[u32; 2]; 2]>,
    contrast_multiplier: Option<f32>,
    real_rpm: Option<f64>,

    quadrant: Option<u8>,
    target_num_boxes: Option<u32>,
    target_box_size: Option<u32>,
    resize_boxes: Option<bool>,
    adjust_num_boxes: Option<bool>,
    start_from_box: Option<u32>,
    trim_last_n_boxes: Option<u32>,
    stack_boxes_horizontally: Option<bool>,
    stack_boxes_vertically: Option<bool>,
    frame_buffer_size: Option<usize>,
    color_delta_update_frequency: Option<u64>,
    threshold_multiplier: Option<f64>,
    erosion_dilation_kernel_size: Option<[u32; 2]>,
    dilation_iterations: Option<u32>,
    erosion_iterations: Option<u32>,

    max_rpm: Option<f64>,
    rotor_diameter: Option<f64>,
    direct_drive: Option<bool>,
    max_rpm_drop: Option<f64>,
    cooldown_frames: Option<u64>,

    deadzone_shape: Option<String>,
    deadzone_size: Option<[u32; 2]>,
    deadzone_offset_x: Option<i32>,
    deadzone_offset_y: Option<i32>,
    ground_angle: Option<f64>,
    pixel_threshold: Option<f64>,
    max_features: Option<usize>,
    fast_threshold: Option<u8>,
    min_feature_distance: Option<f64>,
    track_window: Option<u32>,
    pyramid_levels: Option<u32>,

    output_path: Option<String>,
    log_frame_tick: Option<bool>,
    log_timestamp: Option<bool>,
    log_color_metrics: Option<bool>,
}

/// Which estimation strategy a run uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EstimationMode {
    /// Blade-pass detection over the bounding-box cascade.
    Bpm,
    /// Feature tracking outside the hub deadzone.
    OpticalFlow,
}

/// Fully resolved configuration for one estimation run.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub id: String,
    pub mode: EstimationMode,
    pub feed: FeedConfig,
    pub cascade: CascadeConfig,
    pub detection: DetectionConfig,
    pub flow: FlowConfig,
    pub output: OutputConfig,
    /// Ground-truth rotor speed for error reporting, when known.
    pub real_rpm: Option<f64>,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file_cfg = read_config_file(path)?;
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RunConfigFile) -> Result<Self> {
        let target = file
            .target
            .ok_or_else(|| anyhow!("config: 'target' is required"))?;
        let fps = file.fps.ok_or_else(|| anyhow!("config: 'fps' is required"))?;
        let mode = match file
            .mode
            .ok_or_else(|| anyhow!("config: 'mode' is required"))?
            .as_str()
        {
            "bpm" => EstimationMode::Bpm,
            "opticalflow" => EstimationMode::OpticalFlow,
            other => {
                return Err(anyhow!(
                    "config: mode must be 'bpm' or 'opticalflow', got '{}'",
                    other
                ))
            }
        };

        let crop = match file.crop_points {
            Some([[y0, y1], [x0, x1]]) => Some(CropRect { y0, y1, x0, x1 }),
            None => None,
        };

        let feed = FeedConfig {
            target,
            fps,
            crop,
            contrast_multiplier: file
                .contrast_multiplier
                .unwrap_or(DEFAULT_CONTRAST_MULTIPLIER),
        };

        let stacking = match (
            file.stack_boxes_horizontally.unwrap_or(false),
            file.stack_boxes_vertically.unwrap_or(false),
        ) {
            (true, true) => {
                return Err(anyhow!(
                    "config: stack_boxes_horizontally and stack_boxes_vertically are exclusive"
                ))
            }
            (true, false) => Stacking::Horizontal,
            (false, true) => Stacking::Vertical,
            (false, false) => Stacking::Diagonal,
        };

        let cascade = CascadeConfig {
            quadrant: file.quadrant.unwrap_or(DEFAULT_QUADRANT),
            target_num_boxes: file.target_num_boxes.unwrap_or(DEFAULT_NUM_BOXES),
            target_box_size: file.target_box_size.unwrap_or(DEFAULT_BOX_SIZE),
            resize_boxes: file.resize_boxes.unwrap_or(false),
            adjust_num_boxes: file.adjust_num_boxes.unwrap_or(true),
            start_from_box: file.start_from_box.unwrap_or(DEFAULT_START_FROM_BOX),
            trim_last_n_boxes: file.trim_last_n_boxes.unwrap_or(0),
            stacking,
            frame_buffer_size: file.frame_buffer_size.unwrap_or(DEFAULT_FRAME_BUFFER_SIZE),
            color_delta_update_frequency: file
                .color_delta_update_frequency
                .unwrap_or(DEFAULT_UPDATE_FREQUENCY),
            kernel_size: file
                .erosion_dilation_kernel_size
                .unwrap_or(DEFAULT_KERNEL_SIZE),
            dilation_iterations: file
                .dilation_iterations
                .unwrap_or(DEFAULT_MORPH_ITERATIONS),
            erosion_iterations: file.erosion_iterations.unwrap_or(DEFAULT_MORPH_ITERATIONS),
        };

        let ceiling = match file.rotor_diameter {
            Some(diameter) => RpmCeiling::Regression {
                diameter,
                direct_drive: file.direct_drive.unwrap_or(false),
            },
            None => RpmCeiling::Fixed(file.max_rpm.unwrap_or(DEFAULT_MAX_RPM)),
        };

        let detection = DetectionConfig {
            fps,
            threshold_multiplier: file
                .threshold_multiplier
                .unwrap_or(DEFAULT_THRESHOLD_MULTIPLIER),
            window_len: (fps.round() as usize).max(2),
            cooldown_frames: file.cooldown_frames.unwrap_or(DEFAULT_COOLDOWN_FRAMES),
            history_len: DEFAULT_RPM_HISTORY,
            ceiling,
            max_rpm_drop: file.max_rpm_drop.unwrap_or(DEFAULT_MAX_RPM_DROP),
        };

        let deadzone_shape = match file.deadzone_shape.as_deref() {
            None | Some("circle") => MaskShape::Circle,
            Some("rect") => MaskShape::Rect,
            Some(other) => {
                return Err(anyhow!(
                    "config: deadzone_shape must be 'circle' or 'rect', got '{}'",
                    other
                ))
            }
        };

        let deadzone_size = file.deadzone_size.unwrap_or(DEFAULT_DEADZONE_SIZE);
        let flow = FlowConfig {
            deadzone_shape,
            deadzone_size: (deadzone_size[0], deadzone_size[1]),
            deadzone_offset: (
                file.deadzone_offset_x.unwrap_or(0),
                file.deadzone_offset_y.unwrap_or(0),
            ),
            ground_angle_deg: file.ground_angle.unwrap_or(DEFAULT_GROUND_ANGLE),
            pixel_threshold: file.pixel_threshold.unwrap_or(DEFAULT_PIXEL_THRESHOLD),
            max_features: file.max_features.unwrap_or(DEFAULT_MAX_FEATURES),
            fast_threshold: file.fast_threshold.unwrap_or(DEFAULT_FAST_THRESHOLD),
            min_feature_distance: file
                .min_feature_distance
                .unwrap_or(DEFAULT_MIN_FEATURE_DISTANCE),
            track_window: file.track_window.unwrap_or(DEFAULT_TRACK_WINDOW),
            pyramid_levels: file.pyramid_levels.unwrap_or(DEFAULT_PYRAMID_LEVELS),
        };

        let output = OutputConfig {
            path: PathBuf::from(
                file.output_path
                    .unwrap_or_else(|| DEFAULT_OUTPUT_PATH.to_string()),
            ),
            frame_tick: file.log_frame_tick.unwrap_or(true),
            timestamp: file.log_timestamp.unwrap_or(false),
            color_metrics: file.log_color_metrics.unwrap_or(true),
        };

        Ok(Self {
            id: file.id.unwrap_or_else(|| DEFAULT_RUN_ID.to_string()),
            mode,
            feed,
            cascade,
            detection,
            flow,
            output,
            real_rpm: file.real_rpm,
        })
    }

    fn apply_env(&mut self) {
        if let Ok(target) = std::env::var("RPM_TARGET") {
            if !target.trim().is_empty() {
                self.feed.target = target;
            }
        }
        if let Ok(path) = std::env::var("RPM_OUTPUT_PATH") {
            if !path.trim().is_empty() {
                self.output.path = PathBuf::from(path);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.feed.target.trim().is_empty() {
            return Err(anyhow!("config: target must not be empty"));
        }
        if self.feed.fps <= 0.0 {
            return Err(anyhow!("config: fps must be positive"));
        }
        if let Some(crop) = &self.feed.crop {
            if crop.y1 <= crop.y0 || crop.x1 <= crop.x0 {
                return Err(anyhow!(
                    "config: crop_points must have positive extents, got y {}..{} x {}..{}",
                    crop.y0,
                    crop.y1,
                    crop.x0,
                    crop.x1
                ));
            }
        }
        if self.feed.contrast_multiplier <= 0.0 {
            return Err(anyhow!("config: contrast_multiplier must be positive"));
        }

        if !(1..=4).contains(&self.cascade.quadrant) {
            return Err(anyhow!(
                "config: quadrant must be 1..=4, got {}",
                self.cascade.quadrant
            ));
        }
        if self.cascade.target_num_boxes == 0 || self.cascade.target_box_size == 0 {
            return Err(anyhow!("config: box count and size must be positive"));
        }
        if self.cascade.start_from_box == 0 {
            return Err(anyhow!("config: start_from_box is 1-based, got 0"));
        }
        if self.cascade.frame_buffer_size == 0 {
            return Err(anyhow!("config: frame_buffer_size must be at least 1"));
        }
        if self.cascade.color_delta_update_frequency == 0 {
            return Err(anyhow!(
                "config: color_delta_update_frequency must be at least 1"
            ));
        }
        if self.cascade.kernel_size[0] == 0 || self.cascade.kernel_size[1] == 0 {
            return Err(anyhow!("config: erosion_dilation_kernel_size must be positive"));
        }

        if self.detection.threshold_multiplier <= 0.0 {
            return Err(anyhow!("config: threshold_multiplier must be positive"));
        }
        if self.detection.ceiling.max_rpm() <= 0.0 {
            return Err(anyhow!("config: the rpm ceiling must be positive"));
        }
        if self.detection.max_rpm_drop <= 0.0 {
            return Err(anyhow!("config: max_rpm_drop must be positive"));
        }

        if self.flow.pixel_threshold <= 0.0 {
            return Err(anyhow!("config: pixel_threshold must be positive"));
        }
        if self.flow.deadzone_size.0 == 0 || self.flow.deadzone_size.1 == 0 {
            return Err(anyhow!("config: deadzone_size must be positive"));
        }
        if self.flow.max_features == 0 {
            return Err(anyhow!("config: max_features must be at least 1"));
        }
        if self.flow.track_window < 3 {
            return Err(anyhow!("config: track_window must be at least 3"));
        }
        if self.flow.pyramid_levels == 0 {
            return Err(anyhow!("config: pyramid_levels must be at least 1"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<RunConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
