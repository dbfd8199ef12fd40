//! Wind turbine rotor speed estimation from a camera feed.
//!
//! This crate estimates rotor RPM on a resource-constrained embedded
//! camera platform, from a live device or a recorded video file. Two
//! independent strategies are supported:
//!
//! 1. **Blade-pass detection**: a cascade of square regions swept from
//!    the hub outward fires a "tick" whenever a blade's shadow changes
//!    regional brightness; tick spacing gives the rotation period.
//! 2. **Optical flow**: image features outside a masked hub region are
//!    tracked frame to frame; their averaged motion converts to angular
//!    velocity through a perspective-corrected formula.
//!
//! # Module Structure
//!
//! - `ingest`: frame sources (video files, V4L2 devices, synthetic scenes)
//! - `frame`: owned grayscale frame buffers
//! - `geometry`: quadrant corners, axis mapping, masks, perspective
//! - `cascade`: blade-pass detection regions and signal aggregation
//! - `detect`: debounced tick detection and RPM plausibility bounds
//! - `flow`: feature tracking and angular-velocity conversion
//! - `stats`: mode/deviation/outlier helpers
//! - `output`: the append-only run log
//! - `runloop`: the per-frame estimation loop
//! - `config`: JSON run configuration
//!
//! The whole pipeline is single-threaded and frame-ordered; nothing is
//! shared across threads and every per-frame buffer is owned by exactly
//! one component.

pub mod cascade;
pub mod config;
pub mod detect;
pub mod flow;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod output;
pub mod runloop;
pub mod stats;

pub use cascade::{BoundingBox, BoxCascade, CascadeConfig, SampleRing, Stacking};
pub use config::{EstimationMode, RunConfig};
pub use detect::{
    calculate_rpm_from_frame_time, DetectionConfig, DetectionStateMachine, RpmCeiling,
};
pub use flow::{view_angle_scaling, FlowConfig, OpticalFlowTracker};
pub use frame::Frame;
pub use geometry::MaskShape;
pub use ingest::{CropRect, FeedConfig, FeedSource};
pub use output::{LogRecord, OutputConfig, RunLog};
pub use runloop::{EstimationLoop, Estimator, RpmSample, RunSummary};
