//! Frame ingestion.
//!
//! `FeedSource` owns the capture backend and applies the fixed per-frame
//! pipeline in calibration order: read, crop, contrast adjust, perspective
//! correct. Downstream thresholds are calibrated against that ordering.
//!
//! Backends:
//! - `stub://` synthetic rotor scenes (always available, used by tests)
//! - Local video files (feature: ingest-file-ffmpeg)
//! - V4L2 devices (feature: ingest-v4l2)
//!
//! The ingestion layer is responsible for:
//! - Reporting end-of-feed explicitly (`Ok(None)`), never a garbage frame
//! - Skipping transient undecodable frames with a counter, without
//!   treating them as stream end
//! - Incrementing the frame counter on every successful read; that
//!   counter is the clock for tick-interval RPM math

#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub(crate) mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub(crate) mod v4l2;

use anyhow::{bail, Result};
use image::GrayImage;
use imageproc::geometric_transformations::Projection;

use crate::frame::{apply_contrast, Frame};
use crate::geometry;
use synthetic::SyntheticRotor;

/// Consecutive undecodable frames tolerated before the feed is declared
/// broken rather than merely glitching.
const MAX_CONSECUTIVE_READ_FAILURES: u32 = 30;

/// Crop rectangle in frame coordinates, `[y0, y1)` by `[x0, x1)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropRect {
    pub y0: u32,
    pub y1: u32,
    pub x0: u32,
    pub x1: u32,
}

impl CropRect {
    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }
}

/// Feed parameters, immutable for a run.
#[derive(Clone, Debug)]
pub struct FeedConfig {
    /// Capture target: a local video path, a /dev/video device, or a
    /// stub:// scene.
    pub target: String,
    pub fps: f64,
    pub crop: Option<CropRect>,
    /// Intensity rescale applied after cropping; 1.0 disables it.
    pub contrast_multiplier: f32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            target: "stub://rotor".to_string(),
            fps: 30.0,
            crop: None,
            contrast_multiplier: 1.0,
        }
    }
}

/// Feed statistics for health logging.
#[derive(Clone, Debug)]
pub struct FeedStats {
    pub frames_read: u64,
    pub read_failures: u64,
    pub target: String,
}

enum Backend {
    Synthetic(SyntheticRotor),
    #[cfg(feature = "ingest-file-ffmpeg")]
    File(file_ffmpeg::FfmpegFileFeed),
    #[cfg(feature = "ingest-v4l2")]
    Device(v4l2::V4l2Feed),
}

/// The frame source for one estimation run.
pub struct FeedSource {
    config: FeedConfig,
    backend: Backend,
    squaring: Option<(Projection, u32)>,
    frames_read: u64,
    read_failures: u64,
}

impl FeedSource {
    /// Open the configured target. Fails when the device or file cannot
    /// be opened, or when the crop does not fit the captured frames.
    pub fn open(config: FeedConfig) -> Result<Self> {
        let backend = open_backend(&config)?;

        let mut source = Self {
            config,
            backend,
            squaring: None,
            frames_read: 0,
            read_failures: 0,
        };

        let (raw_w, raw_h) = source.raw_dimensions();
        if let Some(crop) = &source.config.crop {
            if crop.x1 > raw_w || crop.y1 > raw_h {
                bail!(
                    "crop {}..{} x {}..{} exceeds the {}x{} capture size",
                    crop.x0,
                    crop.x1,
                    crop.y0,
                    crop.y1,
                    raw_w,
                    raw_h
                );
            }
        }

        let (w, h) = source.cropped_dimensions();
        source.squaring = geometry::squaring_projection(w, h);
        if let Some((_, side)) = &source.squaring {
            log::info!(
                "feed: non-square {}x{} crop, squaring to {}x{}",
                w,
                h,
                side,
                side
            );
        }
        Ok(source)
    }

    fn raw_dimensions(&self) -> (u32, u32) {
        match &self.backend {
            Backend::Synthetic(rotor) => rotor.dimensions(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            Backend::File(feed) => feed.dimensions(),
            #[cfg(feature = "ingest-v4l2")]
            Backend::Device(feed) => feed.dimensions(),
        }
    }

    fn cropped_dimensions(&self) -> (u32, u32) {
        match &self.config.crop {
            Some(crop) => (crop.width(), crop.height()),
            None => self.raw_dimensions(),
        }
    }

    /// Frame size after the full pipeline; detection geometry is set up
    /// against these dimensions.
    pub fn output_dimensions(&self) -> (u32, u32) {
        match &self.squaring {
            Some((_, side)) => (*side, *side),
            None => self.cropped_dimensions(),
        }
    }

    /// Read, crop, contrast-adjust, and perspective-correct one frame.
    ///
    /// Returns `Ok(None)` once the source reports itself exhausted.
    /// Transient undecodable frames are skipped and counted; only a long
    /// unbroken run of failures is escalated into an error.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut consecutive_failures = 0u32;
        loop {
            match self.grab() {
                Ok(Some(gray)) => {
                    self.frames_read += 1;
                    let gray = self.process(gray);
                    return Ok(Some(Frame {
                        index: self.frames_read,
                        gray,
                    }));
                }
                Ok(None) => return Ok(None),
                Err(e) => {
                    self.read_failures += 1;
                    consecutive_failures += 1;
                    log::debug!("skipping undecodable frame: {:#}", e);
                    if consecutive_failures >= MAX_CONSECUTIVE_READ_FAILURES {
                        return Err(e.context(format!(
                            "{} consecutive frame reads failed on {}",
                            consecutive_failures, self.config.target
                        )));
                    }
                }
            }
        }
    }

    fn grab(&mut self) -> Result<Option<GrayImage>> {
        match &mut self.backend {
            Backend::Synthetic(rotor) => rotor.grab(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            Backend::File(feed) => feed.grab(),
            #[cfg(feature = "ingest-v4l2")]
            Backend::Device(feed) => feed.grab(),
        }
    }

    fn process(&self, gray: GrayImage) -> GrayImage {
        let mut gray = match &self.config.crop {
            Some(crop) => image::imageops::crop_imm(
                &gray,
                crop.x0,
                crop.y0,
                crop.width(),
                crop.height(),
            )
            .to_image(),
            None => gray,
        };
        if (self.config.contrast_multiplier - 1.0).abs() > f32::EPSILON {
            apply_contrast(&mut gray, self.config.contrast_multiplier);
        }
        if let Some((projection, side)) = &self.squaring {
            gray = geometry::square_frame(&gray, projection, *side);
        }
        gray
    }

    /// Frames successfully read so far; the index of the next frame will
    /// be this plus one.
    pub fn frame_count(&self) -> u64 {
        self.frames_read
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            frames_read: self.frames_read,
            read_failures: self.read_failures,
            target: self.config.target.clone(),
        }
    }
}

fn open_backend(config: &FeedConfig) -> Result<Backend> {
    if config.target.starts_with("stub://") {
        return Ok(Backend::Synthetic(SyntheticRotor::from_target(
            &config.target,
            config.fps,
        )?));
    }
    if config.target.starts_with("/dev/video") {
        #[cfg(feature = "ingest-v4l2")]
        {
            return Ok(Backend::Device(v4l2::V4l2Feed::open(config)?));
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            bail!("live capture devices require the ingest-v4l2 feature");
        }
    }
    if config.target.contains("://") {
        bail!(
            "feed target must be a local file, a /dev/video device, or a stub:// scene, got {}",
            config.target
        );
    }
    #[cfg(feature = "ingest-file-ffmpeg")]
    {
        return Ok(Backend::File(file_ffmpeg::FfmpegFileFeed::open(config)?));
    }
    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    {
        bail!("video file ingestion requires the ingest-file-ffmpeg feature")
    }
}

impl std::fmt::Debug for FeedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSource")
            .field("target", &self.config.target)
            .field("frames_read", &self.frames_read)
            .field("read_failures", &self.read_failures)
            .finish()
    }
}
