//! Synthetic rotor scenes (stub:// targets).
//!
//! Renders a three-blade rotor spinning at a known rate over a speckled
//! dark background. Tests and demos use it as a feed with ground truth;
//! no camera or video file is required.
//!
//! Target syntax: `stub://rotor?rpm=15&frames=300&size=480`. All query
//! keys are optional; `frames` bounds the scene so the feed reports
//! itself inactive afterwards (an unbounded scene never ends).

use anyhow::{anyhow, Result};
use image::{GrayImage, Luma};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DEFAULT_SIZE: u32 = 480;
const DEFAULT_RPM: f64 = 15.0;
const BACKGROUND: u8 = 18;
const BLADE_INTENSITY: u8 = 230;
const HUB_INTENSITY: u8 = 120;
const SPECKLE_COUNT: u32 = 300;
/// Fixed seed: two runs over the same scene produce the same frames.
const SPECKLE_SEED: u64 = 0x5eed;

pub(crate) struct SyntheticRotor {
    width: u32,
    height: u32,
    fps: f64,
    rpm: f64,
    max_frames: Option<u64>,
    frames: u64,
    rng: StdRng,
}

impl SyntheticRotor {
    pub(crate) fn new(
        width: u32,
        height: u32,
        fps: f64,
        rpm: f64,
        max_frames: Option<u64>,
    ) -> Self {
        Self {
            width,
            height,
            fps,
            rpm,
            max_frames,
            frames: 0,
            rng: StdRng::seed_from_u64(SPECKLE_SEED),
        }
    }

    /// Parse a `stub://` target. Unknown query keys are rejected so typos
    /// fail at open time rather than silently running defaults.
    pub(crate) fn from_target(target: &str, fps: f64) -> Result<Self> {
        let rest = target
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("not a stub target: {}", target))?;

        let mut size = DEFAULT_SIZE;
        let mut rpm = DEFAULT_RPM;
        let mut max_frames = None;

        if let Some((_, query)) = rest.split_once('?') {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow!("malformed stub query pair: {}", pair))?;
                match key {
                    "size" => size = value.parse()?,
                    "rpm" => rpm = value.parse()?,
                    "frames" => max_frames = Some(value.parse()?),
                    other => return Err(anyhow!("unknown stub query key: {}", other)),
                }
            }
        }

        if size < 32 {
            return Err(anyhow!("stub scene size must be at least 32, got {}", size));
        }
        log::info!(
            "feed: synthetic rotor {}x{} at {:.1} rpm ({})",
            size,
            size,
            rpm,
            target
        );
        Ok(Self::new(size, size, fps, rpm, max_frames))
    }

    pub(crate) fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub(crate) fn grab(&mut self) -> Result<Option<GrayImage>> {
        if let Some(limit) = self.max_frames {
            if self.frames >= limit {
                return Ok(None);
            }
        }
        let t = self.frames as f64 / self.fps;
        self.frames += 1;

        let mut gray = GrayImage::from_pixel(self.width, self.height, Luma([BACKGROUND]));

        // Sensor speckle so the scene is not perfectly flat.
        for _ in 0..SPECKLE_COUNT {
            let x = self.rng.gen_range(0..self.width);
            let y = self.rng.gen_range(0..self.height);
            let v = self.rng.gen_range(BACKGROUND..BACKGROUND + 24);
            gray.put_pixel(x, y, Luma([v]));
        }

        let cx = (self.width / 2) as f32;
        let cy = (self.height / 2) as f32;
        let blade_length = 0.48 * self.width.min(self.height) as f32;
        let angle = 2.0 * std::f64::consts::PI * self.rpm / 60.0 * t;

        for blade in 0..3 {
            let theta =
                angle + blade as f64 * 2.0 * std::f64::consts::PI / 3.0;
            let (sin, cos) = (theta.sin() as f32, theta.cos() as f32);
            let tip = (cx + blade_length * cos, cy + blade_length * sin);
            // A few parallel segments give the blade visible width.
            for offset in [-1.0f32, 0.0, 1.0] {
                let shift = (offset * -sin, offset * cos);
                draw_line_segment_mut(
                    &mut gray,
                    (cx + shift.0, cy + shift.1),
                    (tip.0 + shift.0, tip.1 + shift.1),
                    Luma([BLADE_INTENSITY]),
                );
            }
        }

        let hub_radius = (self.width.min(self.height) / 24).max(3) as i32;
        draw_filled_circle_mut(
            &mut gray,
            (cx as i32, cy as i32),
            hub_radius,
            Luma([HUB_INTENSITY]),
        );

        Ok(Some(gray))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_parsing() -> Result<()> {
        let rotor = SyntheticRotor::from_target("stub://rotor?rpm=12.5&frames=60&size=240", 30.0)?;
        assert_eq!(rotor.dimensions(), (240, 240));
        assert_eq!(rotor.rpm, 12.5);
        assert_eq!(rotor.max_frames, Some(60));

        assert!(SyntheticRotor::from_target("stub://rotor?bogus=1", 30.0).is_err());
        assert!(SyntheticRotor::from_target("stub://rotor?size=8", 30.0).is_err());
        Ok(())
    }

    #[test]
    fn blades_rotate_between_frames() -> Result<()> {
        let mut rotor = SyntheticRotor::new(128, 128, 30.0, 20.0, None);
        let first = rotor.grab()?.unwrap();
        let second = rotor.grab()?.unwrap();
        let differing = first
            .as_raw()
            .iter()
            .zip(second.as_raw())
            .filter(|(a, b)| a != b)
            .count();
        assert!(differing > 0, "consecutive frames must differ");
        Ok(())
    }

    #[test]
    fn bounded_scene_ends() -> Result<()> {
        let mut rotor = SyntheticRotor::new(64, 64, 30.0, 15.0, Some(2));
        assert!(rotor.grab()?.is_some());
        assert!(rotor.grab()?.is_some());
        assert!(rotor.grab()?.is_none());
        Ok(())
    }
}
