//! Tick detection and RPM derivation.
//!
//! The state machine turns the cascade's aggregate delta signal into
//! debounced blade-pass ticks. The trigger threshold adapts to ambient
//! lighting and noise: the recent signal window's histogram mode is the
//! baseline and its standard deviation scales the threshold, instead of a
//! fixed constant. Tick spacing converts to RPM through the three-blade
//! rotation period, and candidates outside the physical plausibility
//! bounds are recorded but never surface in the output series.

use std::collections::VecDeque;

use crate::stats;

/// Evenly spaced rotor blades: one tick per third of a rotation.
const BLADE_COUNT: f64 = 3.0;

/// Empirical ceiling-regression constants, fitted against rotor diameter.
/// Calibration data from field measurements, not physics; replace the
/// table when recalibrating.
const DIRECT_DRIVE_SCALE: f64 = 52_000.0;
const DIRECT_DRIVE_OFFSET: f64 = 4.0;
const GEARED_SCALE: f64 = 1_400.0;
const GEARED_OFFSET: f64 = 2.5;

/// Convert the frame spacing of two consecutive ticks into RPM.
pub fn calculate_rpm_from_frame_time(frame_delta: u64, fps: f64) -> f64 {
    60.0 / ((frame_delta as f64 / fps) * BLADE_COUNT)
}

/// Upper plausibility bound for accepted RPM values.
#[derive(Clone, Copy, Debug)]
pub enum RpmCeiling {
    /// Fixed ceiling in RPM.
    Fixed(f64),
    /// Ceiling derived from rotor diameter in meters.
    Regression { diameter: f64, direct_drive: bool },
}

impl RpmCeiling {
    pub fn max_rpm(&self) -> f64 {
        match *self {
            RpmCeiling::Fixed(limit) => limit,
            RpmCeiling::Regression {
                diameter,
                direct_drive,
            } => {
                if direct_drive {
                    DIRECT_DRIVE_SCALE / (diameter * diameter) + DIRECT_DRIVE_OFFSET
                } else {
                    GEARED_SCALE / diameter + GEARED_OFFSET
                }
            }
        }
    }
}

/// Detection parameters, immutable for a run.
#[derive(Clone, Debug)]
pub struct DetectionConfig {
    pub fps: f64,
    /// Trigger at mode + multiplier * deviation.
    pub threshold_multiplier: f64,
    /// Signal window length in frames; roughly one second.
    pub window_len: usize,
    /// Minimum frames between a tick and re-arming the trigger.
    pub cooldown_frames: u64,
    /// Bounded history of accepted RPM values.
    pub history_len: usize,
    pub ceiling: RpmCeiling,
    /// A turbine cannot shed more than this many RPM between ticks.
    pub max_rpm_drop: f64,
}

impl DetectionConfig {
    pub fn for_fps(fps: f64) -> Self {
        Self {
            fps,
            threshold_multiplier: 2.0,
            window_len: (fps.round() as usize).max(2),
            cooldown_frames: 5,
            history_len: 5,
            ceiling: RpmCeiling::Fixed(30.0),
            max_rpm_drop: 5.0,
        }
    }
}

/// Debounced blade-pass detector.
///
/// Owned and mutated by exactly one estimation run; updated once per
/// frame with the cascade's global delta average.
pub struct DetectionStateMachine {
    config: DetectionConfig,
    enabled: bool,
    window: VecDeque<f64>,
    /// Frame numbers of the last two ticks.
    ticks: VecDeque<u64>,
    history: VecDeque<f64>,
    mode: f64,
    deviation: f64,
    last_tick: Option<u64>,
    ticks_total: u64,
    rejected_total: u64,
}

impl DetectionStateMachine {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_len),
            ticks: VecDeque::with_capacity(2),
            history: VecDeque::with_capacity(config.history_len),
            config,
            enabled: true,
            mode: 0.0,
            deviation: 0.0,
            last_tick: None,
            ticks_total: 0,
            rejected_total: 0,
        }
    }

    /// Feed one frame's signal value. Returns a newly accepted RPM value
    /// when this frame completed a plausible tick pair.
    pub fn update(&mut self, frame_index: u64, signal: f64) -> Option<f64> {
        if self.window.len() == self.config.window_len {
            self.window.pop_front();
        }
        self.window.push_back(signal);

        let window: Vec<f64> = self.window.iter().copied().collect();
        self.mode = stats::top_mode(&window);
        self.deviation = stats::std_deviation(&window);
        let threshold = self.config.threshold_multiplier * self.deviation;

        let mut accepted = None;

        if self.enabled && threshold > f64::EPSILON && signal > self.mode + threshold {
            self.ticks.push_back(frame_index);
            while self.ticks.len() > 2 {
                self.ticks.pop_front();
            }
            self.ticks_total += 1;
            self.last_tick = Some(frame_index);
            // One tick fired; stay quiet until the signal stabilizes.
            self.enabled = false;

            if self.ticks.len() == 2 {
                let interval = self.ticks[1].saturating_sub(self.ticks[0]);
                if interval > 0 {
                    let rpm = calculate_rpm_from_frame_time(interval, self.config.fps);
                    if self.plausible(rpm) {
                        if self.history.len() == self.config.history_len {
                            self.history.pop_front();
                        }
                        self.history.push_back(rpm);
                        accepted = Some(rpm);
                    } else {
                        self.rejected_total += 1;
                        log::debug!(
                            "implausible tick pair at frame {}: {:.2} rpm over {} frames",
                            frame_index,
                            rpm,
                            interval
                        );
                    }
                }
            }
        } else if !self.enabled {
            let inside =
                signal > self.mode - threshold && signal < self.mode + threshold;
            let cooled = self
                .last_tick
                .map_or(true, |t| frame_index.saturating_sub(t) >= self.config.cooldown_frames);
            if inside && cooled {
                self.enabled = true;
            }
        }

        accepted
    }

    /// A candidate is plausible below the ceiling, or when it stays inside
    /// the acceleration band around the previous accepted value.
    fn plausible(&self, rpm: f64) -> bool {
        let max_rpm = self.config.ceiling.max_rpm();
        match self.history.back() {
            Some(&last) => {
                rpm < max_rpm
                    || (rpm > last - self.config.max_rpm_drop
                        && rpm < last + self.config.max_rpm_drop)
            }
            None => rpm < max_rpm,
        }
    }

    /// Smoothed output: mean of the accepted RPM history.
    pub fn rpm(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        let values: Vec<f64> = self.history.iter().copied().collect();
        Some(stats::mean(&values))
    }

    pub fn mode(&self) -> f64 {
        self.mode
    }

    pub fn deviation(&self) -> f64 {
        self.deviation
    }

    pub fn threshold(&self) -> f64 {
        self.mode + self.config.threshold_multiplier * self.deviation
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks_total
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpm_from_tick_spacing() {
        // 58 frames between ticks at 30 fps, three blades.
        let rpm = calculate_rpm_from_frame_time(58, 30.0);
        assert!((rpm - 10.345).abs() < 1e-3);
    }

    #[test]
    fn ceiling_table() {
        assert_eq!(RpmCeiling::Fixed(30.0).max_rpm(), 30.0);
        let direct = RpmCeiling::Regression {
            diameter: 80.0,
            direct_drive: true,
        };
        assert!((direct.max_rpm() - 12.125).abs() < 1e-9);
        let geared = RpmCeiling::Regression {
            diameter: 70.0,
            direct_drive: false,
        };
        assert!((geared.max_rpm() - 22.5).abs() < 1e-9);
    }

    fn test_config() -> DetectionConfig {
        DetectionConfig {
            fps: 30.0,
            threshold_multiplier: 3.0,
            window_len: 10,
            cooldown_frames: 3,
            history_len: 5,
            ceiling: RpmCeiling::Fixed(30.0),
            max_rpm_drop: 5.0,
        }
    }

    /// Repeating low-amplitude baseline that never crosses the adaptive
    /// threshold on its own.
    fn baseline(i: u64) -> f64 {
        [0.0, 0.1, 0.2][(i % 3) as usize]
    }

    #[test]
    fn one_spike_yields_one_tick_and_one_cycle() {
        let mut machine = DetectionStateMachine::new(test_config());

        for i in 1..=12 {
            assert_eq!(machine.update(i, baseline(i)), None);
            assert!(machine.is_enabled(), "baseline must not disarm at {}", i);
        }

        // A contiguous three-frame spike: one tick, then disarmed.
        assert_eq!(machine.update(13, 5.0), None);
        assert_eq!(machine.tick_count(), 1);
        assert!(!machine.is_enabled());
        machine.update(14, 5.0);
        machine.update(15, 5.0);
        assert_eq!(machine.tick_count(), 1, "elevated signal must not re-tick");
        assert!(!machine.is_enabled());

        // Signal back inside the band and past the cooldown: re-armed.
        machine.update(16, baseline(16));
        assert!(machine.is_enabled());
    }

    #[test]
    fn second_spike_produces_rpm() {
        let mut machine = DetectionStateMachine::new(test_config());

        for i in 1..=12 {
            machine.update(i, baseline(i));
        }
        machine.update(13, 5.0);
        let mut accepted = None;
        for i in 14..=40 {
            let signal = if i == 38 { 5.0 } else { baseline(i) };
            if let Some(rpm) = machine.update(i, signal) {
                accepted = Some((i, rpm));
            }
        }

        let (frame, rpm) = accepted.expect("second tick should produce an rpm");
        assert_eq!(frame, 38);
        // 25 frames apart at 30 fps: 60 / ((25/30) * 3) = 24 rpm.
        assert!((rpm - 24.0).abs() < 1e-9);
        assert_eq!(machine.tick_count(), 2);
        assert_eq!(machine.rpm(), Some(rpm));
    }

    #[test]
    fn implausible_candidates_are_recorded_but_not_output() {
        let mut machine = DetectionStateMachine::new(test_config());
        for i in 1..=12 {
            machine.update(i, baseline(i));
        }
        // Two ticks only 2 frames apart: 300 rpm, far beyond the ceiling.
        machine.update(13, 5.0);
        machine.update(14, baseline(14));
        machine.update(15, baseline(15));
        machine.update(16, baseline(16)); // re-armed here
        let out = machine.update(17, 20.0);
        assert_eq!(out, None);
        assert_eq!(machine.tick_count(), 2);
        assert_eq!(machine.rejected_count(), 1);
        assert_eq!(machine.rpm(), None);
    }

    #[test]
    fn acceleration_band_admits_values_above_ceiling() {
        let config = DetectionConfig {
            ceiling: RpmCeiling::Fixed(30.0),
            ..test_config()
        };
        let mut machine = DetectionStateMachine::new(config);
        machine.history.push_back(28.0);
        assert!(machine.plausible(31.0), "within band of previous value");
        assert!(machine.plausible(12.0), "below ceiling");
        assert!(!machine.plausible(50.0), "beyond ceiling and band");
    }
}
