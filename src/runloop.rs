//! The frame-by-frame estimation loop.
//!
//! Single-threaded and synchronous: the only suspension point is the
//! blocking frame read, and each frame is fully processed before the next
//! read. One strategy runs per loop; dispatch is over an explicit enum,
//! never runtime type inspection. Cancellation is cooperative: a stop
//! flag checked once per iteration, set from a Ctrl-C handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::cascade::BoxCascade;
use crate::config::{EstimationMode, RunConfig};
use crate::detect::DetectionStateMachine;
use crate::flow::OpticalFlowTracker;
use crate::frame::Frame;
use crate::ingest::FeedSource;
use crate::output::{LogRecord, RunLog};
use crate::stats;

/// One accepted estimate. Immutable once appended to the series.
#[derive(Clone, Copy, Debug)]
pub struct RpmSample {
    pub frame: u64,
    pub rpm: f64,
    /// Error against the configured ground-truth rotor speed, in percent.
    pub error_pct: Option<f64>,
}

/// Signal values worth logging alongside a frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct Diagnostics {
    pub delta: f64,
    pub mode: f64,
    pub threshold: f64,
    pub rpm: f64,
}

/// Blade-pass estimation state for one run.
pub struct BpmRun {
    cascade: BoxCascade,
    state: DetectionStateMachine,
}

impl BpmRun {
    pub fn new(
        cascade_config: crate::cascade::CascadeConfig,
        detection_config: crate::detect::DetectionConfig,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let cascade = BoxCascade::new(cascade_config, width, height)?;
        log::info!("blade-pass run: {} detection boxes", cascade.len());
        Ok(Self {
            cascade,
            state: DetectionStateMachine::new(detection_config),
        })
    }
}

/// Optical-flow estimation state for one run.
pub struct FlowRun {
    tracker: OpticalFlowTracker,
    last_rpm: f64,
}

impl FlowRun {
    pub fn new(flow_config: crate::flow::FlowConfig, fps: f64, width: u32, height: u32) -> Self {
        Self {
            tracker: OpticalFlowTracker::new(flow_config, fps, width, height),
            last_rpm: 0.0,
        }
    }
}

/// The active estimation strategy.
pub enum Estimator {
    Bpm(BpmRun),
    Flow(FlowRun),
}

impl Estimator {
    /// Build the estimator a run config asks for, sized to the feed's
    /// processed frame dimensions.
    pub fn for_run(config: &RunConfig, width: u32, height: u32) -> Result<Self> {
        match config.mode {
            EstimationMode::Bpm => Ok(Estimator::Bpm(BpmRun::new(
                config.cascade.clone(),
                config.detection.clone(),
                width,
                height,
            )?)),
            EstimationMode::OpticalFlow => Ok(Estimator::Flow(FlowRun::new(
                config.flow.clone(),
                config.feed.fps,
                width,
                height,
            ))),
        }
    }

    /// Feed one frame; returns a sample when the strategy accepted a new
    /// estimate on this frame.
    pub fn next_sample(&mut self, frame: &Frame, real_rpm: Option<f64>) -> Option<RpmSample> {
        let rpm = match self {
            Estimator::Bpm(run) => {
                run.cascade.observe(frame);
                run.state.update(frame.index, run.cascade.global_average())
            }
            Estimator::Flow(run) => {
                let rpm = run.tracker.next_rpm(frame);
                if let Some(rpm) = rpm {
                    run.last_rpm = rpm;
                }
                rpm
            }
        }?;

        Some(RpmSample {
            frame: frame.index,
            rpm,
            error_pct: real_rpm.map(|real| stats::error_percentage(rpm, real)),
        })
    }

    pub fn diagnostics(&self) -> Diagnostics {
        match self {
            Estimator::Bpm(run) => Diagnostics {
                delta: run.cascade.global_average(),
                mode: run.state.mode(),
                threshold: run.state.threshold(),
                rpm: run.state.rpm().unwrap_or(0.0),
            },
            Estimator::Flow(run) => Diagnostics {
                rpm: run.last_rpm,
                ..Diagnostics::default()
            },
        }
    }

    /// Frames where tracking produced nothing usable (flow strategy only).
    pub fn tracking_failures(&self) -> u64 {
        match self {
            Estimator::Bpm(_) => 0,
            Estimator::Flow(run) => run.tracker.tracking_failures(),
        }
    }

    /// Tick pairs rejected as physically implausible (blade-pass only).
    pub fn rejected_ticks(&self) -> u64 {
        match self {
            Estimator::Bpm(run) => run.state.rejected_count(),
            Estimator::Flow(_) => 0,
        }
    }
}

/// Everything a finished run reports.
#[derive(Debug)]
pub struct RunSummary {
    pub frames: u64,
    pub samples: Vec<RpmSample>,
    pub read_failures: u64,
    pub tracking_failures: u64,
    pub rejected_ticks: u64,
}

impl RunSummary {
    pub fn mean_rpm(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let values: Vec<f64> = self.samples.iter().map(|s| s.rpm).collect();
        Some(stats::mean(&values))
    }

    pub fn mean_error_pct(&self) -> Option<f64> {
        let errors: Vec<f64> = self
            .samples
            .iter()
            .filter_map(|s| s.error_pct)
            .collect();
        if errors.is_empty() {
            return None;
        }
        Some(stats::mean(&errors))
    }
}

/// Drives one estimation run to completion.
pub struct EstimationLoop {
    pub source: FeedSource,
    pub estimator: Estimator,
    pub log: Option<RunLog>,
    /// Log every frame instead of only accepted samples.
    pub deploy: bool,
    pub real_rpm: Option<f64>,
    pub stop: Arc<AtomicBool>,
}

impl EstimationLoop {
    pub fn new(source: FeedSource, estimator: Estimator, real_rpm: Option<f64>) -> Self {
        Self {
            source,
            estimator,
            log: None,
            deploy: false,
            real_rpm,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run until the feed reports itself inactive or the stop flag is
    /// raised. Frames are processed strictly in arrival order, so sample
    /// frame indices are monotonically increasing.
    pub fn run(mut self) -> Result<RunSummary> {
        let mut samples = Vec::new();

        loop {
            if self.stop.load(Ordering::Relaxed) {
                log::info!("stop requested, finishing run");
                break;
            }
            let Some(frame) = self.source.next_frame()? else {
                log::info!("feed inactive, finishing run");
                break;
            };

            let sample = self.estimator.next_sample(&frame, self.real_rpm);
            if let Some(sample) = sample {
                log::info!(
                    "frame {}: {:.3} rpm{}",
                    sample.frame,
                    sample.rpm,
                    sample
                        .error_pct
                        .map(|e| format!(" (error {:.2}%)", e))
                        .unwrap_or_default()
                );
                samples.push(sample);
            }

            if let Some(run_log) = &mut self.log {
                let diag = self.estimator.diagnostics();
                let record = LogRecord {
                    frame: frame.index,
                    delta: diag.delta,
                    mode: diag.mode,
                    threshold: diag.threshold,
                    rpm: sample.map(|s| s.rpm).unwrap_or(diag.rpm),
                };
                if self.deploy {
                    run_log.append(&record)?;
                } else if sample.is_some() {
                    run_log.append(&record)?;
                }
            }
        }

        if let Some(run_log) = &mut self.log {
            run_log.flush()?;
            log::info!("run log flushed with {} records", run_log.records());
        }

        let stats = self.source.stats();
        Ok(RunSummary {
            frames: stats.frames_read,
            samples,
            read_failures: stats.read_failures,
            tracking_failures: self.estimator.tracking_failures(),
            rejected_ticks: self.estimator.rejected_ticks(),
        })
    }
}
