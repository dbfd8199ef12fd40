//! rpmd - rotor speed estimation runner
//!
//! Loads a JSON run configuration, opens the configured feed, and drives
//! one estimation run to completion:
//!
//! 1. Open the feed (video file, V4L2 device, or synthetic scene)
//! 2. Build the configured strategy (blade-pass cascade or optical flow)
//! 3. Process frames until the feed ends or Ctrl-C is pressed
//! 4. Print the run summary; optionally append to the run log
//!
//! Exits 0 on normal completion (feed exhausted or user cancel) and
//! non-zero on configuration or device failures.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;

use turbine_rpm::runloop::EstimationLoop;
use turbine_rpm::{Estimator, FeedSource, RunConfig, RunLog};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the JSON run configuration.
    cfg: PathBuf,
    /// Append accepted estimates to the configured run log.
    #[arg(short = 'l', long = "log")]
    log: bool,
    /// Deploy mode: no interactive output pacing, write the run log
    /// continuously (one record per frame).
    #[arg(short = 'd', long = "deploy")]
    deploy: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = RunConfig::load(&args.cfg)
        .with_context(|| format!("load run config {}", args.cfg.display()))?;

    log::info!(
        "run {}: mode={:?} target={} fps={}",
        config.id,
        config.mode,
        config.feed.target,
        config.feed.fps
    );

    let source = FeedSource::open(config.feed.clone())
        .with_context(|| format!("open feed {}", config.feed.target))?;
    let (width, height) = source.output_dimensions();
    log::info!("feed open: processing {}x{} frames", width, height);

    let estimator = Estimator::for_run(&config, width, height)?;

    let mut estimation = EstimationLoop::new(source, estimator, config.real_rpm);
    estimation.deploy = args.deploy;
    if args.log || args.deploy {
        estimation.log = Some(RunLog::create(config.output.clone())?);
        log::info!("run log: {}", config.output.path.display());
    }

    let stop = estimation.stop.clone();
    ctrlc::set_handler(move || {
        stop.store(true, Ordering::Relaxed);
    })
    .expect("error setting Ctrl-C handler");

    let summary = estimation.run()?;

    log::info!(
        "run {} finished: {} frames, {} samples, {} skipped reads, {} empty tracks, {} rejected ticks",
        config.id,
        summary.frames,
        summary.samples.len(),
        summary.read_failures,
        summary.tracking_failures,
        summary.rejected_ticks
    );
    match summary.mean_rpm() {
        Some(rpm) => {
            let error = summary
                .mean_error_pct()
                .map(|e| format!(", mean error {:.2}%", e))
                .unwrap_or_default();
            println!("mean rpm: {:.3}{}", rpm, error);
        }
        None => println!("no rpm samples accepted"),
    }

    Ok(())
}
