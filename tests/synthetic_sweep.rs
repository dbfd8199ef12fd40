//! End-to-end checks against synthetic frame sequences with known motion.

use image::{GrayImage, Luma};

use turbine_rpm::cascade::{BoxCascade, CascadeConfig, Stacking};
use turbine_rpm::runloop::EstimationLoop;
use turbine_rpm::{EstimationMode, Estimator, FeedSource, Frame, RunConfig};

const WIDTH: u32 = 200;
const HEIGHT: u32 = 200;
const BACKGROUND: u8 = 10;
const PATCH: u8 = 250;
const PATCH_SIDE: u32 = 10;
/// Patch speed in pixels per frame.
const SPEED: u32 = 5;

fn sweep_frame(index: u64) -> Frame {
    let mut gray = GrayImage::from_pixel(WIDTH, HEIGHT, Luma([BACKGROUND]));
    // The patch moves left to right along y = 85 at SPEED px/frame.
    let patch_x = SPEED * (index as u32 - 1);
    for y in 85..85 + PATCH_SIDE {
        for x in patch_x..(patch_x + PATCH_SIDE).min(WIDTH) {
            gray.put_pixel(x, y, Luma([PATCH]));
        }
    }
    Frame { index, gray }
}

#[test]
fn sweeping_patch_spikes_the_global_average_at_the_predicted_frame() {
    // A single box on the horizontal centerline of quadrant 1:
    // center (110, 90), half-size 10, so x 100..120 and y 80..100.
    let config = CascadeConfig {
        quadrant: 1,
        target_num_boxes: 1,
        target_box_size: 10,
        resize_boxes: false,
        adjust_num_boxes: false,
        start_from_box: 1,
        trim_last_n_boxes: 0,
        stacking: Stacking::Horizontal,
        frame_buffer_size: 1,
        color_delta_update_frequency: 1,
        kernel_size: [3, 3],
        dilation_iterations: 1,
        erosion_iterations: 1,
    };
    let mut cascade = BoxCascade::new(config, WIDTH, HEIGHT).expect("cascade");

    // The patch's leading edge reaches the box at x = 100 once its origin
    // passes 90, which at 5 px/frame happens on frame 20.
    let predicted_frame: u64 = 20;

    let mut peak_frame = 0u64;
    let mut peak_value = f64::MIN;
    for index in 1..=40u64 {
        cascade.observe(&sweep_frame(index));
        let value = cascade.global_average();
        if value > peak_value {
            peak_value = value;
            peak_frame = index;
        }
    }

    assert!(peak_value > 0.0, "the sweep must raise the global average");
    assert!(
        peak_frame.abs_diff(predicted_frame) <= 1,
        "expected the spike near frame {}, got {} (peak {:.3})",
        predicted_frame,
        peak_frame,
        peak_value
    );
}

#[test]
fn bounded_synthetic_run_completes_cleanly() {
    let config_json = r#"{
        "target": "stub://rotor?rpm=15&frames=90&size=200",
        "fps": 30,
        "mode": "bpm",
        "quadrant": 1,
        "target_num_boxes": 3,
        "target_box_size": 10,
        "adjust_num_boxes": true,
        "stack_boxes_horizontally": true,
        "frame_buffer_size": 2,
        "real_rpm": 15.0
    }"#;

    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("run.json");
    std::fs::write(&config_path, config_json).expect("write config");

    let config = RunConfig::load(&config_path).expect("load config");
    assert_eq!(config.mode, EstimationMode::Bpm);

    let source = FeedSource::open(config.feed.clone()).expect("open feed");
    let (width, height) = source.output_dimensions();
    assert_eq!((width, height), (200, 200));

    let estimator = Estimator::for_run(&config, width, height).expect("estimator");
    let summary = EstimationLoop::new(source, estimator, config.real_rpm)
        .run()
        .expect("run");

    assert_eq!(summary.frames, 90);
    assert_eq!(summary.read_failures, 0);
    // Sample frame indices must be strictly increasing.
    let frames: Vec<u64> = summary.samples.iter().map(|s| s.frame).collect();
    assert!(frames.windows(2).all(|w| w[0] < w[1]));
    // Accepted estimates stay positive and near the plausibility bounds
    // (the first below the ceiling, later ones within the band of their
    // predecessor).
    assert!(summary.samples.iter().all(|s| s.rpm > 0.0 && s.rpm < 45.0));
}

#[test]
fn optical_flow_run_on_synthetic_rotor_completes() {
    let config_json = r#"{
        "target": "stub://rotor?rpm=12&frames=40&size=200",
        "fps": 30,
        "mode": "opticalflow",
        "deadzone_shape": "circle",
        "deadzone_size": [40, 40],
        "max_features": 40,
        "real_rpm": 12.0
    }"#;

    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("flow.json");
    std::fs::write(&config_path, config_json).expect("write config");

    let config = RunConfig::load(&config_path).expect("load config");
    let source = FeedSource::open(config.feed.clone()).expect("open feed");
    let (width, height) = source.output_dimensions();
    let estimator = Estimator::for_run(&config, width, height).expect("estimator");

    let summary = EstimationLoop::new(source, estimator, config.real_rpm)
        .run()
        .expect("run");

    assert_eq!(summary.frames, 40);
    // Whether tracks survive depends on scene texture; what must hold is
    // that every frame either produced a sample or was counted, and that
    // produced samples are positive and ordered.
    assert!(summary.samples.iter().all(|s| s.rpm >= 0.0));
    let frames: Vec<u64> = summary.samples.iter().map(|s| s.frame).collect();
    assert!(frames.windows(2).all(|w| w[0] < w[1]));
}
