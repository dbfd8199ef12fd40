use std::io::Write;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use turbine_rpm::cascade::Stacking;
use turbine_rpm::{EstimationMode, MaskShape, RpmCeiling, RunConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in ["RPM_TARGET", "RPM_OUTPUT_PATH"] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_full_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "target": "recordings/turbine_a.mp4",
            "fps": 30,
            "mode": "bpm",
            "id": "run:field-7",
            "crop_points": [[100, 400], [150, 450]],
            "contrast_multiplier": 1.4,
            "real_rpm": 14.2,
            "quadrant": 2,
            "target_num_boxes": 8,
            "target_box_size": 12,
            "resize_boxes": true,
            "adjust_num_boxes": false,
            "start_from_box": 2,
            "trim_last_n_boxes": 1,
            "stack_boxes_horizontally": true,
            "frame_buffer_size": 6,
            "color_delta_update_frequency": 2,
            "threshold_multiplier": 2.5,
            "erosion_dilation_kernel_size": [5, 5],
            "dilation_iterations": 2,
            "erosion_iterations": 1,
            "rotor_diameter": 80.0,
            "direct_drive": true,
            "max_rpm_drop": 4.0,
            "cooldown_frames": 8,
            "deadzone_shape": "rect",
            "deadzone_size": [50, 50],
            "deadzone_offset_x": 5,
            "deadzone_offset_y": -3,
            "ground_angle": 12.5,
            "pixel_threshold": 8.0,
            "max_features": 60,
            "fast_threshold": 25,
            "min_feature_distance": 9.0,
            "track_window": 21,
            "pyramid_levels": 3,
            "output_path": "out/turbine_a.csv",
            "log_frame_tick": true,
            "log_timestamp": true,
            "log_color_metrics": false
        }"#,
    );

    std::env::set_var("RPM_TARGET", "stub://rotor?rpm=14.2");

    let cfg = RunConfig::load(file.path()).expect("load config");

    // Env override wins over the file target.
    assert_eq!(cfg.feed.target, "stub://rotor?rpm=14.2");
    assert_eq!(cfg.feed.fps, 30.0);
    assert_eq!(cfg.mode, EstimationMode::Bpm);
    assert_eq!(cfg.id, "run:field-7");

    let crop = cfg.feed.crop.expect("crop");
    assert_eq!((crop.y0, crop.y1, crop.x0, crop.x1), (100, 400, 150, 450));
    assert_eq!(cfg.feed.contrast_multiplier, 1.4);
    assert_eq!(cfg.real_rpm, Some(14.2));

    assert_eq!(cfg.cascade.quadrant, 2);
    assert_eq!(cfg.cascade.target_num_boxes, 8);
    assert_eq!(cfg.cascade.target_box_size, 12);
    assert!(cfg.cascade.resize_boxes);
    assert!(!cfg.cascade.adjust_num_boxes);
    assert_eq!(cfg.cascade.start_from_box, 2);
    assert_eq!(cfg.cascade.trim_last_n_boxes, 1);
    assert_eq!(cfg.cascade.stacking, Stacking::Horizontal);
    assert_eq!(cfg.cascade.frame_buffer_size, 6);
    assert_eq!(cfg.cascade.color_delta_update_frequency, 2);
    assert_eq!(cfg.cascade.kernel_size, [5, 5]);

    assert_eq!(cfg.detection.threshold_multiplier, 2.5);
    assert_eq!(cfg.detection.cooldown_frames, 8);
    assert_eq!(cfg.detection.max_rpm_drop, 4.0);
    // fps 30 -> one-second window.
    assert_eq!(cfg.detection.window_len, 30);
    match cfg.detection.ceiling {
        RpmCeiling::Regression {
            diameter,
            direct_drive,
        } => {
            assert_eq!(diameter, 80.0);
            assert!(direct_drive);
        }
        other => panic!("expected regression ceiling, got {:?}", other),
    }

    assert_eq!(cfg.flow.deadzone_shape, MaskShape::Rect);
    assert_eq!(cfg.flow.deadzone_size, (50, 50));
    assert_eq!(cfg.flow.deadzone_offset, (5, -3));
    assert_eq!(cfg.flow.ground_angle_deg, 12.5);
    assert_eq!(cfg.flow.pixel_threshold, 8.0);
    assert_eq!(cfg.flow.max_features, 60);
    assert_eq!(cfg.flow.fast_threshold, 25);
    assert_eq!(cfg.flow.track_window, 21);
    assert_eq!(cfg.flow.pyramid_levels, 3);

    assert_eq!(cfg.output.path.to_str(), Some("out/turbine_a.csv"));
    assert!(cfg.output.frame_tick);
    assert!(cfg.output.timestamp);
    assert!(!cfg.output.color_metrics);

    clear_env();
}

#[test]
fn defaults_fill_optional_fields() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "target": "stub://rotor",
            "fps": 25,
            "mode": "opticalflow"
        }"#,
    );
    let cfg = RunConfig::load(file.path()).expect("load config");

    assert_eq!(cfg.mode, EstimationMode::OpticalFlow);
    assert_eq!(cfg.cascade.quadrant, 1);
    assert_eq!(cfg.cascade.stacking, Stacking::Diagonal);
    assert_eq!(cfg.detection.window_len, 25);
    assert!(matches!(cfg.detection.ceiling, RpmCeiling::Fixed(limit) if limit == 30.0));
    assert_eq!(cfg.flow.deadzone_shape, MaskShape::Circle);
    assert!(cfg.real_rpm.is_none());

    clear_env();
}

#[test]
fn missing_required_field_fails() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{"fps": 30, "mode": "bpm"}"#);
    let err = RunConfig::load(file.path()).unwrap_err();
    assert!(err.to_string().contains("target"), "got: {}", err);

    clear_env();
}

#[test]
fn unknown_keys_fail_at_load_time() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "target": "stub://rotor",
            "fps": 30,
            "mode": "bpm",
            "target_nmu_boxes": 5
        }"#,
    );
    assert!(RunConfig::load(file.path()).is_err());

    clear_env();
}

#[test]
fn exclusive_stacking_flags_fail() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "target": "stub://rotor",
            "fps": 30,
            "mode": "bpm",
            "stack_boxes_horizontally": true,
            "stack_boxes_vertically": true
        }"#,
    );
    assert!(RunConfig::load(file.path()).is_err());

    clear_env();
}

#[test]
fn degenerate_crop_fails() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "target": "stub://rotor",
            "fps": 30,
            "mode": "bpm",
            "crop_points": [[200, 200], [0, 100]]
        }"#,
    );
    assert!(RunConfig::load(file.path()).is_err());

    clear_env();
}

#[test]
fn bad_mode_fails() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{"target": "stub://rotor", "fps": 30, "mode": "fourier"}"#);
    assert!(RunConfig::load(file.path()).is_err());

    clear_env();
}
