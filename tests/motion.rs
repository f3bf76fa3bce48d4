//! Plate moves through the simulated controller.

use rust_workcell::config::MotionConfig;
use rust_workcell::error::ErrorCode;
use rust_workcell::estop::EstopFlag;
use rust_workcell::motion::{
    AxisController, MotionDriver, RotationAxis, RotationStep, SimulatedAxes,
};
use std::sync::Arc;
use std::time::Duration;

fn rotated_config() -> MotionConfig {
    MotionConfig {
        rotations: vec![RotationStep {
            axis: RotationAxis::Z,
            angle_deg: 90.0,
        }],
        plate_affine: Some([[1.0, 0.0, 5.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_rotation_and_offset_reach_motor_axes() {
    let axes = Arc::new(SimulatedAxes::new(3, 4));
    let driver = MotionDriver::new(axes.clone(), &rotated_config(), EstopFlag::new());

    let report = driver.move_plate("5, 2, 0.5").await;
    assert_eq!(report.error, ErrorCode::None, "{:?}", report.message);
    // plate = R_z(90) * motor + (5, 0): motor (2, 0) lands on plate (5, 2)
    assert!((axes.position(0).await.unwrap() - 2.0).abs() < 1e-9);
    assert!(axes.position(1).await.unwrap().abs() < 1e-9);
    assert!((axes.position(2).await.unwrap() - 0.5).abs() < 1e-9);

    let plate = driver.current_plate_position().await.unwrap();
    assert!((plate[0] - 5.0).abs() < 1e-9 && (plate[1] - 2.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_recalibration_changes_targets() {
    let axes = Arc::new(SimulatedAxes::new(3, 1));
    let driver = MotionDriver::new(axes.clone(), &MotionConfig::default(), EstopFlag::new());
    driver.update_plate_calibration([[2.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 1.0]]);
    let report = driver.move_plate(vec![4.0, 6.0]).await;
    assert_eq!(report.error, ErrorCode::None);
    assert_eq!(axes.position(0).await.unwrap(), 2.0);
    assert_eq!(axes.position(1).await.unwrap(), 3.0);
}

#[tokio::test(start_paused = true)]
async fn test_singular_calibration_refuses_moves() {
    let axes = Arc::new(SimulatedAxes::new(3, 1));
    let driver = MotionDriver::new(axes, &MotionConfig::default(), EstopFlag::new());
    driver.update_plate_calibration([[1.0, 1.0, 0.0], [1.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
    let report = driver.move_plate("1, 1").await;
    assert_eq!(report.error, ErrorCode::Setup);
    assert!(report.axes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_bad_input_is_numerical() {
    let driver = MotionDriver::new(
        Arc::new(SimulatedAxes::new(3, 1)),
        &MotionConfig::default(),
        EstopFlag::new(),
    );
    let report = driver.move_plate("1, north").await;
    assert_eq!(report.error, ErrorCode::Numerical);
}

#[tokio::test(start_paused = true)]
async fn test_estop_during_motion_stops_axes() {
    let axes = Arc::new(SimulatedAxes::new(3, 1_000));
    let estop = EstopFlag::new();
    let driver = MotionDriver::new(axes.clone(), &MotionConfig::default(), estop.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        estop.set(true);
    });
    let report = driver.move_plate("1, 2, 3").await;
    assert_eq!(report.error, ErrorCode::Estop);
    assert_eq!(report.axes.len(), 3);
    assert!(!axes.is_moving(0).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_instrument_calibration_round_trip() {
    let config = MotionConfig {
        instrument_calibration: Some([
            [2.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 1.0],
            [0.0, 0.0, 0.0, 1.0],
        ]),
        ..rotated_config()
    };
    let axes = Arc::new(SimulatedAxes::new(3, 1));
    let driver = MotionDriver::new(axes.clone(), &config, EstopFlag::new());

    let report = driver.move_plate("5, 2, 0.5").await;
    assert_eq!(report.error, ErrorCode::None, "{:?}", report.message);
    // rotate, scale x by 2 and lift z by 1, then shift by the plate offset
    assert!((axes.position(0).await.unwrap() - 2.0).abs() < 1e-9);
    assert!(axes.position(1).await.unwrap().abs() < 1e-9);
    assert!((axes.position(2).await.unwrap() + 0.5).abs() < 1e-9);
    let plate = driver.current_plate_position().await.unwrap();
    for (got, want) in plate.iter().zip([5.0, 2.0, 0.5]) {
        assert!((got - want).abs() < 1e-9, "{:?}", plate);
    }

    let identity = [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ];
    driver.update_instrument_calibration(identity);
    let report = driver.move_plate("5, 2, 0.5").await;
    assert_eq!(report.error, ErrorCode::None);
    assert!((axes.position(2).await.unwrap() - 0.5).abs() < 1e-9);
}
