use approx::assert_relative_eq;
use pick_servo::calibration::{CalibrationError, DepthCalibrator};
use pick_servo::config::CalibrationConfig;
use pick_servo::interface::Arm;
use pick_servo::pose::{PerturbationBounds, Pose6D};
use pick_servo::sim::{SimConfig, SimulatedRobot};
use pick_servo::stop::StopSignal;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::f64::consts::PI;
use std::sync::Arc;

//Builds a calibrator over a simulated arm whose table sits `table_distance` below the sensor
fn make_calibrator(
    table_distance: f64,
    probe_pose: Pose6D,
    perturbation: PerturbationBounds,
) -> (DepthCalibrator<SimulatedRobot>, Arc<SimulatedRobot>, StopSignal) {
    let robot = Arc::new(SimulatedRobot::new(SimConfig {
        table_distance,
        ..SimConfig::default()
    }));
    let config = CalibrationConfig {
        probe_pose,
        perturbation,
        max_attempts: 30,
        ..CalibrationConfig::default()
    };
    let stop = StopSignal::new();
    let calibrator = DepthCalibrator::new(robot.clone(), Arm::Left, config, stop.clone());
    (calibrator, robot, stop)
}

#[tokio::test]
async fn test_fixed_reading_gives_exact_distance() {
    let probe = Pose6D::new(0.6, 0.2, 0.0, -PI, 0.0, 0.0);
    let (calibrator, robot, _) = make_calibrator(0.5, probe, PerturbationBounds::zero());
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let calibration = calibrator.calibrate(&mut rng).await.unwrap();
    assert_eq!(calibration.avg_distance, 0.5);
    assert_eq!(calibration.meters_per_pixel_at_1m, 0.0025);
    assert_relative_eq!(calibration.z_offset, 0.03, epsilon = 1e-12);
    let counters = robot.counters();
    assert_eq!(counters.range_reads, 10);
    assert_eq!(counters.moves, 10);
}

#[tokio::test]
async fn test_perturbed_heights_are_subtracted() {
    let probe = Pose6D::new(0.6, 0.2, 0.0, -PI, 0.0, 0.0);
    let (calibrator, _, _) = make_calibrator(0.25, probe, PerturbationBounds::default());
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let calibration = calibrator.calibrate(&mut rng).await.unwrap();
    // readings are rounded to whole millimeters
    assert_relative_eq!(calibration.avg_distance, 0.25, epsilon = 5e-4);
}

#[tokio::test]
async fn test_failed_moves_are_retried() {
    let probe = Pose6D::new(0.6, 0.2, 0.0, -PI, 0.0, 0.0);
    let (calibrator, robot, _) = make_calibrator(0.5, probe, PerturbationBounds::zero());
    robot.script_move_failures(3);
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let calibration = calibrator.calibrate(&mut rng).await.unwrap();
    assert_eq!(calibration.avg_distance, 0.5);
    let counters = robot.counters();
    assert_eq!(counters.moves, 13);
    assert_eq!(counters.failed_moves, 3);
    assert_eq!(counters.range_reads, 10);
}

#[tokio::test]
async fn test_unreachable_probe_pose_exhausts_attempts() {
    let probe = Pose6D::new(5.0, 0.2, 0.0, -PI, 0.0, 0.0);
    let (calibrator, robot, _) = make_calibrator(0.5, probe, PerturbationBounds::default());
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    match calibrator.calibrate(&mut rng).await {
        Err(CalibrationError::AttemptsExhausted { collected, required, attempts }) => {
            assert_eq!(collected, 0);
            assert_eq!(required, 10);
            assert_eq!(attempts, 30);
        }
        other => panic!("expected exhausted attempts, got {:?}", other),
    }
    assert_eq!(robot.counters().moves, 0);
}

#[tokio::test]
async fn test_out_of_range_readings_are_discarded() {
    let probe = Pose6D::new(0.6, 0.2, 0.0, -PI, 0.0, 0.0);
    // 70 m to the table reads as the out-of-range sentinel
    let (calibrator, robot, _) = make_calibrator(70.0, probe, PerturbationBounds::zero());
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let result = calibrator.calibrate(&mut rng).await;
    assert!(matches!(result, Err(CalibrationError::AttemptsExhausted { collected: 0, .. })), "{:?}", result);
    assert_eq!(robot.counters().range_reads, 30);
}

#[tokio::test]
async fn test_negative_average_is_rejected() {
    let probe = Pose6D::new(0.6, 0.2, 0.3, -PI, 0.0, 0.0);
    let (calibrator, _, _) = make_calibrator(-0.1, probe, PerturbationBounds::zero());
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let result = calibrator.calibrate(&mut rng).await;
    assert!(matches!(result, Err(CalibrationError::NonPositiveDistance(d)) if d < 0.0), "{:?}", result);
}

#[tokio::test]
async fn test_stop_signal_cancels_calibration() {
    let probe = Pose6D::new(0.6, 0.2, 0.0, -PI, 0.0, 0.0);
    let (calibrator, robot, stop) = make_calibrator(0.5, probe, PerturbationBounds::zero());
    stop.request_stop();
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let result = calibrator.calibrate(&mut rng).await;
    assert!(matches!(result, Err(CalibrationError::Cancelled { collected: 0 })));
    assert_eq!(robot.counters().moves, 0);
}
