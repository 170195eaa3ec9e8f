use approx::assert_relative_eq;
use nalgebra::Point2;
use pick_servo::calibration::CalibrationParameters;
use pick_servo::camera::capture_frame;
use pick_servo::config::{CalibrationConfig, PickConfig, ServoConfig, SessionConfig};
use pick_servo::interface::{Arm, RobotError, Segmentation};
use pick_servo::pick::{DemonstrationSummary, PickAndPlace, PickError};
use pick_servo::pose::pixel_to_position;
use pick_servo::servo::{CalibratedDistance, ServoError, VisualServoController};
use pick_servo::sim::{RecordingDisplay, SimConfig, SimulatedRobot, SimulatedSegmentation};
use pick_servo::stop::StopSignal;
use pick_servo::vision::mask_to_rotated_rect;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

type Session = PickAndPlace<SimulatedRobot, SimulatedSegmentation>;

//Builds a pick-and-place session over a simulated table with a bottle and the extra objects on it
fn make_scene(config: PickConfig, extra: &[(&str, f64, f64)]) -> (Session, Arc<SimulatedRobot>, StopSignal) {
    let robot = Arc::new(SimulatedRobot::new(SimConfig::default()));
    robot.add_object("bottle", 0.54, -0.03, 0.05, 0.03, 0.0);
    for (id, x, y) in extra {
        robot.add_object(id, *x, *y, 0.04, 0.04, 0.0);
    }
    let calibration = calibration();
    let display = Arc::new(RecordingDisplay::default());
    let stop = StopSignal::new();
    let servo = VisualServoController::new(
        robot.clone(),
        Arc::new(robot.segmentation()),
        display.clone(),
        Box::new(CalibratedDistance { calibration }),
        calibration.meters_per_pixel_at_1m,
        ServoConfig::default(),
        stop.clone(),
    );
    let session = PickAndPlace::new(
        robot.clone(),
        servo,
        display,
        calibration,
        config,
        Arm::Left,
        stop.clone(),
        ChaCha8Rng::seed_from_u64(11),
    );
    (session, robot, stop)
}

fn calibration() -> CalibrationParameters {
    CalibrationParameters::from_average_distance(0.25, &CalibrationConfig::default()).unwrap()
}

fn make_session(config: PickConfig) -> (Session, Arc<SimulatedRobot>, StopSignal) {
    make_scene(config, &[])
}

fn no_wait() -> PickConfig {
    PickConfig {
        max_trigger_wait_secs: 0.0,
        ..PickConfig::default()
    }
}

#[tokio::test]
async fn test_view_reached_on_last_retry() {
    let (mut session, robot, _) = make_session(no_wait());
    robot.script_move_failures(2);
    let state = session.move_to_view().await.unwrap();
    assert_eq!(state.tries_remaining, 0);
    assert!(state.last_error.is_some());
    let counters = robot.counters();
    assert_eq!(counters.moves, 3);
    assert_eq!(counters.failed_moves, 2);
}

#[tokio::test]
async fn test_direct_view_move_keeps_retries() {
    let (mut session, robot, _) = make_session(no_wait());
    let state = session.move_to_view().await.unwrap();
    assert_eq!(state.tries_remaining, 2);
    assert!(state.last_error.is_none());
    assert_eq!(robot.endpoint(), PickConfig::default().top_pose);
}

#[tokio::test]
async fn test_pick_proceeds_after_view_retries() {
    let (mut session, robot, _) = make_session(no_wait());
    robot.script_move_failures(2);
    session.pick_and_place("bottle").await.unwrap();
    assert_eq!(robot.counters().close_calls, 1);
    assert!(robot.objects().is_empty());
    assert!(robot.held().is_none());
    let placed = robot.placed();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].0.id, "bottle");
}

#[tokio::test]
async fn test_view_unreachable_never_grasps() {
    let (mut session, robot, _) = make_session(no_wait());
    robot.script_move_failures(3);
    match session.pick_and_place("bottle").await {
        Err(PickError::ViewUnreachable { tries, last_error }) => {
            assert_eq!(tries, 2);
            assert!(last_error.is_some());
        }
        other => panic!("expected unreachable view, got {:?}", other),
    }
    let counters = robot.counters();
    assert_eq!(counters.failed_moves, 3);
    assert_eq!(counters.close_calls, 0);
}

#[tokio::test]
async fn test_missed_grasp_releases_once() {
    let (mut session, robot, _) = make_session(no_wait());
    robot.set_grip_failing(true);
    match session.pick_and_place("bottle").await {
        Err(PickError::MissedObject { object_id }) => assert_eq!(object_id, "bottle"),
        other => panic!("expected a missed grasp, got {:?}", other),
    }
    let counters = robot.counters();
    assert_eq!(counters.close_calls, 1);
    assert_eq!(counters.open_calls, 1);
    assert_eq!(robot.objects().len(), 1);
}

#[tokio::test]
async fn test_invisible_object_fails_in_servo() {
    let (mut session, robot, _) = make_scene(no_wait(), &[("far", 0.9, 0.5)]);
    let result = session.pick_and_place("far").await;
    assert!(matches!(result, Err(PickError::Servo(ServoError::SegmentationMiss { .. }))));
    assert_eq!(robot.counters().close_calls, 0);
}

#[tokio::test]
async fn test_stopped_session_does_nothing() {
    let (mut session, robot, stop) = make_session(no_wait());
    stop.request_stop();
    assert!(matches!(session.pick_and_place("bottle").await, Err(PickError::Cancelled)));
    assert_eq!(session.demonstrate(3, &[]).await, DemonstrationSummary { picked: 0, attempts: 0 });
    assert_eq!(robot.counters().moves, 0);
}

#[tokio::test]
async fn test_demonstration_respects_attempt_cap() {
    let config = PickConfig {
        max_attempts: Some(2),
        ..no_wait()
    };
    let (mut session, robot, _) = make_session(config);
    robot.set_grip_failing(true);
    let summary = session.demonstrate(1, &["bottle".to_string()]).await;
    assert_eq!(summary, DemonstrationSummary { picked: 0, attempts: 2 });
    assert_eq!(robot.counters().close_calls, 2);
}

#[tokio::test]
async fn test_full_session_places_objects_in_bin() {
    let robot = Arc::new(SimulatedRobot::new(SimConfig::default()));
    robot.add_object("bottle", 0.54, -0.03, 0.05, 0.03, 0.0);
    robot.add_object("cup", 0.47, 0.04, 0.04, 0.04, 0.0);
    let mut config = SessionConfig {
        seed: Some(7),
        ..SessionConfig::default()
    };
    config.pick.max_trigger_wait_secs = 0.0;
    let display = Arc::new(RecordingDisplay::default());

    let mut session = PickAndPlace::setup(
        robot.clone(),
        Arc::new(robot.segmentation()),
        display.clone(),
        &config,
        StopSignal::new(),
    )
    .await
    .unwrap();
    let calibrated = session.calibration().avg_distance;
    assert!((calibrated - 0.25).abs() < 1e-3, "calibrated {}", calibrated);
    let place = session.place_pose().unwrap();

    let ids = vec!["bottle".to_string(), "cup".to_string()];
    let summary = session.demonstrate(2, &ids).await;
    session.shutdown().await;

    assert_eq!(summary, DemonstrationSummary { picked: 2, attempts: 2 });
    let placed = robot.placed();
    assert_eq!(placed.len(), 2);
    for (object, pose) in &placed {
        assert!(ids.contains(&object.id));
        assert_eq!(*pose, place);
    }
    assert_eq!(robot.endpoint(), robot.config().neutral_pose);
    assert!(display.published() > 0);
}

#[tokio::test]
async fn test_gripper_fault_still_releases() {
    let (mut session, robot, _) = make_session(no_wait());
    robot.set_gripper_faulty(true);
    match session.pick_and_place("bottle").await {
        Err(PickError::Robot(RobotError::GripperError { .. })) => {}
        other => panic!("expected a gripper fault, got {:?}", other),
    }
    let counters = robot.counters();
    assert_eq!(counters.close_calls, 1);
    assert_eq!(counters.open_calls, 1, "gripper left closed after a fault");
}

#[tokio::test]
async fn test_stop_interrupts_trigger_wait() {
    let config = PickConfig {
        max_trigger_wait_secs: 3600.0,
        ..PickConfig::default()
    };
    let (mut session, robot, stop) = make_session(config);
    let remote = stop.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        remote.request_stop();
    });
    let start = Instant::now();
    let result = session.pick_and_place("bottle").await;
    assert!(matches!(result, Err(PickError::Cancelled)), "{:?}", result);
    assert!(start.elapsed() < Duration::from_secs(2), "trigger wait ignored the stop: {:?}", start.elapsed());
    assert_eq!(robot.counters().moves, 0);
}

#[tokio::test]
async fn test_failed_carry_is_reported_as_misplaced() {
    // a bin pixel far outside the image puts the place pose out of reach
    let config = PickConfig {
        bin_pixel: [10_000.0, 10_000.0],
        ..no_wait()
    };
    let (mut session, robot, _) = make_session(config);
    session.locate_bin().await.unwrap();
    match session.pick_and_place("bottle").await {
        Err(PickError::Misplaced { object_id, .. }) => assert_eq!(object_id, "bottle"),
        other => panic!("expected a misplaced object, got {:?}", other),
    }
    let counters = robot.counters();
    assert_eq!(counters.close_calls, 1);
    assert_eq!(counters.open_calls, 1);
    assert!(robot.held().is_none());
    assert_eq!(robot.placed().len(), 1);
}

#[tokio::test]
async fn test_image_center_maps_onto_camera_axis() {
    let robot = SimulatedRobot::new(SimConfig::default());
    let top_pose = PickConfig::default().top_pose;
    robot.set_endpoint(top_pose);
    let (dx, dy) = robot.config().camera_offset;
    let (x, y) = (top_pose.x + dx, top_pose.y + dy);
    robot.add_object("bottle", x, y, 0.05, 0.03, 0.0);

    let frame = capture_frame(&robot, Arm::Left, Duration::from_millis(100)).await.unwrap();
    let detection = robot.segmentation().detect_object(&frame, "bottle", 0.8).await.unwrap();
    let rect = mask_to_rotated_rect(detection.mask.as_ref().unwrap()).unwrap();
    let (width, height) = frame.dimensions();
    assert!((rect.center.x - f64::from(width / 2)).abs() <= 0.5, "{:?}", rect);
    assert!((rect.center.y - f64::from(height / 2)).abs() <= 0.5, "{:?}", rect);

    let center = Point2::new(f64::from(width / 2), f64::from(height / 2));
    let grasp = pixel_to_position(center, frame.dimensions(), &robot.endpoint(), &calibration());
    assert_relative_eq!(grasp.x, x, epsilon = 1e-9);
    assert_relative_eq!(grasp.y, y, epsilon = 1e-9);
}
