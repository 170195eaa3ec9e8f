//! Simulated arm, hand camera, range sensor and segmentation service.
//!
//! The arm is Cartesian: a joint configuration is just the six pose values,
//! and inverse kinematics only checks a reach envelope. The hand camera looks
//! straight down; every object on the table is rendered as a filled rotated
//! rectangle in its own color, which is what the simulated segmentation keys on.

use crate::interface::{
    Arm, Camera, Detection, DisplayError, JointConfiguration, Kinematics, KinematicsError, Limb, RangeSensor,
    RobotError, Segmentation, SegmentationError, VisualizationSink,
};
use crate::pose::Pose6D;
use image::{GrayImage, Luma, Rgb, RgbImage};
use log::debug;
use nalgebra::{Point2, Vector2};
use rand::Rng;
use std::f64::consts::PI;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

const JOINT_SUFFIXES: [&str; 6] = ["x", "y", "z", "roll", "pitch", "yaw"];
const RANGE_SENTINEL: u32 = 65_535;
const DETECTION_SCORE: f64 = 0.95;
const FAULT_PROBABILITY: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub image_size: (u32, u32),
    pub meters_per_pixel_at_1m: f64,
    /// Range-sensor distance to the table with the endpoint at z = 0.
    pub table_distance: f64,
    /// Where the optical axis hits the table relative to the gripper.
    pub camera_offset: (f64, f64),
    /// Horizontal reach of the arm from the base origin.
    pub reach: f64,
    pub z_limits: (f64, f64),
    pub neutral_pose: Pose6D,
    /// 10% of moves fail after reaching a partial position.
    pub move_errors: bool,
    /// 10% of range readings are the out-of-range sentinel.
    pub range_errors: bool,
    pub move_latency_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            image_size: (640, 400),
            meters_per_pixel_at_1m: 0.0025,
            table_distance: 0.25,
            camera_offset: (0.01, -0.02),
            reach: 1.2,
            z_limits: (-0.3, 0.8),
            neutral_pose: Pose6D::new(0.58, 0.18, 0.1, -PI, 0.0, 0.0),
            move_errors: false,
            range_errors: false,
            move_latency_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimObject {
    pub id: String,
    pub x: f64,
    pub y: f64,
    /// Footprint along the object's own x axis, meters.
    pub length: f64,
    pub width: f64,
    pub yaw_deg: f64,
    pub color: Rgb<u8>,
}

impl SimObject {
    fn covers(&self, x: f64, y: f64) -> bool {
        let (sin, cos) = self.yaw_deg.to_radians().sin_cos();
        let (dx, dy) = (x - self.x, y - self.y);
        let along = dx * cos + dy * sin;
        let across = -dx * sin + dy * cos;
        along.abs() <= self.length / 2.0 && across.abs() <= self.width / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraMode {
    Live,
    /// Subscriptions stay open but never deliver a frame.
    Stalled,
    /// Subscriptions are closed immediately.
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimCounters {
    pub solves: usize,
    pub moves: usize,
    pub failed_moves: usize,
    pub close_calls: usize,
    pub open_calls: usize,
    pub range_reads: usize,
    pub subscriptions: usize,
}

struct SimState {
    endpoint: Pose6D,
    objects: Vec<SimObject>,
    held: Option<SimObject>,
    placed: Vec<(SimObject, Pose6D)>,
    scripted_move_failures: usize,
    kinematics_failing: bool,
    grip_failing: bool,
    gripper_faulty: bool,
    camera_mode: CameraMode,
    stalled: Vec<mpsc::Sender<RgbImage>>,
    counters: SimCounters,
}

pub struct SimulatedRobot {
    config: SimConfig,
    inner: Mutex<SimState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn object_color(index: usize) -> Rgb<u8> {
    Rgb([(20 + 20 * (index % 12)) as u8, 200, 60])
}

impl SimulatedRobot {
    pub fn new(config: SimConfig) -> SimulatedRobot {
        let endpoint = config.neutral_pose;
        SimulatedRobot {
            config,
            inner: Mutex::new(SimState {
                endpoint,
                objects: Vec::new(),
                held: None,
                placed: Vec::new(),
                scripted_move_failures: 0,
                kinematics_failing: false,
                grip_failing: false,
                gripper_faulty: false,
                camera_mode: CameraMode::Live,
                stalled: Vec::new(),
                counters: SimCounters::default(),
            }),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Puts an object on the table; returns its index.
    pub fn add_object(&self, id: &str, x: f64, y: f64, length: f64, width: f64, yaw_deg: f64) -> usize {
        let mut state = lock(&self.inner);
        let index = state.objects.len() + state.placed.len() + usize::from(state.held.is_some());
        state.objects.push(SimObject {
            id: id.to_string(),
            x,
            y,
            length,
            width,
            yaw_deg,
            color: object_color(index),
        });
        index
    }

    pub fn set_endpoint(&self, pose: Pose6D) {
        lock(&self.inner).endpoint = pose;
    }

    pub fn endpoint(&self) -> Pose6D {
        lock(&self.inner).endpoint
    }

    /// The next `n` joint moves fail without moving the arm.
    pub fn script_move_failures(&self, n: usize) {
        lock(&self.inner).scripted_move_failures = n;
    }

    pub fn set_kinematics_failing(&self, failing: bool) {
        lock(&self.inner).kinematics_failing = failing;
    }

    /// Gripper closes but never reports holding anything.
    pub fn set_grip_failing(&self, failing: bool) {
        lock(&self.inner).grip_failing = failing;
    }

    /// Gripper closes its fingers, then fails to report the gripping state.
    pub fn set_gripper_faulty(&self, faulty: bool) {
        lock(&self.inner).gripper_faulty = faulty;
    }

    pub fn set_camera_mode(&self, mode: CameraMode) {
        let mut state = lock(&self.inner);
        state.camera_mode = mode;
        if mode != CameraMode::Stalled {
            state.stalled.clear();
        }
    }

    pub fn counters(&self) -> SimCounters {
        lock(&self.inner).counters.clone()
    }

    pub fn objects(&self) -> Vec<SimObject> {
        lock(&self.inner).objects.clone()
    }

    pub fn held(&self) -> Option<SimObject> {
        lock(&self.inner).held.clone()
    }

    pub fn placed(&self) -> Vec<(SimObject, Pose6D)> {
        lock(&self.inner).placed.clone()
    }

    /// Segmentation service that knows the colors of the objects on the table.
    pub fn segmentation(&self) -> SimulatedSegmentation {
        let state = lock(&self.inner);
        SimulatedSegmentation {
            classes: state
                .objects
                .iter()
                .map(|object| (object.id.clone(), object.color))
                .collect(),
        }
    }

    fn within_envelope(&self, pose: &Pose6D) -> bool {
        let values = pose.to_vector();
        values.iter().all(|v| v.is_finite())
            && pose.x.hypot(pose.y) <= self.config.reach
            && pose.z >= self.config.z_limits.0
            && pose.z <= self.config.z_limits.1
    }

    /// Renders the view of the hand camera at `endpoint`.
    fn render(&self, endpoint: &Pose6D, objects: &[SimObject]) -> RgbImage {
        let (width, height) = self.config.image_size;
        let mut image = RgbImage::new(width, height);
        let distance = self.config.table_distance + endpoint.z;
        if distance <= 0.0 {
            return image;
        }
        let meters_per_pixel = self.config.meters_per_pixel_at_1m * distance;
        let center = Point2::new(f64::from(width / 2), f64::from(height / 2));
        let camera = Vector2::new(
            endpoint.x + self.config.camera_offset.0,
            endpoint.y + self.config.camera_offset.1,
        );
        for object in objects {
            // objects left of the optical axis show up right of the image center
            let pixel_center = center + (camera - Vector2::new(object.x, object.y)) / meters_per_pixel;
            let angle = object.yaw_deg - endpoint.yaw.to_degrees();
            let projected = SimObject {
                x: pixel_center.x,
                y: pixel_center.y,
                length: object.length / meters_per_pixel,
                width: object.width / meters_per_pixel,
                yaw_deg: angle,
                ..object.clone()
            };
            let radius = projected.length.hypot(projected.width) / 2.0;
            let x_range = (pixel_center.x - radius).floor().max(0.0)..=(pixel_center.x + radius).ceil();
            let y_range = (pixel_center.y - radius).floor().max(0.0)..=(pixel_center.y + radius).ceil();
            let mut y = *y_range.start();
            while y <= *y_range.end() && y < f64::from(height) {
                let mut x = *x_range.start();
                while x <= *x_range.end() && x < f64::from(width) {
                    if projected.covers(x, y) {
                        image.put_pixel(x as u32, y as u32, object.color);
                    }
                    x += 1.0;
                }
                y += 1.0;
            }
        }
        image
    }
}

impl Limb for SimulatedRobot {
    async fn endpoint_pose(&self, _arm: Arm) -> Result<Pose6D, RobotError> {
        Ok(self.endpoint())
    }

    async fn move_to(&self, arm: Arm, config: &JointConfiguration) -> Result<(), RobotError> {
        if config.positions.len() != JOINT_SUFFIXES.len() {
            return Err(RobotError::MoveError {
                msg: format!("expected {} joints, got {}", JOINT_SUFFIXES.len(), config.positions.len()),
            });
        }
        let p = &config.positions;
        let target = Pose6D::new(p[0], p[1], p[2], p[3], p[4], p[5]);
        sleep(Duration::from_millis(self.config.move_latency_ms)).await;

        let mut state = lock(&self.inner);
        state.counters.moves += 1;
        if state.scripted_move_failures > 0 {
            state.scripted_move_failures -= 1;
            state.counters.failed_moves += 1;
            return Err(RobotError::MoveError {
                msg: format!("{} arm refused to move", arm),
            });
        }
        let mut rng = rand::thread_rng();
        if self.config.move_errors && rng.gen_bool(FAULT_PROBABILITY) {
            // stop somewhere along the way
            let partial_factor: f64 = rng.gen();
            let start = state.endpoint.to_vector();
            state.endpoint = Pose6D::from_vector(&(start + (target.to_vector() - start) * partial_factor));
            state.counters.failed_moves += 1;
            return Err(RobotError::ConnectionError {
                msg: "random error occurred during move (partial position)".to_string(),
            });
        }
        state.endpoint = target;
        debug!("Simulated {} arm at {}", arm, target);
        Ok(())
    }

    async fn move_to_neutral(&self, _arm: Arm) -> Result<(), RobotError> {
        let mut state = lock(&self.inner);
        state.counters.moves += 1;
        state.endpoint = self.config.neutral_pose;
        Ok(())
    }

    async fn close_gripper(&self, arm: Arm) -> Result<bool, RobotError> {
        let mut state = lock(&self.inner);
        state.counters.close_calls += 1;
        if state.gripper_faulty {
            return Err(RobotError::GripperError {
                msg: format!("{} gripper state unreadable after closing", arm),
            });
        }
        if state.grip_failing || state.held.is_some() {
            return Ok(state.held.is_some());
        }
        let endpoint = state.endpoint;
        let Some(index) = state.objects.iter().position(|o| o.covers(endpoint.x, endpoint.y)) else {
            return Ok(false);
        };
        let object = state.objects.remove(index);
        state.held = Some(object);
        Ok(true)
    }

    async fn open_gripper(&self, _arm: Arm) -> Result<(), RobotError> {
        let mut state = lock(&self.inner);
        state.counters.open_calls += 1;
        if let Some(object) = state.held.take() {
            let endpoint = state.endpoint;
            state.placed.push((object, endpoint));
        }
        Ok(())
    }
}

impl RangeSensor for SimulatedRobot {
    async fn read_range(&self, _arm: Arm) -> Result<u32, RobotError> {
        let mut state = lock(&self.inner);
        state.counters.range_reads += 1;
        if self.config.range_errors && rand::thread_rng().gen_bool(FAULT_PROBABILITY) {
            return Ok(RANGE_SENTINEL);
        }
        let millimeters = ((self.config.table_distance + state.endpoint.z) * 1000.0).round();
        if !(0.0..f64::from(RANGE_SENTINEL)).contains(&millimeters) {
            return Ok(RANGE_SENTINEL);
        }
        Ok(millimeters as u32)
    }
}

impl Kinematics for SimulatedRobot {
    async fn solve(&self, arm: Arm, pose: &Pose6D, reference_frame: &str) -> Result<JointConfiguration, KinematicsError> {
        let failing = {
            let mut state = lock(&self.inner);
            state.counters.solves += 1;
            state.kinematics_failing
        };
        if reference_frame != crate::motion::BASE_FRAME {
            return Err(KinematicsError::ServiceError {
                msg: format!("unknown reference frame '{}'", reference_frame),
            });
        }
        if failing || !self.within_envelope(pose) {
            return Err(KinematicsError::Unreachable { pose: *pose });
        }
        Ok(JointConfiguration {
            names: JOINT_SUFFIXES.iter().map(|s| format!("{}_{}", arm, s)).collect(),
            positions: pose.to_vector().iter().copied().collect(),
        })
    }
}

impl Camera for SimulatedRobot {
    fn subscribe(&self, _arm: Arm) -> mpsc::Receiver<RgbImage> {
        let (tx, rx) = mpsc::channel(1);
        let mut state = lock(&self.inner);
        state.counters.subscriptions += 1;
        match state.camera_mode {
            CameraMode::Live => {
                let frame = self.render(&state.endpoint, &state.objects);
                // a fresh channel always has room for one frame
                let _ = tx.try_send(frame);
            }
            CameraMode::Stalled => state.stalled.push(tx),
            CameraMode::Closed => {}
        }
        rx
    }
}

/// Color-keyed segmentation of frames rendered by [`SimulatedRobot`].
pub struct SimulatedSegmentation {
    classes: Vec<(String, Rgb<u8>)>,
}

impl SimulatedSegmentation {
    fn segment(&self, image: &RgbImage, object_id: &str, color: Rgb<u8>, threshold: f64) -> (Detection, usize) {
        let mut mask = GrayImage::new(image.width(), image.height());
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0, 0);
        let mut area = 0;
        for (x, y, pixel) in image.enumerate_pixels() {
            if *pixel == color {
                mask.put_pixel(x, y, Luma([255]));
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
                area += 1;
            }
        }
        let score = if area > 0 { DETECTION_SCORE } else { 0.0 };
        if score <= threshold {
            return (Detection::miss(object_id, score), area);
        }
        let detection = Detection {
            object_id: object_id.to_string(),
            score,
            bbox: Some([f64::from(min_x), f64::from(min_y), f64::from(max_x), f64::from(max_y)]),
            mask: Some(mask),
        };
        (detection, area)
    }
}

impl Segmentation for SimulatedSegmentation {
    async fn detect_object(&self, image: &RgbImage, object_id: &str, threshold: f64) -> Result<Detection, SegmentationError> {
        let Some((_, color)) = self.classes.iter().find(|(id, _)| id == object_id) else {
            return Err(SegmentationError::UnknownObject(object_id.to_string()));
        };
        Ok(self.segment(image, object_id, *color, threshold).0)
    }

    async fn detect_best(&self, image: &RgbImage, threshold: f64) -> Result<Detection, SegmentationError> {
        let best = self
            .classes
            .iter()
            .map(|(id, color)| self.segment(image, id, *color, threshold))
            .max_by_key(|(_, area)| *area);
        match best {
            Some((detection, _)) => Ok(detection),
            None => Ok(Detection::miss("__background__", 0.0)),
        }
    }
}

/// Display that counts what it is sent, optionally failing every publish.
#[derive(Default)]
pub struct RecordingDisplay {
    published: Mutex<usize>,
    pub failing: bool,
}

impl RecordingDisplay {
    pub fn failing() -> RecordingDisplay {
        RecordingDisplay {
            published: Mutex::new(0),
            failing: true,
        }
    }

    pub fn published(&self) -> usize {
        *lock(&self.published)
    }
}

impl VisualizationSink for RecordingDisplay {
    fn publish(&self, _image: &RgbImage) -> Result<(), DisplayError> {
        if self.failing {
            return Err(DisplayError {
                msg: "display is unplugged".to_string(),
            });
        }
        *lock(&self.published) += 1;
        Ok(())
    }
}
