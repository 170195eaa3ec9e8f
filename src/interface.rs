use crate::pose::Pose6D;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Which of the two limbs a call addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arm {
    Left,
    Right,
}

impl std::fmt::Display for Arm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arm::Left => write!(f, "left"),
            Arm::Right => write!(f, "right"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RobotError {
    // Failed to execute a joint move
    #[error("move failed: {msg}")]
    MoveError { msg: String },
    // Lost connection to the robot services
    #[error("connection lost: {msg}")]
    ConnectionError { msg: String },
    // Gripper did not respond
    #[error("gripper fault: {msg}")]
    GripperError { msg: String },
}

#[derive(Debug, Clone, Error)]
pub enum KinematicsError {
    // No joint configuration exists for the requested pose
    #[error("no valid joint configuration for {pose}")]
    Unreachable { pose: Pose6D },
    // The solver service itself could not be reached
    #[error("kinematics service failed: {msg}")]
    ServiceError { msg: String },
}

#[derive(Debug, Clone, Error)]
pub enum SegmentationError {
    #[error("object '{0}' is not part of the known object set")]
    UnknownObject(String),
    #[error("segmentation model failed: {msg}")]
    ModelError { msg: String },
}

#[derive(Debug, Clone, Error)]
#[error("display publish failed: {msg}")]
pub struct DisplayError {
    pub msg: String,
}

/// Joint angles returned by the inverse kinematics service, ready for `Limb::move_to`.
#[derive(Debug, Clone, PartialEq)]
pub struct JointConfiguration {
    pub names: Vec<String>,
    pub positions: Vec<f64>,
}

/// One answer of the segmentation service.
///
/// `bbox` and `mask` are both present exactly when `score` exceeded the
/// threshold the caller asked for.
#[derive(Debug, Clone)]
pub struct Detection {
    pub object_id: String,
    pub score: f64,
    /// (x_ul, y_ul, x_lr, y_lr) in pixels
    pub bbox: Option<[f64; 4]>,
    pub mask: Option<GrayImage>,
}

impl Detection {
    pub fn miss(object_id: &str, score: f64) -> Detection {
        Detection {
            object_id: object_id.to_string(),
            score,
            bbox: None,
            mask: None,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.bbox.is_some() && self.mask.is_some()
    }
}

/// Limb provides the motion and gripper primitives of one robot.
/// All calls are round-trips to hardware services, so they are async and
/// strictly sequential per arm.
pub trait Limb {
    async fn endpoint_pose(&self, arm: Arm) -> Result<Pose6D, RobotError>;
    async fn move_to(&self, arm: Arm, config: &JointConfiguration) -> Result<(), RobotError>;
    async fn move_to_neutral(&self, arm: Arm) -> Result<(), RobotError>;
    /// Closes the gripper and reports whether it is holding something.
    async fn close_gripper(&self, arm: Arm) -> Result<bool, RobotError>;
    async fn open_gripper(&self, arm: Arm) -> Result<(), RobotError>;
}

/// RangeSensor is the hand-mounted distance sensor.
/// Readings are millimeters relative to the sensor mount, or an out-of-range
/// sentinel above the validity ceiling.
pub trait RangeSensor {
    async fn read_range(&self, arm: Arm) -> Result<u32, RobotError>;
}

pub trait Kinematics {
    async fn solve(
        &self,
        arm: Arm,
        pose: &Pose6D,
        reference_frame: &str,
    ) -> Result<JointConfiguration, KinematicsError>;
}

/// Camera delivers frames asynchronously per arm.
/// Subscribing opens a fresh per-arm stream; dropping the receiver unsubscribes.
pub trait Camera {
    fn subscribe(&self, arm: Arm) -> mpsc::Receiver<RgbImage>;
}

pub trait Segmentation {
    async fn detect_object(
        &self,
        image: &RgbImage,
        object_id: &str,
        threshold: f64,
    ) -> Result<Detection, SegmentationError>;

    /// Best-scoring detection over every non-background class.
    async fn detect_best(&self, image: &RgbImage, threshold: f64) -> Result<Detection, SegmentationError>;
}

/// One-way sink for annotated images (the robot's face display).
pub trait VisualizationSink {
    fn publish(&self, image: &RgbImage) -> Result<(), DisplayError>;
}

/// Sink that drops every image; useful when no display is attached.
pub struct NullDisplay;

impl VisualizationSink for NullDisplay {
    fn publish(&self, _image: &RgbImage) -> Result<(), DisplayError> {
        Ok(())
    }
}
