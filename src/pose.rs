//! Pixel, camera and robot-base coordinate conversions plus pose arithmetic.
//!
//! Depth is not measured per pixel: every conversion reuses the single
//! calibrated stand-off distance in [`CalibrationParameters`].

use crate::calibration::CalibrationParameters;
use nalgebra::{Point2, Vector6};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Cartesian pose in the robot base frame (meters, radians).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose6D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl Pose6D {
    pub const fn new(x: f64, y: f64, z: f64, roll: f64, pitch: f64, yaw: f64) -> Pose6D {
        Pose6D { x, y, z, roll, pitch, yaw }
    }

    pub fn to_vector(&self) -> Vector6<f64> {
        Vector6::new(self.x, self.y, self.z, self.roll, self.pitch, self.yaw)
    }

    pub fn from_vector(v: &Vector6<f64>) -> Pose6D {
        Pose6D::new(v[0], v[1], v[2], v[3], v[4], v[5])
    }

    /// Same position, orientation taken from `other`.
    pub fn with_orientation_of(&self, other: &Pose6D) -> Pose6D {
        Pose6D {
            roll: other.roll,
            pitch: other.pitch,
            yaw: other.yaw,
            ..*self
        }
    }
}

impl std::fmt::Display for Pose6D {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[x={:.4}, y={:.4}, z={:.4}, r={:.4}, p={:.4}, y={:.4}]",
            self.x, self.y, self.z, self.roll, self.pitch, self.yaw
        )
    }
}

/// Width of the uniform range each pose component is perturbed by.
/// Offsets are drawn from `[0, width)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerturbationBounds {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl PerturbationBounds {
    pub fn zero() -> PerturbationBounds {
        PerturbationBounds {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
        }
    }

    pub fn widths(&self) -> Vector6<f64> {
        Vector6::new(self.x, self.y, self.z, self.roll, self.pitch, self.yaw)
    }
}

impl Default for PerturbationBounds {
    fn default() -> Self {
        let two_degrees = 2.0_f64.to_radians();
        PerturbationBounds {
            x: 0.02,
            y: 0.03,
            z: 0.02,
            roll: two_degrees,
            pitch: two_degrees,
            yaw: two_degrees,
        }
    }
}

/// Converts an image pixel `(col, row)` into a base-frame position.
///
/// `endpoint` must be read at the same instant the frame was captured; no
/// staleness check happens here. Orientation of the result is zero, callers
/// supply the approach orientation themselves.
pub fn pixel_to_position(
    pixel: Point2<f64>,
    image_size: (u32, u32),
    endpoint: &Pose6D,
    calib: &CalibrationParameters,
) -> Pose6D {
    let (width, height) = image_size;
    let scale = calib.meters_per_pixel_at_1m * calib.avg_distance;
    // rows map onto base x, columns onto base y
    let x = (pixel.y - f64::from(height / 2)) * scale + endpoint.x + calib.x_offset;
    let y = (pixel.x - f64::from(width / 2)) * scale + endpoint.y + calib.y_offset;
    let z = calib.avg_distance - calib.z_offset;
    Pose6D::new(x, y, z, 0.0, 0.0, 0.0)
}

pub fn apply_offset(pose: &Pose6D, offset: &Pose6D) -> Pose6D {
    Pose6D::from_vector(&(pose.to_vector() + offset.to_vector()))
}

/// Adds one independent uniform draw per component.
pub fn perturb<R: Rng>(pose: &Pose6D, bounds: &PerturbationBounds, rng: &mut R) -> Pose6D {
    // gen::<f64>() * width keeps zero-width components exactly unperturbed
    let noise = bounds.widths().map(|width| rng.gen::<f64>() * width);
    Pose6D::from_vector(&(pose.to_vector() + noise))
}
