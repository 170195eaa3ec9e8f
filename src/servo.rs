//! Closed-loop visual servoing of the end effector over a segmented object.
//!
//! The end effector is assumed to point straight down: only the lateral
//! position (x, y) and the yaw are corrected, the height is left alone.
//!
//! One call to [`VisualServoController::servo`] runs the loop
//! measure -> correct -> re-detect until the pixel error between the object's
//! rotated enclosing rectangle and the image center, converted to meters,
//! drops below the tolerance. Correction steps that cannot be executed
//! (unreachable pose, failed move, lost detection) are skipped and the last
//! measurement is kept; the iteration cap bounds how long that can go on.

use crate::calibration::CalibrationParameters;
use crate::camera::{capture_frame, CaptureError};
use crate::config::ServoConfig;
use crate::interface::{Arm, Camera, Kinematics, Limb, Segmentation, SegmentationError, VisualizationSink};
use crate::motion::BASE_FRAME;
use crate::pose::{apply_offset, Pose6D};
use crate::stop::StopSignal;
use crate::vision::{draw_rotated_rect, mask_to_rotated_rect, RotatedRect};
use image::{Rgb, RgbImage};
use log::{debug, error, info, warn};
use nalgebra::{Point2, Vector2};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;

/// Object identifier that selects the best detection over all classes,
/// i.e. whatever the operator is holding up in their hand.
pub const HAND_OBJECT_ID: &str = "hand";

const RECT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

#[derive(Debug, Clone, Error)]
pub enum EstimateError {
    #[error("no distance estimate for '{object_id}': {msg}")]
    Unavailable { object_id: String, msg: String },
    #[error("distance estimate {value} for '{object_id}' is not a non-negative number")]
    Invalid { object_id: String, value: f64 },
}

/// Strategy estimating the distance from the gripper to an object.
///
/// Implementations return meters, never a negative value, and fail with an
/// [`EstimateError`] instead of guessing.
pub trait DistanceEstimator {
    fn estimate_distance(&self, object_id: &str, rect: &RotatedRect, arm: Arm) -> Result<f64, EstimateError>;
}

/// Always answers the same distance.
pub struct FixedDistance(pub f64);

impl DistanceEstimator for FixedDistance {
    fn estimate_distance(&self, _object_id: &str, _rect: &RotatedRect, _arm: Arm) -> Result<f64, EstimateError> {
        Ok(self.0)
    }
}

/// Reuses the calibrated table distance for every object.
pub struct CalibratedDistance {
    pub calibration: CalibrationParameters,
}

impl DistanceEstimator for CalibratedDistance {
    fn estimate_distance(&self, _object_id: &str, _rect: &RotatedRect, _arm: Arm) -> Result<f64, EstimateError> {
        Ok(self.calibration.avg_distance)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ServoError {
    #[error("segmentation of {object_id} failed (score {score:.3})")]
    SegmentationMiss { object_id: String, score: f64 },
    #[error(transparent)]
    Segmentation(#[from] SegmentationError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    DistanceEstimate(#[from] EstimateError),
    #[error("no convergence after {iterations} iterations (error {error:.4} m)")]
    IterationLimit {
        iterations: usize,
        error: f64,
        rect: RotatedRect,
    },
    #[error("servoing stopped after {iterations} iterations")]
    Cancelled { iterations: usize },
}

/// State of one `servo()` call; returned to the caller once converged.
#[derive(Debug, Clone)]
pub struct ServoSession {
    pub arm: Arm,
    pub object_id: String,
    pub rect: RotatedRect,
    /// Position error in meters.
    pub error: f64,
    pub iterations: usize,
    /// Size (width, height) of the frames being servoed on.
    pub image_size: (u32, u32),
}

pub struct VisualServoController<R, S> {
    robot: Arc<R>,
    segmentation: Arc<S>,
    display: Arc<dyn VisualizationSink + Send + Sync>,
    estimator: Box<dyn DistanceEstimator + Send + Sync>,
    meters_per_pixel_at_1m: f64,
    config: ServoConfig,
    stop: StopSignal,
}

impl<R, S> VisualServoController<R, S>
where
    R: Limb + Kinematics + Camera,
    S: Segmentation,
{
    pub fn new(
        robot: Arc<R>,
        segmentation: Arc<S>,
        display: Arc<dyn VisualizationSink + Send + Sync>,
        estimator: Box<dyn DistanceEstimator + Send + Sync>,
        meters_per_pixel_at_1m: f64,
        config: ServoConfig,
        stop: StopSignal,
    ) -> VisualServoController<R, S> {
        VisualServoController {
            robot,
            segmentation,
            display,
            estimator,
            meters_per_pixel_at_1m,
            config,
            stop,
        }
    }

    pub fn config(&self) -> &ServoConfig {
        &self.config
    }

    fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.config.frame_timeout_ms)
    }

    /// Segments `object_id` in `image` and returns its rotated enclosing
    /// rectangle. The rectangle is drawn into `image`, which is then published.
    pub async fn find_rotated_enclosing_rect(
        &self,
        image: &mut RgbImage,
        object_id: &str,
    ) -> Result<RotatedRect, ServoError> {
        let threshold = self.config.detection_threshold;
        let (detection, hand) = if object_id == HAND_OBJECT_ID {
            (self.segmentation.detect_best(image, threshold).await?, " in hand")
        } else {
            (self.segmentation.detect_object(image, object_id, threshold).await?, "")
        };
        let rect = match (&detection.bbox, &detection.mask) {
            (Some(_), Some(mask)) => mask_to_rotated_rect(mask),
            _ => None,
        };
        let Some(rect) = rect else {
            info!("Segmentation of {}{} failed (score {:.3})", detection.object_id, hand, detection.score);
            return Err(ServoError::SegmentationMiss {
                object_id: detection.object_id,
                score: detection.score,
            });
        };
        info!("Segmented {}{}", detection.object_id, hand);
        draw_rotated_rect(image, &rect, RECT_COLOR);
        if let Err(e) = self.display.publish(image) {
            warn!("Publishing visualization failed: {}", e);
        }
        Ok(rect)
    }

    /// Meters per pixel at the estimated distance of the object.
    pub fn pixel_to_camera_factor(&self, object_id: &str, rect: &RotatedRect, arm: Arm) -> Result<f64, ServoError> {
        let distance = self.estimator.estimate_distance(object_id, rect, arm)?;
        if !distance.is_finite() || distance < 0.0 {
            return Err(EstimateError::Invalid {
                object_id: object_id.to_string(),
                value: distance,
            }
            .into());
        }
        Ok(self.meters_per_pixel_at_1m * distance)
    }

    /// Pixel offset of the rectangle center from the image center, in meters.
    pub fn position_error(
        &self,
        image_size: (u32, u32),
        object_id: &str,
        rect: &RotatedRect,
        arm: Arm,
    ) -> Result<f64, ServoError> {
        let pixel_delta = image_center(image_size) - rect.center;
        Ok(pixel_delta.norm() * self.pixel_to_camera_factor(object_id, rect, arm)?)
    }

    /// One proportional correction step. Steps that cannot be carried out
    /// leave the session untouched; only distance estimation failures abort.
    async fn correct(&self, session: &mut ServoSession) -> Result<(), ServoError> {
        let factor = self.pixel_to_camera_factor(&session.object_id, &session.rect, session.arm)?;
        let delta: Vector2<f64> = (image_center(session.image_size) - session.rect.center) * factor * self.config.kp;
        let endpoint = match self.robot.endpoint_pose(session.arm).await {
            Ok(pose) => pose,
            Err(e) => {
                error!("Reading endpoint pose failed: {}", e);
                return Ok(());
            }
        };
        let step = Pose6D::new(delta.x, delta.y, 0.0, 0.0, 0.0, session.rect.angle.to_radians());
        let target = apply_offset(&endpoint, &step);

        let config = match self.robot.solve(session.arm, &target, BASE_FRAME).await {
            Ok(config) => config,
            Err(e) => {
                error!("Skipping correction: {}", e);
                return Ok(());
            }
        };
        if let Err(e) = self.robot.move_to(session.arm, &config).await {
            error!("Skipping correction: {}", e);
            return Ok(());
        }

        let mut frame = match capture_frame(self.robot.as_ref(), session.arm, self.frame_timeout()).await {
            Ok(frame) => frame,
            Err(e) => {
                error!("Keeping last measurement: {}", e);
                return Ok(());
            }
        };
        let rect = match self.find_rotated_enclosing_rect(&mut frame, &session.object_id).await {
            Ok(rect) => rect,
            Err(ServoError::SegmentationMiss { .. }) | Err(ServoError::Segmentation(_)) => {
                warn!("Lost {} after correction; keeping last measurement", session.object_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let image_size = frame.dimensions();
        session.error = self.position_error(image_size, &session.object_id, &rect, session.arm)?;
        session.rect = rect;
        session.image_size = image_size;
        Ok(())
    }

    /// Positions the end effector of `arm` over `object_id`.
    ///
    /// Fails without moving if the object is not segmented in the first frame.
    pub async fn servo(&self, arm: Arm, object_id: &str) -> Result<ServoSession, ServoError> {
        let mut frame = capture_frame(self.robot.as_ref(), arm, self.frame_timeout()).await?;
        let rect = self.find_rotated_enclosing_rect(&mut frame, object_id).await?;
        let image_size = frame.dimensions();
        let error = self.position_error(image_size, object_id, &rect, arm)?;
        let mut session = ServoSession {
            arm,
            object_id: object_id.to_string(),
            rect,
            error,
            iterations: 0,
            image_size,
        };

        loop {
            if self.stop.is_stopped() {
                return Err(ServoError::Cancelled {
                    iterations: session.iterations,
                });
            }
            if session.error <= self.config.tolerance {
                info!(
                    "Servoed {} arm over {} after {} iterations (error {:.4} m)",
                    arm, object_id, session.iterations, session.error
                );
                return Ok(session);
            }
            if session.iterations >= self.config.max_iterations {
                error!(
                    "Servoing on {} did not converge in {} iterations (error {:.4} m)",
                    object_id, session.iterations, session.error
                );
                return Err(ServoError::IterationLimit {
                    iterations: session.iterations,
                    error: session.error,
                    rect: session.rect,
                });
            }
            session.iterations += 1;
            self.correct(&mut session).await?;
            debug!("Iteration {} finished (error {:.4} m)", session.iterations, session.error);
        }
    }
}

fn image_center(image_size: (u32, u32)) -> Point2<f64> {
    let (width, height) = image_size;
    Point2::new(f64::from(width / 2), f64::from(height / 2))
}
