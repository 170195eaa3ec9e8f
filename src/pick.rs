//! One detect-approach-grasp-place cycle with bounded recovery, plus the
//! session bring-up (depth calibration, bin localization) around it.

use crate::calibration::{CalibrationError, CalibrationParameters, DepthCalibrator};
use crate::camera::{capture_frame, CaptureError};
use crate::config::{PickConfig, SessionConfig};
use crate::interface::{Arm, Camera, Kinematics, Limb, RangeSensor, RobotError, Segmentation, VisualizationSink};
use crate::motion::{move_to_pose, MotionError};
use crate::pose::{apply_offset, perturb, pixel_to_position, Pose6D};
use crate::servo::{CalibratedDistance, ServoError, VisualServoController, HAND_OBJECT_ID};
use crate::stop::StopSignal;
use log::{error, info, warn};
use nalgebra::Point2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{sleep, Duration};

#[derive(Debug, Clone, Error)]
pub enum PickError {
    #[error("top-down view pose unreachable after {tries} perturbed retries")]
    ViewUnreachable { tries: usize, last_error: Option<MotionError> },
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Servo(#[from] ServoError),
    #[error("grasp pose unreachable: {0}")]
    GraspPoseUnreachable(MotionError),
    #[error("missed {object_id}")]
    MissedObject { object_id: String },
    #[error("{object_id} could not be carried to the bin: {source}")]
    Misplaced {
        object_id: String,
        #[source]
        source: MotionError,
    },
    #[error(transparent)]
    Robot(#[from] RobotError),
    #[error("pick attempt stopped")]
    Cancelled,
}

#[derive(Debug, Clone, Error)]
pub enum SetupError {
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("cannot reach {what}: {source}")]
    Unreachable {
        what: &'static str,
        #[source]
        source: MotionError,
    },
    #[error(transparent)]
    Robot(#[from] RobotError),
}

/// Retry budget of one pick attempt.
#[derive(Debug, Clone)]
pub struct PickAttemptState {
    pub tries_remaining: usize,
    pub last_error: Option<MotionError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemonstrationSummary {
    pub picked: usize,
    pub attempts: usize,
}

pub struct PickAndPlace<R, S> {
    robot: Arc<R>,
    servo: VisualServoController<R, S>,
    display: Arc<dyn VisualizationSink + Send + Sync>,
    calibration: CalibrationParameters,
    config: PickConfig,
    arm: Arm,
    stop: StopSignal,
    rng: ChaCha8Rng,
    place_pose: Option<Pose6D>,
}

impl<R, S> PickAndPlace<R, S>
where
    R: Limb + Kinematics + Camera,
    S: Segmentation,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        robot: Arc<R>,
        servo: VisualServoController<R, S>,
        display: Arc<dyn VisualizationSink + Send + Sync>,
        calibration: CalibrationParameters,
        config: PickConfig,
        arm: Arm,
        stop: StopSignal,
        rng: ChaCha8Rng,
    ) -> PickAndPlace<R, S> {
        PickAndPlace {
            robot,
            servo,
            display,
            calibration,
            config,
            arm,
            stop,
            rng,
            place_pose: None,
        }
    }

    pub fn calibration(&self) -> &CalibrationParameters {
        &self.calibration
    }

    pub fn place_pose(&self) -> Option<Pose6D> {
        self.place_pose
    }

    fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.servo.config().frame_timeout_ms)
    }

    fn display_image(&self, image: &image::RgbImage) {
        if let Err(e) = self.display.publish(image) {
            warn!("Displaying image failed: {}", e);
        }
    }

    /// Stand-in for the external "object presented" signal: sleeps a uniformly
    /// drawn time up to the configured maximum, or until a stop is requested.
    pub async fn wait_for_trigger(&mut self) -> Result<(), PickError> {
        let wait = self.rng.gen_range(0.0..=self.config.max_trigger_wait_secs);
        tokio::select! {
            biased;
            _ = self.stop.stopped() => {
                info!("Stopped while waiting for a trigger");
                Err(PickError::Cancelled)
            }
            _ = sleep(Duration::from_secs_f64(wait)) => {
                info!("An object was triggered after {:.2}s", wait);
                Ok(())
            }
        }
    }

    /// Moves to the top-down viewing pose; after a failed direct move, retries
    /// up to `n_tries` times from freshly perturbed poses.
    pub async fn move_to_view(&mut self) -> Result<PickAttemptState, PickError> {
        let top_pose = self.config.top_pose;
        let mut state = PickAttemptState {
            tries_remaining: self.config.n_tries,
            last_error: None,
        };
        match move_to_pose(self.robot.as_ref(), self.arm, &top_pose).await {
            Ok(()) => return Ok(state),
            Err(e) => state.last_error = Some(e),
        }
        while state.tries_remaining > 0 {
            info!("Trying {} more time(s)", state.tries_remaining);
            state.tries_remaining -= 1;
            let pose = perturb(&top_pose, &self.config.perturbation, &mut self.rng);
            match move_to_pose(self.robot.as_ref(), self.arm, &pose).await {
                Ok(()) => {
                    info!("Perturbation worked");
                    return Ok(state);
                }
                Err(e) => state.last_error = Some(e),
            }
        }
        error!("Top-down view pose unreachable after {} retries", self.config.n_tries);
        Err(PickError::ViewUnreachable {
            tries: self.config.n_tries,
            last_error: state.last_error,
        })
    }

    /// Closes the gripper; true only if the gripper reports holding an object.
    pub async fn grasp(&self) -> Result<bool, PickError> {
        Ok(self.robot.close_gripper(self.arm).await?)
    }

    pub async fn release(&self) -> Result<(), PickError> {
        Ok(self.robot.open_gripper(self.arm).await?)
    }

    /// Servos over `object_id`, descends onto it, grasps and places it.
    /// A missed or faulted grasp is released and reported, never retried.
    pub async fn try_object(&mut self, object_id: &str) -> Result<(), PickError> {
        let top_view = capture_frame(self.robot.as_ref(), self.arm, self.frame_timeout()).await?;
        self.display_image(&top_view);

        let session = self.servo.servo(self.arm, object_id).await?;
        let endpoint = self.robot.endpoint_pose(self.arm).await?;
        let (width, height) = session.image_size;
        let center = Point2::new(f64::from(width / 2), f64::from(height / 2));
        let grasp_pose = pixel_to_position(center, session.image_size, &endpoint, &self.calibration)
            .with_orientation_of(&endpoint);
        let approach = apply_offset(&grasp_pose, &self.config.approach_offset);
        for pose in [approach, grasp_pose] {
            move_to_pose(self.robot.as_ref(), self.arm, &pose)
                .await
                .map_err(PickError::GraspPoseUnreachable)?;
        }

        match self.grasp().await {
            Ok(true) => info!("Grasped {}", object_id),
            Ok(false) => {
                info!("Missed {}", object_id);
                self.release().await?;
                return Err(PickError::MissedObject {
                    object_id: object_id.to_string(),
                });
            }
            Err(e) => {
                // the fingers may have closed before the fault was reported
                error!("Gripper failed while grasping {}: {}", object_id, e);
                if let Err(release_error) = self.release().await {
                    error!("Releasing after gripper fault failed: {}", release_error);
                }
                return Err(e);
            }
        }

        let carried = match self.place_pose {
            Some(place) => move_to_pose(self.robot.as_ref(), self.arm, &place).await,
            None => Ok(()),
        };
        self.release().await?;
        info!("Released {}", object_id);
        if let Err(e) = self.robot.move_to_neutral(self.arm).await {
            error!("Returning to neutral failed: {}", e);
        }
        if let Err(source) = carried {
            error!("{} was released outside the bin: {}", object_id, source);
            return Err(PickError::Misplaced {
                object_id: object_id.to_string(),
                source,
            });
        }
        info!("{} placed successfully", object_id);
        Ok(())
    }

    /// One full pick-and-place attempt.
    pub async fn pick_and_place(&mut self, object_id: &str) -> Result<(), PickError> {
        if self.stop.is_stopped() {
            return Err(PickError::Cancelled);
        }
        self.wait_for_trigger().await?;
        self.move_to_view().await?;
        self.try_object(object_id).await
    }

    /// Picks objects until `n_objects` succeeded, the stop signal is set or
    /// the configured attempt cap is reached. Object ids are cycled through;
    /// an empty list means "whatever is held up in the hand".
    pub async fn demonstrate(&mut self, n_objects: usize, object_ids: &[String]) -> DemonstrationSummary {
        let mut summary = DemonstrationSummary { picked: 0, attempts: 0 };
        info!("We are supposed to pick up {} object(s) ...", n_objects);
        while !self.stop.is_stopped() && summary.picked < n_objects {
            if self.config.max_attempts.is_some_and(|max| summary.attempts >= max) {
                warn!("Giving up after {} attempts", summary.attempts);
                break;
            }
            let object_id = match object_ids {
                [] => HAND_OBJECT_ID,
                ids => ids[summary.attempts % ids.len()].as_str(),
            };
            summary.attempts += 1;
            info!("Picking up object {} ({})", summary.picked, object_id);
            match self.pick_and_place(object_id).await {
                Ok(()) => summary.picked += 1,
                Err(e) => warn!("Attempt {} failed: {}", summary.attempts, e),
            }
        }
        summary
    }

    /// Looks at the table from the top pose and derives the place pose above
    /// the bin from its pixel position.
    pub async fn locate_bin(&mut self) -> Result<Pose6D, SetupError> {
        info!("Looking for bin to put objects into ...");
        let top_pose = self.config.top_pose;
        move_to_pose(self.robot.as_ref(), self.arm, &top_pose)
            .await
            .map_err(|source| SetupError::Unreachable {
                what: "top-down view pose",
                source,
            })?;
        let top_view = capture_frame(self.robot.as_ref(), self.arm, self.frame_timeout()).await?;
        let endpoint = self.robot.endpoint_pose(self.arm).await?;
        self.display_image(&top_view);

        let [col, row] = self.config.bin_pixel;
        info!("Found bin at ({}, {})", col as i64, row as i64);
        let bin = pixel_to_position(Point2::new(col, row), top_view.dimensions(), &endpoint, &self.calibration)
            .with_orientation_of(&top_pose);
        let place = apply_offset(&bin, &self.config.approach_offset);
        info!("Bin pose in base coordinates: {}", bin);
        if let Err(e) = move_to_pose(self.robot.as_ref(), self.arm, &place).await {
            warn!("Could not approach the bin: {}", e);
        }
        self.place_pose = Some(place);
        Ok(place)
    }

    pub async fn shutdown(&self) {
        info!("Exiting demonstrator ...");
        if let Err(e) = self.robot.move_to_neutral(self.arm).await {
            error!("Moving to neutral on shutdown failed: {}", e);
        }
    }
}

impl<R, S> PickAndPlace<R, S>
where
    R: Limb + Kinematics + Camera + RangeSensor,
    S: Segmentation,
{
    /// Brings a session up: neutral pose, depth calibration, servo controller
    /// on the calibrated distance, bin localization.
    pub async fn setup(
        robot: Arc<R>,
        segmentation: Arc<S>,
        display: Arc<dyn VisualizationSink + Send + Sync>,
        config: &SessionConfig,
        stop: StopSignal,
    ) -> Result<PickAndPlace<R, S>, SetupError> {
        let mut rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        robot.move_to_neutral(config.arm).await?;

        let calibrator = DepthCalibrator::new(robot.clone(), config.arm, config.calibration.clone(), stop.clone());
        let calibration = calibrator.calibrate(&mut rng).await?;

        let servo = VisualServoController::new(
            robot.clone(),
            segmentation,
            display.clone(),
            Box::new(CalibratedDistance { calibration }),
            calibration.meters_per_pixel_at_1m,
            config.servo.clone(),
            stop.clone(),
        );
        let mut session = PickAndPlace::new(
            robot,
            servo,
            display,
            calibration,
            config.pick.clone(),
            config.arm,
            stop,
            rng,
        );
        session.locate_bin().await?;
        Ok(session)
    }
}
