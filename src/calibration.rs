use crate::config::CalibrationConfig;
use crate::interface::{Arm, Kinematics, Limb, RangeSensor};
use crate::motion::move_to_pose;
use crate::pose::perturb;
use crate::stop::StopSignal;
use log::{error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Pixel-to-world mapping parameters; immutable once calibrated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParameters {
    /// Mean stand-off distance from the hand camera to the table, meters.
    pub avg_distance: f64,
    pub meters_per_pixel_at_1m: f64,
    pub x_offset: f64,
    pub y_offset: f64,
    pub z_offset: f64,
}

impl CalibrationParameters {
    /// Combines a measured distance with the fixed empirical offsets.
    pub fn from_average_distance(
        avg_distance: f64,
        config: &CalibrationConfig,
    ) -> Result<CalibrationParameters, CalibrationError> {
        if !(avg_distance > 0.0) {
            return Err(CalibrationError::NonPositiveDistance(avg_distance));
        }
        Ok(CalibrationParameters {
            avg_distance,
            meters_per_pixel_at_1m: config.meters_per_pixel_at_1m,
            x_offset: config.x_offset,
            y_offset: config.y_offset,
            z_offset: config.z_offset,
        })
    }
}

#[derive(Debug, Clone, Error)]
pub enum CalibrationError {
    #[error("collected only {collected}/{required} valid range samples in {attempts} attempts")]
    AttemptsExhausted {
        collected: usize,
        required: usize,
        attempts: usize,
    },
    #[error("average distance {0} m is not positive")]
    NonPositiveDistance(f64),
    #[error("calibration stopped after {collected} samples")]
    Cancelled { collected: usize },
}

/// Estimates the camera stand-off distance by averaging range-sensor samples
/// taken at randomly perturbed poses around the probing pose.
pub struct DepthCalibrator<R> {
    robot: Arc<R>,
    arm: Arm,
    config: CalibrationConfig,
    stop: StopSignal,
}

impl<R> DepthCalibrator<R>
where
    R: Limb + Kinematics + RangeSensor,
{
    pub fn new(robot: Arc<R>, arm: Arm, config: CalibrationConfig, stop: StopSignal) -> DepthCalibrator<R> {
        DepthCalibrator { robot, arm, config, stop }
    }

    /// Moves the arm at least `samples` times; every failed move or invalid
    /// reading costs one attempt out of `max_attempts`.
    pub async fn calibrate<G: Rng>(&self, rng: &mut G) -> Result<CalibrationParameters, CalibrationError> {
        let required = self.config.samples;
        let mut samples: Vec<f64> = Vec::with_capacity(required);
        let mut attempts = 0;
        info!("Performing depth calibration on {} arm ...", self.arm);
        while samples.len() < required {
            if self.stop.is_stopped() {
                return Err(CalibrationError::Cancelled { collected: samples.len() });
            }
            if attempts >= self.config.max_attempts {
                error!(
                    "Calibration gave up after {} attempts with {}/{} samples",
                    attempts,
                    samples.len(),
                    required
                );
                return Err(CalibrationError::AttemptsExhausted {
                    collected: samples.len(),
                    required,
                    attempts,
                });
            }
            attempts += 1;

            let pose = perturb(&self.config.probe_pose, &self.config.perturbation, rng);
            if move_to_pose(self.robot.as_ref(), self.arm, &pose).await.is_err() {
                continue;
            }
            let reading = match self.robot.read_range(self.arm).await {
                Ok(reading) => reading,
                Err(e) => {
                    error!("Reading range sensor failed: {}", e);
                    continue;
                }
            };
            if reading >= self.config.sensor_ceiling {
                error!("No valid distance found (sensor returned {})", reading);
                continue;
            }
            // the sensor reports millimeters from its mount, so remove the pose height
            let sample = f64::from(reading) / 1000.0 - pose.z;
            samples.push(sample);
            info!("Recorded {}/{} measurements (d={:.3}m)", samples.len(), required, sample);
        }

        let avg_distance = samples.iter().sum::<f64>() / samples.len() as f64;
        if attempts > required {
            warn!("Calibration needed {} attempts for {} samples", attempts, required);
        }
        info!("Will be working with average distance d={:.3}m", avg_distance);
        CalibrationParameters::from_average_distance(avg_distance, &self.config)
    }
}
