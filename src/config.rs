//! Session configuration. Every field defaults to the values the demonstrator
//! was tuned with; a JSON file may override any subset.

use crate::interface::Arm;
use crate::pose::{PerturbationBounds, Pose6D};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Pose the range sensor is sampled around.
    pub probe_pose: Pose6D,
    pub samples: usize,
    /// Readings at or above this many millimeters are the out-of-range sentinel.
    pub sensor_ceiling: u32,
    pub max_attempts: usize,
    pub meters_per_pixel_at_1m: f64,
    pub x_offset: f64,
    pub y_offset: f64,
    pub z_offset: f64,
    pub perturbation: PerturbationBounds,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            probe_pose: Pose6D::new(0.60, 0.20, 0.0, -PI, 0.0, 0.0),
            samples: 10,
            sensor_ceiling: 65_000,
            max_attempts: 100,
            meters_per_pixel_at_1m: 0.0025,
            x_offset: 0.01,
            y_offset: -0.02,
            // camera-to-fingertip height plus finger clearance
            z_offset: 0.02 + 0.01,
            perturbation: PerturbationBounds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    pub kp: f64,
    /// Position error in meters below which servoing has converged.
    pub tolerance: f64,
    pub max_iterations: usize,
    pub detection_threshold: f64,
    pub frame_timeout_ms: u64,
}

impl Default for ServoConfig {
    fn default() -> Self {
        ServoConfig {
            kp: 0.7,
            tolerance: 0.005,
            max_iterations: 50,
            detection_threshold: 0.8,
            frame_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PickConfig {
    /// Top-down viewing pose.
    pub top_pose: Pose6D,
    /// Retries with a perturbed top pose after the direct move failed.
    pub n_tries: usize,
    pub max_trigger_wait_secs: f64,
    pub approach_offset: Pose6D,
    /// Pixel (col, row) of the bin in the top view.
    pub bin_pixel: [f64; 2],
    /// Give up the demonstration after this many attempts; unbounded if absent.
    pub max_attempts: Option<usize>,
    pub perturbation: PerturbationBounds,
}

impl Default for PickConfig {
    fn default() -> Self {
        PickConfig {
            top_pose: Pose6D::new(0.50, 0.00, 0.15, -PI, 0.0, 0.0),
            n_tries: 2,
            max_trigger_wait_secs: 10.0,
            approach_offset: Pose6D::new(0.0, 0.0, 0.05, 0.0, 0.0, 0.0),
            bin_pixel: [430.7, 340.02],
            max_attempts: None,
            perturbation: PerturbationBounds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub arm: Arm,
    pub calibration: CalibrationConfig,
    pub servo: ServoConfig,
    pub pick: PickConfig,
    /// Seed for perturbations and trigger waits; entropy when absent.
    pub seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            arm: Arm::Left,
            calibration: CalibrationConfig::default(),
            servo: ServoConfig::default(),
            pick: PickConfig::default(),
            seed: None,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(contents: &str) -> Result<SessionConfig, ConfigError> {
        let config: SessionConfig = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<SessionConfig, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        SessionConfig::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.calibration.samples == 0 {
            return Err(ConfigError::Invalid("calibration.samples must be positive".to_string()));
        }
        if self.calibration.max_attempts < self.calibration.samples {
            return Err(ConfigError::Invalid(
                "calibration.max_attempts must be at least calibration.samples".to_string(),
            ));
        }
        if self.calibration.meters_per_pixel_at_1m <= 0.0 {
            return Err(ConfigError::Invalid("calibration.meters_per_pixel_at_1m must be positive".to_string()));
        }
        if !(self.servo.kp > 0.0 && self.servo.kp <= 1.0) {
            return Err(ConfigError::Invalid("servo.kp must lie in (0, 1]".to_string()));
        }
        if self.servo.tolerance <= 0.0 {
            return Err(ConfigError::Invalid("servo.tolerance must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.servo.detection_threshold) {
            return Err(ConfigError::Invalid("servo.detection_threshold must lie in [0, 1]".to_string()));
        }
        if self.servo.max_iterations == 0 {
            return Err(ConfigError::Invalid("servo.max_iterations must be positive".to_string()));
        }
        if self.servo.frame_timeout_ms == 0 {
            return Err(ConfigError::Invalid("servo.frame_timeout_ms must be positive".to_string()));
        }
        if self.pick.max_trigger_wait_secs < 0.0 || !self.pick.max_trigger_wait_secs.is_finite() {
            return Err(ConfigError::Invalid("pick.max_trigger_wait_secs must be finite and >= 0".to_string()));
        }
        check_perturbation("calibration.perturbation", &self.calibration.perturbation)?;
        check_perturbation("pick.perturbation", &self.pick.perturbation)?;
        Ok(())
    }
}

fn check_perturbation(name: &str, bounds: &PerturbationBounds) -> Result<(), ConfigError> {
    if bounds.widths().iter().all(|w| w.is_finite() && *w >= 0.0) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{} widths must be finite and >= 0", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SessionConfig::from_json_str(r#"{"arm": "right", "servo": {"tolerance": 0.01}}"#).unwrap();
        assert_eq!(config.arm, Arm::Right);
        assert_eq!(config.servo.tolerance, 0.01);
        assert_eq!(config.servo.kp, 0.7);
        assert_eq!(config.calibration.samples, 10);
        assert_eq!(config.pick.n_tries, 2);
    }

    #[test]
    fn rejects_out_of_range_gain() {
        let err = SessionConfig::from_json_str(r#"{"servo": {"kp": 1.5}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_negative_perturbation_width() {
        let err = SessionConfig::from_json_str(r#"{"pick": {"perturbation": {"x": -0.01, "y": 0.03, "z": 0.02, "roll": 0.0, "pitch": 0.0, "yaw": 0.0}}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("pick.perturbation")));

        let mut config = SessionConfig::default();
        config.calibration.perturbation.yaw = -1.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("calibration.perturbation")));
    }

    #[test]
    fn rejects_zero_iteration_cap_and_frame_timeout() {
        let err = SessionConfig::from_json_str(r#"{"servo": {"max_iterations": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("max_iterations")));
        let err = SessionConfig::from_json_str(r#"{"servo": {"frame_timeout_ms": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("frame_timeout_ms")));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(SessionConfig::from_json_str("{"), Err(ConfigError::Parse(_))));
    }
}
