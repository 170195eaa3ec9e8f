use crate::interface::{Arm, Kinematics, KinematicsError, Limb, RobotError};
use crate::pose::Pose6D;
use log::{debug, error};
use thiserror::Error;

/// Reference frame every Cartesian pose in this crate is expressed in.
pub const BASE_FRAME: &str = "base";

#[derive(Debug, Clone, Error)]
pub enum MotionError {
    #[error(transparent)]
    Kinematics(#[from] KinematicsError),
    #[error(transparent)]
    Robot(#[from] RobotError),
}

/// Solves inverse kinematics for `pose` and moves the arm there.
pub async fn move_to_pose<R>(robot: &R, arm: Arm, pose: &Pose6D) -> Result<(), MotionError>
where
    R: Limb + Kinematics,
{
    let config = robot.solve(arm, pose, BASE_FRAME).await.map_err(|e| {
        error!("Inverse kinematics for {} arm failed: {}", arm, e);
        MotionError::from(e)
    })?;
    robot.move_to(arm, &config).await.map_err(|e| {
        error!("Moving {} arm to {} failed: {}", arm, pose, e);
        MotionError::from(e)
    })?;
    debug!("Moved {} arm to {}", arm, pose);
    Ok(())
}
