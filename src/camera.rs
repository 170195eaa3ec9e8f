use crate::interface::{Arm, Camera};
use image::RgbImage;
use log::debug;
use thiserror::Error;
use tokio::time::{timeout, Duration};

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("no frame from {arm} hand camera within {waited:?}")]
    Timeout { arm: Arm, waited: Duration },
    #[error("{arm} hand camera stream closed")]
    SourceClosed { arm: Arm },
}

/// Waits for one fresh frame from the arm's hand camera.
///
/// The subscription lives only for this call: the receiver is dropped on
/// return, which unsubscribes, so frames never leak between captures or arms.
pub async fn capture_frame<C: Camera>(camera: &C, arm: Arm, deadline: Duration) -> Result<RgbImage, CaptureError> {
    let mut frames = camera.subscribe(arm);
    match timeout(deadline, frames.recv()).await {
        Ok(Some(frame)) => {
            debug!("Captured {}x{} frame from {} hand camera", frame.width(), frame.height(), arm);
            Ok(frame)
        }
        Ok(None) => Err(CaptureError::SourceClosed { arm }),
        Err(_) => Err(CaptureError::Timeout { arm, waited: deadline }),
    }
}
