use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Cooperative stop request shared between the process and its control loops.
/// Loops poll it at the top of every iteration; nothing is interrupted mid-move.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> StopSignal {
        StopSignal::default()
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested. Meant to be raced against
    /// idle waits with `tokio::select!`.
    pub async fn stopped(&self) {
        while !self.is_stopped() {
            sleep(POLL_INTERVAL).await;
        }
    }
}
