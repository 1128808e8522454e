use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::Engine;

#[derive(Debug, Clone, Copy)]
pub struct TaskIntervals {
    /// Connection-count log line
    pub stats: Duration,
    /// Typing indicator expiry sweep
    pub typing_sweep: Duration,
}

impl Default for TaskIntervals {
    fn default() -> Self {
        Self {
            stats: Duration::from_secs(30),
            typing_sweep: Duration::from_secs(1),
        }
    }
}

/// Periodic housekeeping. Runs until `cancel` fires.
pub fn spawn_background_tasks(engine: Engine, intervals: TaskIntervals, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stats = tokio::time::interval(intervals.stats);
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(intervals.typing_sweep);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = stats.tick() => {
                    let channels = engine.connection_count().await;
                    let users = engine.registry().len().await;
                    info!("Active connections: {} ({} logged in)", channels, users);
                }
                _ = sweep.tick() => {
                    let expired = engine.expire_typing().await;
                    if expired > 0 {
                        debug!("Expired {} typing indicators", expired);
                    }
                }
            }
        }

        debug!("Background tasks stopped");
    })
}
