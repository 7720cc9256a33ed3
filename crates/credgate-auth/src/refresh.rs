use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::manager::Manager;

/// Spawn the health and refresh worker: a single cooperative loop that, on
/// each tick, refreshes records whose schedule is due and recovers records
/// whose cooldowns have elapsed.
///
/// The handle can be aborted on shutdown; no work outlives an in-flight
/// tick.
pub fn spawn_refresh_worker(manager: Arc<Manager>, tick: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let now = OffsetDateTime::now_utc();
            manager.refresh_due(now).await;
            manager.recover_due(now).await;
            debug!("refresh worker tick complete");
        }
    })
}
