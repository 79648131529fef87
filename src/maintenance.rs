use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::router::Router;

pub const MIN_CLEANUP_PERIOD: Duration = Duration::from_millis(1);

/// Runs [`Router::idle_time_cleanup`] every `period` until the returned task
/// is aborted. The first sweep happens one period after the call. Periods
/// shorter than [`MIN_CLEANUP_PERIOD`] are raised to it.
pub fn spawn_idle_cleanup(router: Arc<Router>, period: Duration) -> JoinHandle<()> {
    if period < MIN_CLEANUP_PERIOD {
        warn!(period_ms = period.as_millis() as u64, "idle cleanup period too short, using {MIN_CLEANUP_PERIOD:?}");
    }
    let period = period.max(MIN_CLEANUP_PERIOD);
    info!(period_ms = period.as_millis() as u64, "starting idle agent cleanup");
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // interval fires immediately once
        ticker.tick().await;
        loop {
            ticker.tick().await;
            debug!("idle cleanup sweep");
            router.idle_time_cleanup().await;
        }
    })
}
