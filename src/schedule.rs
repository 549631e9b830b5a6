//! "Run every N starting at T".

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error};

/// Run `job` at `start` and then every `period`, forever.
///
/// The job is awaited before the next tick is taken, so runs of the same task
/// never overlap; a slow run delays the following ticks instead of stacking
/// them. A failed run is logged and the schedule carries on. Stop it by
/// aborting the task it runs in.
pub async fn run_period<F, Fut, E>(name: &'static str, period: Duration, start: Instant, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        debug!(task = name, "periodic task tick");
        if let Err(e) = job().await {
            error!(task = name, error = %e, "periodic task failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
