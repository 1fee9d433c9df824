/// Reconnect backoff shared by every long-running Redis loop
///
/// Stream receivers, queue workers and the cache invalidation listener all
/// follow the same pattern after a connection error: log, wait, reopen. The
/// wait doubles with each consecutive failure and is cut short by shutdown.
///
/// ```text
/// streak   1    2     3     4     ...   7+
/// wait   500  1000  2000  4000   ...  30000 (ms)
/// ```

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// First reconnect delay in milliseconds
pub const RECONNECT_BACKOFF_MS: u64 = 500;

/// Upper bound for reconnect delays in milliseconds
pub const MAX_RECONNECT_BACKOFF_MS: u64 = 30_000;

/// Delay before the next attempt after `failure_streak` consecutive failures
///
/// Doubles from `base_ms` per failure and never exceeds
/// `MAX_RECONNECT_BACKOFF_MS`.
pub fn compute_retry_backoff_ms(base_ms: u64, failure_streak: u32) -> u64 {
    if failure_streak <= 1 {
        return base_ms.clamp(1, MAX_RECONNECT_BACKOFF_MS);
    }
    let shift = failure_streak.saturating_sub(1).min(12);
    base_ms
        .max(1)
        .saturating_mul(1u64 << shift)
        .min(MAX_RECONNECT_BACKOFF_MS)
}

/// Sleeps for `millis`, returning early once `shutdown` fires
pub async fn sleep_or_shutdown(shutdown: &CancellationToken, millis: u64) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(Duration::from_millis(millis)) => {}
    }
}
