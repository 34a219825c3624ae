use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Duration;

/// Delay before retry pass `retry` (1-based): 100ms, 200ms, 400ms, ...
/// capped at ~6.4s. Applied only at the outer retry boundary of batched
/// operations, never inside a chunk loop.
pub(crate) fn retry_delay(retry: usize) -> Duration {
    let shift = retry.saturating_sub(1).min(6) as u32;
    Duration::from_millis(100u64 << shift)
}

/// Milliseconds since the Unix epoch. A clock before the epoch reads as 0.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
