//! Shared utilities for the core crate.

use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;

/// Delay before reconnect attempt `attempt` (1-based).
///
/// `initial_ms * 2^(attempt-1)` capped at `max_ms`, with +/- 25% jitter so
/// that many sources dropped by the same outage do not reconnect in lockstep.
#[must_use]
pub fn backoff_delay(attempt: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let base = initial_ms.saturating_mul(1u64 << attempt.min(16).saturating_sub(1));
    let capped = base.min(max_ms);
    let jitter_range = capped / 4;
    let random_offset = if jitter_range > 0 {
        rand::rng().random_range(0..=(jitter_range * 2))
    } else {
        0
    };
    let delay = (capped.saturating_sub(jitter_range) + random_offset).min(max_ms);
    Duration::from_millis(delay)
}

/// Sleeps for the backoff delay; returns false if cancelled first.
pub async fn backoff(attempt: u32, initial_ms: u64, max_ms: u64, cancel: &CancellationToken) -> bool {
    let delay = backoff_delay(attempt, initial_ms, max_ms);
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        () = cancel.cancelled() => false,
    }
}

/// Converts a media timestamp in `clock_rate` units to milliseconds.
#[must_use]
pub fn ticks_to_ms(ticks: u64, clock_rate: u32) -> i64 {
    if clock_rate == 0 {
        return 0;
    }
    (u128::from(ticks) * 1000 / u128::from(clock_rate)) as i64
}

/// Milliseconds to `clock_rate` ticks, wrapped to 32 bits for RTP.
#[must_use]
pub fn ms_to_rtp(ms: i64, clock_rate: u32) -> u32 {
    (i128::from(ms.max(0)) * i128::from(clock_rate) / 1000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_bounds() {
        for attempt in 1..10 {
            let delay = backoff_delay(attempt, 1000, 30_000).as_millis() as u64;
            let base = (1000u64 << (attempt - 1)).min(30_000);
            assert!(delay >= base - base / 4, "attempt {attempt}: {delay}");
            assert!(delay <= 30_000);
        }
        assert_eq!(backoff_delay(1, 0, 100), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_backoff_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!backoff(5, 10_000, 30_000, &cancel).await);
    }

    #[test]
    fn test_clock_conversions() {
        assert_eq!(ticks_to_ms(90_000, 90_000), 1000);
        assert_eq!(ticks_to_ms(44_100, 44_100), 1000);
        assert_eq!(ms_to_rtp(1000, 90_000), 90_000);
        assert_eq!(ticks_to_ms(5, 0), 0);
    }
}
