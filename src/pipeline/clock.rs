use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

/// Source of wall-clock time and waiting.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    async fn sleep(&self, duration: Duration);
}

/// Source of randomized delays and thresholds.
pub trait Jitter: Send + Sync {
    /// A duration drawn uniformly from `[low, high]`.
    fn between(&self, low: Duration, high: Duration) -> Duration;
}

/// Real time: `chrono` for "now", tokio timers for sleeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Uniform jitter from the thread-local RNG, millisecond resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadJitter;

impl Jitter for ThreadJitter {
    fn between(&self, low: Duration, high: Duration) -> Duration {
        let low_ms = u64::try_from(low.as_millis()).unwrap_or(u64::MAX);
        let high_ms = u64::try_from(high.as_millis()).unwrap_or(u64::MAX);
        if high_ms <= low_ms {
            return low;
        }
        Duration::from_millis(rand::rng().random_range(low_ms..=high_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_in_range() {
        let low = Duration::from_secs(120);
        let high = Duration::from_secs(300);
        for _ in 0..200 {
            let d = ThreadJitter.between(low, high);
            assert!(d >= low && d <= high, "{:?} out of range", d);
        }
    }

    #[test]
    fn test_jitter_degenerate_range() {
        let d = Duration::from_secs(30);
        assert_eq!(ThreadJitter.between(d, d), d);
        assert_eq!(ThreadJitter.between(d, Duration::from_secs(1)), d);
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_sleep_uses_tokio_time() {
        let start = tokio::time::Instant::now();
        SystemClock.sleep(Duration::from_secs(90)).await;
        assert!(start.elapsed() >= Duration::from_secs(90));
    }
}
