use std::time::Duration;

use rand::Rng;

/// Strategy for delaying retries of a failed dial destination. Contract mirrors the teacher's
/// `Backoff` trait (`calculate_backoff(attempts) -> Duration`), used here by the dial scheduler
/// to avoid hot-looping on a destination that keeps failing (spec.md §4.4).
pub trait Backoff: Send + Sync {
    fn calculate_backoff(&self, attempts: usize) -> Duration;
}

/// Exponential backoff with jitter and a cap. `attempts` is 1-indexed (the first retry uses
/// `attempts == 1`).
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

impl Backoff for ExponentialBackoff {
    fn calculate_backoff(&self, attempts: usize) -> Duration {
        let exp = attempts.min(16) as u32;
        let raw = self.base.saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
        let capped = raw.min(self.max);
        let jitter_ms = rand::thread_rng().gen_range(0..=(capped.as_millis() as u64 / 4).max(1));
        capped + Duration::from_millis(jitter_ms)
    }
}

/// No delay at all; useful for tests that want deterministic, immediate redial.
pub struct ZeroBackoff;

impl Backoff for ZeroBackoff {
    fn calculate_backoff(&self, _attempts: usize) -> Duration {
        Duration::from_millis(0)
    }
}
