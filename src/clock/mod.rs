//! Injectable time source.
//!
//! Every deadline in the broker (visibility timeouts, delays, long-poll waits,
//! retention, queue TTL) is computed from a [`Clock`] instead of wall-clock
//! time, so tests can swap in [`MockClock`] and fast-forward.

mod mock;

pub use mock::MockClock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Resolve once [`Clock::now`] has reached `deadline`. Returns immediately
    /// for deadlines that already passed.
    async fn sleep_until(&self, deadline: DateTime<Utc>);

    async fn sleep(&self, duration: std::time::Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.sleep_until(deadline_after(self.now(), ms)).await;
    }
}

/// Clock backed by the system time and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        if let Ok(remaining) = (deadline - Utc::now()).to_std() {
            tokio::time::sleep(remaining).await;
        }
    }
}

/// Milliseconds as a chrono duration, saturating instead of overflowing.
pub fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX / 1_000))
}

/// `now + ms`, saturating at the latest representable instant.
pub fn deadline_after(now: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    now.checked_add_signed(millis(ms))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_clock_past_deadline_returns() {
        let clock = SystemClock;
        let deadline = clock.now() - chrono::Duration::seconds(5);
        tokio::time::timeout(std::time::Duration::from_millis(100), clock.sleep_until(deadline))
            .await
            .expect("past deadline should resolve immediately");
    }

    #[tokio::test]
    async fn test_system_clock_sleeps() {
        let clock = SystemClock;
        let started = clock.now();
        clock.sleep(std::time::Duration::from_millis(20)).await;
        assert!(clock.now() - started >= chrono::Duration::milliseconds(19));
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(1_500), chrono::Duration::milliseconds(1_500));
        assert!(millis(u64::MAX) > chrono::Duration::days(365 * 1000));

        let now = Utc::now();
        assert_eq!(deadline_after(now, u64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(deadline_after(now, 10), now + chrono::Duration::milliseconds(10));
    }
}
