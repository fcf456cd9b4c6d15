use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::oneshot;

use super::{deadline_after, Clock};

/// Deterministic clock for tests. Time only moves through [`MockClock::advance`].
pub struct MockClock {
    state: Mutex<MockClockState>,
}

struct MockClockState {
    now: DateTime<Utc>,
    sleepers: Vec<Sleeper>,
}

struct Sleeper {
    deadline: DateTime<Utc>,
    wake: oneshot::Sender<()>,
}

impl MockClock {
    /// Starts at 2024-01-01T00:00:00Z.
    pub fn new() -> Self {
        Self::starting_at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default())
    }

    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(MockClockState {
                now,
                sleepers: Vec::new(),
            }),
        }
    }

    /// Move time forward and wake every sleeper whose deadline is now reached.
    pub fn advance(&self, duration: Duration) {
        let due = {
            let mut state = self.lock();
            let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
            state.now = deadline_after(state.now, ms);
            let now = state.now;
            let (due, pending): (Vec<_>, Vec<_>) =
                state.sleepers.drain(..).partition(|s| s.deadline <= now);
            state.sleepers = pending;
            due
        };
        for sleeper in due {
            let _ = sleeper.wake.send(());
        }
    }

    /// Number of operations currently parked in [`Clock::sleep_until`].
    pub fn pending_sleepers(&self) -> usize {
        self.lock()
            .sleepers
            .iter()
            .filter(|s| !s.wake.is_closed())
            .count()
    }

    /// Yield to the runtime until at least `count` sleepers are parked.
    pub async fn wait_for_sleepers(&self, count: usize) {
        while self.pending_sleepers() < count {
            tokio::task::yield_now().await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockClockState> {
        // A poisoned lock only means a test panicked while holding it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let woken = {
            let mut state = self.lock();
            if deadline <= state.now {
                return;
            }
            let (wake, woken) = oneshot::channel();
            state.sleepers.push(Sleeper { deadline, wake });
            woken
        };
        let _ = woken.await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_advance_moves_now() {
        let clock = MockClock::new();
        let start = clock.now();
        clock.advance(Duration::from_millis(1_500));
        assert_eq!(clock.now() - start, chrono::Duration::milliseconds(1_500));
    }

    #[tokio::test]
    async fn test_sleeper_wakes_at_deadline() {
        let clock = Arc::new(MockClock::new());
        let deadline = clock.now() + chrono::Duration::milliseconds(1_000);

        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep_until(deadline).await })
        };
        clock.wait_for_sleepers(1).await;

        clock.advance(Duration::from_millis(999));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());
        assert_eq!(clock.pending_sleepers(), 1);

        clock.advance(Duration::from_millis(1));
        sleeper.await.unwrap();
        assert_eq!(clock.pending_sleepers(), 0);
    }

    #[tokio::test]
    async fn test_past_deadline_returns_immediately() {
        let clock = MockClock::new();
        clock.sleep_until(clock.now()).await;
        assert_eq!(clock.pending_sleepers(), 0);
    }

    #[tokio::test]
    async fn test_dropped_sleeper_not_counted() {
        let clock = MockClock::new();
        let deadline = clock.now() + chrono::Duration::seconds(1);
        {
            let mut task = tokio_test::task::spawn(clock.sleep_until(deadline));
            tokio_test::assert_pending!(task.poll());
            assert_eq!(clock.pending_sleepers(), 1);
        }
        assert_eq!(clock.pending_sleepers(), 0);
    }
}
