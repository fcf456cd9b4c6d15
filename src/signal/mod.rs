//! Wait-with-timeout primitives used for long polling.
//!
//! Each queue owns a watch channel holding a generation counter. A receiver
//! takes a [`SignalListener`] *before* checking for messages, so a send that
//! lands between the check and the wait is never lost. Any number of
//! listeners may wait on the same queue; a notification wakes all of them and
//! each re-checks storage.
//!
//! Waits race three events and the first one wins:
//! - a notification on the queue ([`WaitOutcome::Signaled`])
//! - the deadline on the injected [`Clock`] ([`WaitOutcome::TimedOut`])
//! - an [`AbortSignal`] firing ([`WaitOutcome::Cancelled`])

mod abort;

pub use abort::{AbortController, AbortSignal};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
    Cancelled,
}

type SignalMap = DashMap<String, watch::Sender<u64>>;

/// Per-key wake-up registry (one entry per queue).
///
/// An entry exists only while some listener is registered on the key.
#[derive(Default)]
pub struct WaitSignals {
    signals: Arc<SignalMap>,
}

impl WaitSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the next notification for `key`.
    pub fn listen(&self, key: &str) -> SignalListener {
        let sender = self
            .signals
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(0).0);
        let mut rx = sender.subscribe();
        rx.mark_unchanged();
        SignalListener {
            key: key.to_string(),
            rx,
            signals: self.signals.clone(),
        }
    }

    /// Wake every listener currently waiting on `key`.
    pub fn notify(&self, key: &str) {
        if let Some(sender) = self.signals.get(key) {
            sender.send_modify(|generation| *generation = generation.wrapping_add(1));
        }
    }

    pub fn notify_all(&self) {
        for entry in self.signals.iter() {
            entry
                .value()
                .send_modify(|generation| *generation = generation.wrapping_add(1));
        }
    }

    /// Drop the entry for `key`. Outstanding listeners resolve as signaled.
    pub fn remove(&self, key: &str) {
        self.signals.remove(key);
    }

    pub fn waiter_count(&self, key: &str) -> usize {
        self.signals
            .get(key)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of keys with at least one registered listener.
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

pub struct SignalListener {
    key: String,
    rx: watch::Receiver<u64>,
    signals: Arc<SignalMap>,
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        let rx = &self.rx;
        // The entry may have been removed and recreated since we subscribed.
        self.signals.remove_if(&self.key, |_, sender| {
            sender.receiver_count() == 1 && sender.subscribe().same_channel(rx)
        });
    }
}

impl SignalListener {
    pub async fn wait_until(
        &mut self,
        clock: &dyn Clock,
        deadline: DateTime<Utc>,
        abort: Option<&mut AbortSignal>,
    ) -> WaitOutcome {
        let aborted = async {
            match abort {
                Some(signal) => signal.aborted().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = aborted => WaitOutcome::Cancelled,
            // An Err means the sender went away (queue deleted); the caller re-checks either way.
            _ = self.rx.changed() => WaitOutcome::Signaled,
            _ = clock.sleep_until(deadline) => WaitOutcome::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_test::{assert_pending, assert_ready_eq};

    use super::*;
    use crate::clock::MockClock;

    fn deadline(clock: &MockClock, ms: i64) -> DateTime<Utc> {
        clock.now() + chrono::Duration::milliseconds(ms)
    }

    #[tokio::test]
    async fn test_notify_wakes_listener() {
        let clock = MockClock::new();
        let signals = WaitSignals::new();
        let mut listener = signals.listen("orders");
        let at = deadline(&clock, 1_000);

        let mut wait = tokio_test::task::spawn(listener.wait_until(&clock, at, None));
        assert_pending!(wait.poll());

        signals.notify("orders");
        assert!(wait.is_woken());
        assert_ready_eq!(wait.poll(), WaitOutcome::Signaled);
    }

    #[tokio::test]
    async fn test_notify_before_wait_is_not_lost() {
        let clock = MockClock::new();
        let signals = WaitSignals::new();
        let mut listener = signals.listen("orders");

        signals.notify("orders");

        let outcome = listener
            .wait_until(&clock, deadline(&clock, 1_000), None)
            .await;
        assert_eq!(outcome, WaitOutcome::Signaled);
    }

    #[tokio::test]
    async fn test_other_key_does_not_wake() {
        let clock = MockClock::new();
        let signals = WaitSignals::new();
        let mut listener = signals.listen("orders");
        let at = deadline(&clock, 1_000);

        let mut wait = tokio_test::task::spawn(listener.wait_until(&clock, at, None));
        assert_pending!(wait.poll());

        signals.notify("payments");
        assert_pending!(wait.poll());
    }

    #[tokio::test]
    async fn test_times_out_on_clock() {
        let clock = Arc::new(MockClock::new());
        let signals = Arc::new(WaitSignals::new());
        let at = deadline(&clock, 1_000);

        let waiter = {
            let clock = clock.clone();
            let mut listener = signals.listen("orders");
            tokio::spawn(async move { listener.wait_until(clock.as_ref(), at, None).await })
        };
        clock.wait_for_sleepers(1).await;
        clock.advance(Duration::from_millis(1_000));

        assert_eq!(waiter.await.unwrap(), WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_abort_cancels_wait() {
        let clock = MockClock::new();
        let signals = WaitSignals::new();
        let controller = AbortController::new();
        let mut signal = controller.signal();
        let mut listener = signals.listen("orders");
        let at = deadline(&clock, 1_000);

        let mut wait = tokio_test::task::spawn(listener.wait_until(&clock, at, Some(&mut signal)));
        assert_pending!(wait.poll());

        controller.abort();
        assert_ready_eq!(wait.poll(), WaitOutcome::Cancelled);
        drop(wait);
        assert_eq!(clock.pending_sleepers(), 0);
    }

    #[tokio::test]
    async fn test_all_waiters_woken() {
        let clock = MockClock::new();
        let signals = WaitSignals::new();
        let mut first = signals.listen("orders");
        let mut second = signals.listen("orders");
        assert_eq!(signals.waiter_count("orders"), 2);
        let at = deadline(&clock, 1_000);

        let mut wait_first = tokio_test::task::spawn(first.wait_until(&clock, at, None));
        let mut wait_second = tokio_test::task::spawn(second.wait_until(&clock, at, None));
        assert_pending!(wait_first.poll());
        assert_pending!(wait_second.poll());

        signals.notify("orders");
        assert_ready_eq!(wait_first.poll(), WaitOutcome::Signaled);
        assert_ready_eq!(wait_second.poll(), WaitOutcome::Signaled);
    }

    #[tokio::test]
    async fn test_remove_resolves_listener() {
        let clock = MockClock::new();
        let signals = WaitSignals::new();
        let mut listener = signals.listen("orders");
        signals.remove("orders");

        let outcome = listener
            .wait_until(&clock, deadline(&clock, 1_000), None)
            .await;
        assert_eq!(outcome, WaitOutcome::Signaled);
    }

    #[test]
    fn test_entry_dropped_with_last_listener() {
        let signals = WaitSignals::new();
        for i in 0..100 {
            drop(signals.listen(&format!("missing-{i}")));
        }
        assert!(signals.is_empty());

        let first = signals.listen("orders");
        let second = signals.listen("orders");
        drop(first);
        assert_eq!(signals.waiter_count("orders"), 1);
        drop(second);
        assert_eq!(signals.len(), 0);
    }

    #[test]
    fn test_stale_listener_keeps_replacement_entry() {
        let signals = WaitSignals::new();
        let stale = signals.listen("orders");
        signals.remove("orders");
        let current = signals.listen("orders");

        drop(stale);
        assert_eq!(signals.waiter_count("orders"), 1);
        drop(current);
        assert!(signals.is_empty());
    }
}
