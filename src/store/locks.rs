use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Per-queue async mutexes serializing read-modify-write work on one queue.
///
/// Always taken before a storage transaction is opened, and in name order
/// when an operation spans several queues. An entry lives only while some
/// caller holds or waits for it, so names that never become queues leave
/// nothing behind.
#[derive(Default)]
pub(crate) struct QueueLocks {
    locks: Arc<LockMap>,
}

/// Held lock on one queue name. Dropping it releases the mutex and removes
/// the entry when no one else is queued on it.
#[derive(Debug)]
pub(crate) struct QueueGuard {
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Waiters hold a clone of the Arc, so a count of one means only the map.
        self.locks
            .remove_if(&self.name, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl QueueLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self, name: &str) -> QueueGuard {
        let mutex = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        QueueGuard {
            name: name.to_string(),
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    pub(crate) async fn lock_all(&self, names: &[&str]) -> Vec<QueueGuard> {
        let mut names = names.to_vec();
        names.sort_unstable();
        names.dedup();
        let mut guards = Vec::with_capacity(names.len());
        for name in names {
            guards.push(self.lock(name).await);
        }
        guards
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready};

    use super::*;

    #[tokio::test]
    async fn test_same_queue_is_exclusive() {
        let locks = QueueLocks::new();
        let held = locks.lock("orders").await;

        let mut second = tokio_test::task::spawn(locks.lock("orders"));
        assert_pending!(second.poll());

        let mut other = tokio_test::task::spawn(locks.lock("payments"));
        assert_ready!(other.poll());

        drop(held);
        assert!(second.is_woken());
        assert_ready!(second.poll());
    }

    #[tokio::test]
    async fn test_lock_all_dedups_names() {
        let locks = QueueLocks::new();
        let guards = locks.lock_all(&["b", "a", "b"]).await;
        assert_eq!(guards.len(), 2);
    }

    #[tokio::test]
    async fn test_entries_removed_after_release() {
        let locks = QueueLocks::new();
        for i in 0..100 {
            let _guard = locks.lock(&format!("missing-{i}")).await;
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_entry_kept_while_waiter_queued() {
        let locks = QueueLocks::new();
        let held = locks.lock("orders").await;
        let mut waiter = tokio_test::task::spawn(locks.lock("orders"));
        assert_pending!(waiter.poll());

        drop(held);
        assert_eq!(locks.len(), 1);

        let guard = match waiter.poll() {
            std::task::Poll::Ready(guard) => guard,
            std::task::Poll::Pending => panic!("waiter should acquire the lock"),
        };
        drop(guard);
        assert_eq!(locks.len(), 0);
    }
}
