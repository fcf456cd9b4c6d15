use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::clock::Clock;
use crate::error::Result;
use crate::queue::{DeadLetterTarget, SweepResult};

use super::queues::dead_letter_referrer;
use super::{upgrade, Store, StoreInner};

/// Work done by one [`Store::poll`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub purged: u64,
    pub returned: usize,
    pub dead_lettered: usize,
    /// Queues removed because their TTL elapsed
    pub deleted_queues: Vec<String>,
}

impl PollSummary {
    pub fn is_empty(&self) -> bool {
        self.purged == 0
            && self.returned == 0
            && self.dead_lettered == 0
            && self.deleted_queues.is_empty()
    }

    fn add(&mut self, sweep: SweepResult) {
        self.purged += sweep.purged;
        self.returned += sweep.returned;
        self.dead_lettered += sweep.dead_lettered;
    }
}

struct QueueSweep {
    result: SweepResult,
    deleted: bool,
}

impl Store {
    /// Sweep every queue: purge retention-expired messages, resolve expired
    /// deliveries and delete queues whose TTL has elapsed.
    ///
    /// A failure on one queue is logged and does not stop the others.
    #[tracing::instrument(skip_all)]
    pub async fn poll(&self) -> Result<PollSummary> {
        let names = self
            .transact(&[], |engine| {
                Box::pin(async move {
                    let queues = engine.transaction().list_queues().await?;
                    Ok(queues.into_iter().map(|q| q.name).collect::<Vec<_>>())
                })
            })
            .await?;

        let mut summary = PollSummary::default();
        for name in names {
            match self.sweep_queue(&name).await {
                Ok(Some(sweep)) => {
                    summary.add(sweep.result);
                    if sweep.deleted {
                        self.forget_queue(&name);
                        tracing::info!(queue_name = %name, "Expired queue deleted");
                        summary.deleted_queues.push(name);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(queue_name = %name, error = %e, "Queue sweep failed");
                }
            }
        }
        Ok(summary)
    }

    async fn sweep_queue(&self, queue_name: &str) -> Result<Option<QueueSweep>> {
        let name = queue_name.to_string();
        self.transact(&[queue_name], move |engine| {
            Box::pin(async move {
                let Some(queue) = engine.transaction().find_queue(&name).await? else {
                    return Ok(None);
                };
                let result = engine.sweep(&queue).await?;

                if !queue.is_expired(engine.now()) {
                    return Ok(Some(QueueSweep {
                        result,
                        deleted: false,
                    }));
                }
                let reference = DeadLetterTarget::Queue(name.clone());
                if let Some(referenced_by) =
                    dead_letter_referrer(engine, &reference, Some(name.as_str())).await?
                {
                    tracing::warn!(
                        queue_name = %name,
                        referenced_by = %referenced_by,
                        "Expired queue kept, it is still a dead letter target"
                    );
                    return Ok(Some(QueueSweep {
                        result,
                        deleted: false,
                    }));
                }
                let deleted = engine.transaction().delete_queue(&name).await?;
                Ok(Some(QueueSweep { result, deleted }))
            })
        })
        .await
    }
}

/// Background loop calling [`Store::poll`] every `interval` of clock time.
/// Holds only a weak reference so a dropped store ends the loop.
pub(super) async fn run(
    inner: Weak<StoreInner>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::info!(interval_ms = interval.as_millis() as u64, "Poller started");
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = clock.sleep(interval) => {}
        }
        let Some(store) = upgrade(&inner) else {
            break;
        };
        match store.poll().await {
            Ok(summary) if !summary.is_empty() => {
                tracing::debug!(
                    purged = summary.purged,
                    returned = summary.returned,
                    dead_lettered = summary.dead_lettered,
                    deleted_queues = summary.deleted_queues.len(),
                    "Poll completed"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Poll failed"),
        }
    }
    tracing::info!("Poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::queue::{QueueConfig, SendMessageOptions};
    use crate::storage::MemoryBackend;
    use crate::store::tests::memory_store;
    use crate::store::StoreOptions;
    use crate::user::BcryptPasswordHasher;

    #[tokio::test]
    async fn test_poll_purges_retention_expired() {
        let (store, clock) = memory_store().await;
        store
            .create_queue(
                "q",
                QueueConfig {
                    message_retention_period_ms: Some(1_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .send_message("q", "old", SendMessageOptions::default())
            .await
            .unwrap();

        clock.advance(Duration::from_millis(1_001));
        assert_eq!(store.get_queue_info("q").await.unwrap().number_of_messages, 0);
        let summary = store.poll().await.unwrap();
        assert_eq!(summary.purged, 1);
    }

    #[tokio::test]
    async fn test_poll_deletes_expired_queue_unless_dead_letter_target() {
        let (store, clock) = memory_store().await;
        let ttl = QueueConfig {
            expires_ms: Some(500),
            ..Default::default()
        };
        store.create_queue("temp", ttl.clone()).await.unwrap();
        store.create_queue("dlq", ttl).await.unwrap();
        store
            .create_queue("orders", QueueConfig::default().with_dead_letter_queue("dlq", 1))
            .await
            .unwrap();

        clock.advance(Duration::from_millis(501));
        let summary = store.poll().await.unwrap();
        assert_eq!(summary.deleted_queues, vec!["temp".to_string()]);
        assert!(store.get_queue_info("dlq").await.is_ok());
    }

    #[tokio::test]
    async fn test_receive_refreshes_queue_ttl() {
        let (store, clock) = memory_store().await;
        store
            .create_queue(
                "temp",
                QueueConfig {
                    expires_ms: Some(500),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        clock.advance(Duration::from_millis(400));
        store.receive_messages("temp", Default::default()).await.unwrap();
        clock.advance(Duration::from_millis(400));
        assert!(store.poll().await.unwrap().deleted_queues.is_empty());
    }

    #[tokio::test]
    async fn test_background_poller_runs_on_clock() {
        let clock = Arc::new(MockClock::new());
        let options = StoreOptions {
            poll_interval: Some(Duration::from_secs(1)),
            hasher: Arc::new(BcryptPasswordHasher::new(4)),
            ..StoreOptions::default().with_clock(clock.clone())
        };
        let store = Store::new(Arc::new(MemoryBackend::new()), options);
        store.start().await.unwrap();
        store
            .create_queue(
                "temp",
                QueueConfig {
                    expires_ms: Some(10),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        clock.wait_for_sleepers(1).await;
        clock.advance(Duration::from_secs(1));
        while store.get_queue_info("temp").await.is_ok() {
            tokio::task::yield_now().await;
        }
        store.shutdown().await;
    }
}
