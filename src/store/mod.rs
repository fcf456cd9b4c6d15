//! The broker facade.
//!
//! [`Store`] is the only surface external collaborators call. Every operation
//! is one storage transaction: per-queue locks are taken first, the
//! [`QueueEngine`] (or [`UserDirectory`]) does the work, and the transaction
//! is committed on success or rolled back on any error. Wake-ups the engine
//! scheduled (visibility deadlines, delivery delays) are armed only after a
//! successful commit.
//!
//! # Background tasks
//!
//! [`Store::start`] spawns:
//! - a forwarder turning backend change notifications into wait-signal wakes
//! - the poller, running [`Store::poll`] every `store.poll_interval_ms`

mod locks;
mod messages;
mod poller;
mod queues;
mod topics;
mod users;

pub use poller::PollSummary;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::error::Result;
use crate::queue::{normalize_name, QueueEngine, ScheduledWake};
use crate::signal::WaitSignals;
use crate::storage::{ChangeNotification, StorageBackend, Transaction};
use crate::user::{BcryptPasswordHasher, CreateUserOptions, PasswordHasher, UserDirectory};

use locks::QueueLocks;

/// Construction options for a [`Store`].
#[derive(Clone)]
pub struct StoreOptions {
    pub clock: Arc<dyn Clock>,
    pub hasher: Arc<dyn PasswordHasher>,
    /// Period of the background poll, `None` to disable it
    pub poll_interval: Option<Duration>,
    /// Created by `start` when no user exists yet
    pub initial_users: Vec<CreateUserOptions>,
}

impl StoreOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let initial_users = settings
            .auth
            .initial_users
            .iter()
            .map(|user| CreateUserOptions {
                username: user.username.clone(),
                password: user.password.clone(),
                access_key_id: user.access_key_id.clone(),
                secret_access_key: user.secret_access_key.clone(),
            })
            .collect();
        Self {
            clock: Arc::new(SystemClock),
            hasher: Arc::new(BcryptPasswordHasher::new(
                settings.auth.password_hash_rounds,
            )),
            poll_interval: settings.store.poll_interval(),
            initial_users,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Queues, topics and users over one storage backend.
///
/// Cheap to clone; clones share the backend and background tasks.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    hasher: Arc<dyn PasswordHasher>,
    signals: Arc<WaitSignals>,
    locks: QueueLocks,
    poll_interval: Option<Duration>,
    initial_users: Vec<CreateUserOptions>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl Store {
    pub fn new(backend: Arc<dyn StorageBackend>, options: StoreOptions) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(StoreInner {
                backend,
                clock: options.clock,
                hasher: options.hasher,
                signals: Arc::new(WaitSignals::new()),
                locks: QueueLocks::new(),
                poll_interval: options.poll_interval,
                initial_users: options.initial_users,
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.inner.backend
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Create the schema, seed initial users and spawn the background tasks.
    /// Calling it again is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.backend.migrate().await?;

        let forwarder = tokio::spawn(forward_notifications(
            self.inner.backend.subscribe(),
            self.inner.signals.clone(),
            self.inner.shutdown_tx.subscribe(),
        ));
        self.track(forwarder);

        self.create_initial_users().await?;

        if let Some(interval) = self.inner.poll_interval {
            let poller = tokio::spawn(poller::run(
                Arc::downgrade(&self.inner),
                self.inner.clock.clone(),
                interval,
                self.inner.shutdown_tx.subscribe(),
            ));
            self.track(poller);
        }

        tracing::info!(
            backend = self.inner.backend.name(),
            poll_interval_ms = self.inner.poll_interval.map(|d| d.as_millis() as u64),
            "Store started"
        );
        Ok(())
    }

    /// Stop background work, wake every long-poll waiter and release the backend.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(());

        let tasks = std::mem::take(
            &mut *self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner()),
        );
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "Background task failed");
                }
            }
        }

        self.inner.backend.shutdown().await;
        self.inner.signals.notify_all();
        tracing::info!("Store shut down");
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(handle);
    }

    async fn create_initial_users(&self) -> Result<()> {
        if self.inner.initial_users.is_empty() {
            return Ok(());
        }
        let seeded = self
            .with_users(|mut directory| {
                Box::pin(async move { Ok(!directory.list().await?.is_empty()) })
            })
            .await?;
        if seeded {
            return Ok(());
        }

        let mut users = Vec::with_capacity(self.inner.initial_users.len());
        for user in &self.inner.initial_users {
            let password_hash = self.hash_user_password(user).await?;
            users.push((user.clone(), password_hash));
        }
        let created = self
            .with_users(move |mut directory| {
                Box::pin(async move {
                    if !directory.list().await?.is_empty() {
                        return Ok(0);
                    }
                    let count = users.len();
                    for (user, password_hash) in users {
                        directory.create(user, password_hash).await?;
                    }
                    Ok(count)
                })
            })
            .await?;
        if created > 0 {
            tracing::info!(count = created, "Initial users created");
        }
        Ok(())
    }

    /// Run `op` against a [`QueueEngine`] in one transaction while holding the
    /// locks of `queues`.
    async fn transact<T, F>(&self, queues: &[&str], op: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut QueueEngine<'_>) -> BoxFuture<'c, Result<T>> + Send,
    {
        let _guards = self.inner.locks.lock_all(queues).await;
        let mut tx = self.inner.backend.begin().await?;
        let now = self.inner.clock.now();

        let (result, wakes) = {
            let mut engine = QueueEngine::new(tx.as_mut(), now);
            let result = op(&mut engine).await;
            (result, engine.take_wakes())
        };

        let value = finish(tx, result).await?;
        self.schedule_wakes(wakes);
        Ok(value)
    }

    async fn with_users<T, F>(&self, op: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(UserDirectory<'c>) -> BoxFuture<'c, Result<T>> + Send,
    {
        let mut tx = self.inner.backend.begin().await?;
        let result = op(UserDirectory::new(tx.as_mut())).await;
        finish(tx, result).await
    }

    /// Arm one task per distinct wake-up. A fired wake resolves expired
    /// deliveries of its queue and wakes the queue's waiters.
    fn schedule_wakes(&self, mut wakes: Vec<ScheduledWake>) {
        if wakes.is_empty() || self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        wakes.sort_by(|a, b| a.queue_name.cmp(&b.queue_name).then(a.at.cmp(&b.at)));
        wakes.dedup();

        for wake in wakes {
            let store = Arc::downgrade(&self.inner);
            let clock = self.inner.clock.clone();
            let mut shutdown = self.inner.shutdown_tx.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.recv() => {}
                    _ = clock.sleep_until(wake.at) => {
                        if let Some(store) = upgrade(&store) {
                            store.wake_queue(&wake.queue_name).await;
                        }
                    }
                }
            });
        }
    }

    async fn wake_queue(&self, queue_name: &str) {
        let name = queue_name.to_string();
        let result = self
            .transact(&[queue_name], move |engine| {
                Box::pin(async move {
                    match engine.transaction().find_queue(&name).await? {
                        Some(queue) => engine.expire_deliveries(&queue).await,
                        None => Ok((0, 0)),
                    }
                })
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(queue_name = %queue_name, error = %e, "Scheduled wake failed");
        }
        self.inner.signals.notify(queue_name);
    }
}

fn upgrade(inner: &Weak<StoreInner>) -> Option<Store> {
    inner.upgrade().map(|inner| Store { inner })
}

/// Lookup key for a caller-supplied name. Names that fail validation are
/// kept as given so lookups report "not found" rather than "invalid".
fn lookup_name(name: &str) -> String {
    normalize_name(name).unwrap_or_else(|| name.to_string())
}

/// Lock key for a topic. `/` never appears in a valid name, so topic keys
/// cannot collide with queue names.
fn topic_lock_key(topic_name: &str) -> String {
    format!("topic/{topic_name}")
}

/// Commit on success. On failure roll back and return the original error,
/// even when the rollback itself fails.
async fn finish<T>(tx: Box<dyn Transaction>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "Rollback failed");
            }
            Err(e)
        }
    }
}

async fn forward_notifications(
    mut notifications: broadcast::Receiver<ChangeNotification>,
    signals: Arc<WaitSignals>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            received = notifications.recv() => match received {
                Ok(notification) => {
                    tracing::trace!(
                        queue_name = %notification.queue_name,
                        kind = notification.kind.as_str(),
                        "Change notification"
                    );
                    signals.notify(&notification.queue_name);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Notification stream lagged, waking all waiters");
                    signals.notify_all();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!("Notification forwarder stopped");
}
