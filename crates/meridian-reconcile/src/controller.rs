//! Controller — runs a [`Reconciler`] over a [`WorkQueue`] with N workers.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use meridian_state::{StateError, StoreEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::queue::{Backoff, WorkQueue};

/// Errors a reconciler hands back to the engine.
pub trait ReconcileError: std::error::Error + Send + Sync + 'static {
    /// Optimistic-lock failures are expected and retried without logging an error.
    fn is_conflict(&self) -> bool {
        false
    }
}

impl ReconcileError for StateError {
    fn is_conflict(&self) -> bool {
        StateError::is_conflict(self)
    }
}

/// Per-key convergence logic.
pub trait Reconciler: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static;
    type Error: ReconcileError;

    /// Bring the world in line for `key`.
    ///
    /// `Ok(Some(d))` asks to see the key again after `d`, `Ok(None)` means
    /// converged until the next watched change.
    fn handle(
        &self,
        key: &Self::Key,
    ) -> impl Future<Output = Result<Option<Duration>, Self::Error>> + Send;
}

type ResyncFn<K> = Arc<dyn Fn() -> Vec<K> + Send + Sync>;

pub struct Controller<R: Reconciler> {
    name: &'static str,
    reconciler: Arc<R>,
    queue: WorkQueue<R::Key>,
    caches: Vec<watch::Receiver<bool>>,
    workers: usize,
    resync: Option<(Duration, ResyncFn<R::Key>)>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(name: &'static str, reconciler: Arc<R>, backoff: Backoff) -> Self {
        Self {
            name,
            reconciler,
            queue: WorkQueue::new(backoff),
            caches: Vec::new(),
            workers: 1,
            resync: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Workers start only after every gate reports synced.
    pub fn with_caches(mut self, caches: Vec<watch::Receiver<bool>>) -> Self {
        self.caches.extend(caches);
        self
    }

    /// Enqueue `keys()` once workers start and then every `period`.
    pub fn with_resync<F>(mut self, period: Duration, keys: F) -> Self
    where
        F: Fn() -> Vec<R::Key> + Send + Sync + 'static,
    {
        self.resync = Some((period, Arc::new(keys)));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn queue(&self) -> WorkQueue<R::Key> {
        self.queue.clone()
    }

    pub fn enqueue(&self, key: R::Key) {
        self.queue.add(key);
    }

    /// Feed store events into the queue through `map` until shutdown.
    pub fn watch<F>(
        &self,
        mut events: broadcast::Receiver<StoreEvent>,
        mut shutdown: watch::Receiver<bool>,
        map: F,
    ) -> JoinHandle<()>
    where
        F: Fn(&StoreEvent) -> Vec<R::Key> + Send + 'static,
    {
        let queue = self.queue.clone();
        let name = self.name;
        let resync = self.resync.as_ref().map(|(_, f)| Arc::clone(f));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => {
                            for key in map(&event) {
                                queue.add(key);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(controller = name, skipped, "watch lagged");
                            if let Some(resync) = &resync {
                                for key in resync() {
                                    queue.add(key);
                                }
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    ///
    /// Keys still queued at shutdown are dropped; keys being processed finish.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(controller = self.name, "waiting for caches to sync");
        if !wait_for_caches(&mut self.caches, &mut shutdown).await {
            self.queue.shut_down();
            return;
        }

        info!(controller = self.name, workers = self.workers, "starting workers");
        let mut handles = Vec::with_capacity(self.workers + 1);
        for worker in 0..self.workers {
            let queue = self.queue.clone();
            let reconciler = Arc::clone(&self.reconciler);
            let name = self.name;
            handles.push(tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    process(name, reconciler.as_ref(), &queue, key).await;
                }
                debug!(controller = name, worker, "worker stopped");
            }));
        }

        let resync_task = self.resync.take().map(|(period, keys)| {
            let queue = self.queue.clone();
            tokio::spawn(async move {
                loop {
                    for key in keys() {
                        queue.add(key);
                    }
                    tokio::time::sleep(period).await;
                    if queue.is_shutting_down() {
                        break;
                    }
                }
            })
        });

        wait_for_shutdown(&mut shutdown).await;
        info!(controller = self.name, "shutting down");
        self.queue.shut_down();
        if let Some(task) = resync_task {
            task.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn process<R: Reconciler>(
    name: &'static str,
    reconciler: &R,
    queue: &WorkQueue<R::Key>,
    key: R::Key,
) {
    match reconciler.handle(&key).await {
        Ok(None) => queue.forget(&key),
        Ok(Some(after)) => {
            queue.forget(&key);
            debug!(controller = name, %key, ?after, "requeue");
            queue.add_after(key.clone(), after);
        }
        Err(e) if e.is_conflict() => {
            debug!(controller = name, %key, error = %e, "write conflict, retrying");
            queue.add_rate_limited(key.clone());
        }
        Err(e) => {
            error!(controller = name, %key, error = %e, "reconcile failed");
            queue.add_rate_limited(key.clone());
        }
    }
    queue.done(&key);
}

/// False if shutdown arrived first.
async fn wait_for_caches(
    caches: &mut [watch::Receiver<bool>],
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    for cache in caches.iter_mut() {
        loop {
            if *shutdown.borrow() {
                return false;
            }
            if *cache.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = cache.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
    true
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
