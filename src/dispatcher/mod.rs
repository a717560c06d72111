//! Bounded-concurrency execution of reconciliations
//!
//! A fixed pool of workers drains a [`WorkQueue`]. Each worker runs one
//! reconciliation to completion before taking the next key, so the pool size
//! caps how many slow API calls can be in flight at once. The queue guarantees
//! that one key is never held by two workers.
//!
//! Reconciliations run on their own task; a panic inside one is caught as a
//! `JoinError`, logged, and the key is requeued. The worker survives.

mod queue;
pub mod watch;

pub use queue::WorkQueue;

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default number of concurrent reconciliations
pub const DEFAULT_MAX_WORKERS: usize = 40;

/// Largest accepted worker count
pub const MAX_WORKERS_LIMIT: usize = 1024;

/// Requeue delay after a reconciliation task panicked
pub const PANIC_REQUEUE_DELAY: Duration = Duration::from_secs(5);

/// Result of one reconciliation attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing more to do for this key until it changes again
    Done,
    /// Try again after the given delay
    RequeueAfter(Duration),
}

/// Worker pool settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Number of concurrent reconciliations
    pub max_workers: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

impl DispatcherConfig {
    /// Build a config from a requested worker count.
    ///
    /// Zero or anything above [`MAX_WORKERS_LIMIT`] falls back to
    /// [`DEFAULT_MAX_WORKERS`] with a warning.
    pub fn with_max_workers(requested: usize) -> Self {
        if requested == 0 || requested > MAX_WORKERS_LIMIT {
            warn!(
                requested,
                default = DEFAULT_MAX_WORKERS,
                "max workers out of range 1..={}, using default",
                MAX_WORKERS_LIMIT
            );
            return Self::default();
        }
        Self {
            max_workers: requested,
        }
    }
}

/// Runs reconciliations from a shared queue on a fixed worker pool
pub struct Dispatcher<K> {
    queue: Arc<WorkQueue<K>>,
    config: DispatcherConfig,
}

impl<K> Dispatcher<K>
where
    K: Clone + Eq + Hash + Send + Sync + fmt::Display + 'static,
{
    /// Create a dispatcher with an empty queue
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            queue: Arc::new(WorkQueue::new()),
            config,
        }
    }

    /// Queue handle for feeding keys in
    pub fn queue(&self) -> Arc<WorkQueue<K>> {
        Arc::clone(&self.queue)
    }

    /// Run workers until `shutdown` fires, then wait for in-flight work
    pub async fn run<F, Fut>(self, reconcile: F, shutdown: CancellationToken)
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let reconcile = Arc::new(reconcile);
        let mut workers = JoinSet::new();

        info!(workers = self.config.max_workers, "starting dispatcher");
        for id in 0..self.config.max_workers {
            workers.spawn(worker(id, Arc::clone(&self.queue), Arc::clone(&reconcile)));
        }

        shutdown.cancelled().await;
        info!("dispatcher shutting down, waiting for in-flight reconciliations");
        self.queue.shutdown();

        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker exited abnormally");
            }
        }
        info!("dispatcher stopped");
    }
}

async fn worker<K, F, Fut>(id: usize, queue: Arc<WorkQueue<K>>, reconcile: Arc<F>)
where
    K: Clone + Eq + Hash + Send + Sync + fmt::Display + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    while let Some(key) = queue.get().await {
        debug!(worker = id, key = %key, "processing");

        let outcome = match tokio::spawn(reconcile(key.clone())).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(worker = id, key = %key, error = %e, "reconciliation task failed");
                Outcome::RequeueAfter(PANIC_REQUEUE_DELAY)
            }
        };

        queue.done(&key);
        match outcome {
            Outcome::Done => queue.forget(&key),
            Outcome::RequeueAfter(delay) => {
                debug!(key = %key, delay_ms = delay.as_millis() as u64, "requeue");
                queue.add_after(key, delay);
            }
        }
    }
    debug!(worker = id, "worker stopped");
}
