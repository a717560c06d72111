//! Deduplicating work queue with single-flight per key
//!
//! A key is in at most one of three places: waiting in the queue, being
//! processed by a worker, or both marked dirty and processing (re-added while
//! a worker held it). A dirty key that is processing is pushed back onto the
//! queue only when its worker calls [`WorkQueue::done`], so two workers never
//! hold the same key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

impl<K> Default for State<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            shutting_down: false,
        }
    }
}

/// A pending delayed add
struct Scheduled {
    generation: u64,
    cancel: CancellationToken,
}

/// Work queue shared by the watch feed and the worker pool
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    // Latest delayed add per key. Replacing or forgetting one cancels its
    // timer; a timer that already fired finds a newer generation and does
    // nothing.
    scheduled: Mutex<HashMap<K, Scheduled>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            scheduled: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Mark `key` as needing work.
    ///
    /// A key already waiting is not queued twice. A key being processed is
    /// queued again once its worker calls [`WorkQueue::done`].
    pub fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Add `key` after `delay`, replacing any earlier pending delayed add
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.forget(&key);
            self.add(key);
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = self.shutdown.child_token();
        let replaced = self.scheduled.lock().insert(
            key.clone(),
            Scheduled {
                generation,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = replaced {
            previous.cancel.cancel();
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let current = {
                        let mut scheduled = queue.scheduled.lock();
                        if scheduled.get(&key).is_some_and(|s| s.generation == generation) {
                            scheduled.remove(&key);
                            true
                        } else {
                            false
                        }
                    };
                    if current {
                        queue.add(key);
                    }
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    /// Drop any pending delayed add for `key`
    pub fn forget(&self, key: &K) {
        if let Some(previous) = self.scheduled.lock().remove(key) {
            previous.cancel.cancel();
        }
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release `key` after processing; requeues it if it was re-added meanwhile
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and cancel pending delayed adds
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    /// True once [`WorkQueue::shutdown`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True when no key is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys with a pending delayed add
    pub fn pending_delayed(&self) -> usize {
        self.scheduled.lock().len()
    }
}
