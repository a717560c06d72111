//! Per-resource requeue delays.
//!
//! Each key starts at the minimum delay, doubles on every failed attempt and
//! snaps back to the minimum on success. Keys are dropped entirely once their
//! resource reaches terminal success. The tracker is owned by the reconciler
//! context rather than living in a process-wide static, so tests get isolated
//! instances.

use std::time::Duration;

use dashmap::DashMap;

use crate::crd::ResourceKey;

/// Default seed delay for a key seen for the first time
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(1);

/// Concurrent map of resource key to current requeue delay.
///
/// Every operation touches a single shard of the map and never awaits, so
/// workers reconciling different keys only contend for the shard lock.
#[derive(Debug)]
pub struct BackoffTracker {
    delays: DashMap<ResourceKey, Duration>,
    min_delay: Duration,
    max_delay: Option<Duration>,
}

impl Default for BackoffTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_DELAY)
    }
}

impl BackoffTracker {
    /// Create an uncapped tracker seeded at `min_delay`
    pub fn new(min_delay: Duration) -> Self {
        Self {
            delays: DashMap::new(),
            min_delay,
            max_delay: None,
        }
    }

    /// Clamp doubled delays to `max_delay`
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay.max(self.min_delay));
        self
    }

    /// Delay new and freshly reset keys start at
    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Current delay for `key`, seeding it at the minimum if unseen
    pub fn get_or_init(&self, key: &ResourceKey) -> Duration {
        *self
            .delays
            .entry(key.clone())
            .or_insert(self.min_delay)
            .value()
    }

    /// Current delay for `key` without seeding it
    pub fn get(&self, key: &ResourceKey) -> Option<Duration> {
        self.delays.get(key).map(|d| *d.value())
    }

    /// Double the delay for `key` and return the new value.
    ///
    /// An unseen key is seeded first, so the result is at least `2 * min`.
    pub fn double(&self, key: &ResourceKey) -> Duration {
        let mut entry = self.delays.entry(key.clone()).or_insert(self.min_delay);
        let doubled = entry.saturating_mul(2);
        *entry = match self.max_delay {
            Some(max) => doubled.min(max),
            None => doubled,
        };
        *entry
    }

    /// Reset `key` to the minimum delay
    pub fn reset(&self, key: &ResourceKey) {
        self.delays.insert(key.clone(), self.min_delay);
    }

    /// Remove `key` entirely
    pub fn forget(&self, key: &ResourceKey) {
        self.delays.remove(key);
    }

    /// Whether the tracker currently holds an entry for `key`
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.delays.contains_key(key)
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.delays.len()
    }

    /// True when no key is tracked
    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }
}
