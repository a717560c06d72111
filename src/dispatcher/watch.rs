//! Feed UnregisterVolume watch events into the work queue
//!
//! Only spec changes enqueue work. The controller's own status writes do not
//! bump `metadata.generation`, so they are filtered out here and a failed
//! request waits for its backoff delay instead of being retried immediately by
//! the event its failure status produced.
//!
//! The filter outlives watch restarts. A relist re-admits only requests whose
//! generation or uid changed while the stream was down, so a failing request
//! keeps waiting for its backoff delay; keys missing from the relist are
//! dropped once it completes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::watcher::{self, Event};
use kube::Api;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::WorkQueue;
use crate::crd::{ResourceKey, UnregisterVolume};

const WATCH_ERROR_PAUSE: Duration = Duration::from_secs(5);

/// Identity and generation of a request as last admitted
#[derive(Clone, Debug, PartialEq, Eq)]
struct Observed {
    uid: Option<String>,
    generation: Option<i64>,
}

/// Tracks the last generation enqueued per key
#[derive(Debug, Default)]
pub struct GenerationFilter {
    seen: HashMap<ResourceKey, Observed>,
    relisted: Option<HashSet<ResourceKey>>,
}

impl GenerationFilter {
    /// Decide whether `request` needs a reconciliation, recording its generation
    pub fn admit(&mut self, request: &UnregisterVolume) -> bool {
        let key = request.key();
        let observed = Observed {
            uid: request.metadata.uid.clone(),
            generation: request.metadata.generation,
        };
        if let Some(listed) = self.relisted.as_mut() {
            listed.insert(key.clone());
        }
        let changed = self.seen.get(&key) != Some(&observed);
        self.seen.insert(key, observed);
        changed && !request.is_unregistered()
    }

    /// Drop state for a deleted request
    pub fn remove(&mut self, request: &UnregisterVolume) {
        self.seen.remove(&request.key());
    }

    /// A relist started; track which keys it still contains
    pub fn begin_relist(&mut self) {
        self.relisted = Some(HashSet::new());
    }

    /// The relist finished; forget keys it no longer contains
    pub fn finish_relist(&mut self) {
        if let Some(listed) = self.relisted.take() {
            let before = self.seen.len();
            self.seen.retain(|key, _| listed.contains(key));
            debug!(dropped = before - self.seen.len(), "relist complete");
        }
    }
}

/// Apply one watcher event to the queue
pub fn handle_event(
    event: Result<Event<UnregisterVolume>, watcher::Error>,
    filter: &mut GenerationFilter,
    queue: &Arc<WorkQueue<ResourceKey>>,
) -> bool {
    match event {
        Ok(Event::Apply(request)) | Ok(Event::InitApply(request)) => {
            if filter.admit(&request) {
                debug!(request = %request.key(), "enqueue");
                queue.add(request.key());
            }
            true
        }
        Ok(Event::Delete(request)) => {
            debug!(request = %request.key(), "request deleted");
            filter.remove(&request);
            true
        }
        Ok(Event::Init) => {
            filter.begin_relist();
            true
        }
        Ok(Event::InitDone) => {
            filter.finish_relist();
            true
        }
        Err(e) => {
            warn!(error = %e, "watcher error, will retry");
            false
        }
    }
}

/// Watch `api` and enqueue changed requests until `shutdown` fires
pub async fn feed(
    api: Api<UnregisterVolume>,
    queue: Arc<WorkQueue<ResourceKey>>,
    shutdown: CancellationToken,
) {
    let stream = watcher::watcher(api, watcher::Config::default());
    let mut stream = std::pin::pin!(stream);
    let mut filter = GenerationFilter::default();

    info!("watching UnregisterVolume resources");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => {
                let Some(event) = next else { break };
                if !handle_event(event, &mut filter, &queue) {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(WATCH_ERROR_PAUSE) => {}
                    }
                }
            }
        }
    }
    info!("UnregisterVolume watch stopped");
}
