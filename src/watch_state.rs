// src/watch_state.rs
use crate::config::WatchSpec;
use crate::consul_integration::ServiceEntry;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Identity of a configured watch: its position in configuration order.
///
/// Two watches with identical specs still get distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub usize);

/// Merged entries per backend group
pub type BackendServers = BTreeMap<String, Vec<ServiceEntry>>;

/// State shared by every watcher and the aggregator.
///
/// `membership` is fixed at construction, before any watcher runs.
/// `results` holds one slot per watch; `None` until that watch first reports.
#[derive(Debug)]
pub struct WatchState {
    results: Mutex<Vec<Option<Vec<ServiceEntry>>>>,
    membership: BTreeMap<String, Vec<WatchId>>,
    changed: Notify,
    stop: CancellationToken,
}

impl WatchState {
    pub fn new(watches: &[WatchSpec], stop: CancellationToken) -> Self {
        let mut membership: BTreeMap<String, Vec<WatchId>> = BTreeMap::new();
        for (idx, watch) in watches.iter().enumerate() {
            membership.entry(watch.backend.clone()).or_default().push(WatchId(idx));
        }
        WatchState {
            results: Mutex::new(vec![None; watches.len()]),
            membership,
            changed: Notify::new(),
            stop,
        }
    }

    /// Store a successful query result. Returns whether the aggregator was
    /// signalled, i.e. this was the first report or the entries changed.
    pub fn record_success(&self, id: WatchId, entries: Vec<ServiceEntry>) -> bool {
        let mut results = self.results.lock();
        let slot = &mut results[id.0];
        if slot.as_ref() == Some(&entries) {
            return false;
        }
        *slot = Some(entries);
        self.changed.notify_one();
        true
    }

    /// Note a failed query. Only the first report of a watch is recorded
    /// (as an empty list) so readiness is reachable while a watch keeps failing.
    pub fn record_failure(&self, id: WatchId) -> bool {
        let mut results = self.results.lock();
        let slot = &mut results[id.0];
        if slot.is_some() {
            return false;
        }
        *slot = Some(Vec::new());
        self.changed.notify_one();
        true
    }

    /// Latest entries stored for a watch, `None` until it first reports.
    /// Not used by the render path, which goes through `snapshot`.
    pub fn entries(&self, id: WatchId) -> Option<Vec<ServiceEntry>> {
        self.results.lock().get(id.0).cloned().flatten()
    }

    /// Number of watches that have reported at least once (readiness progress).
    pub fn reported(&self) -> usize {
        self.results.lock().iter().filter(|r| r.is_some()).count()
    }

    /// Number of configured watches across all backends.
    pub fn total(&self) -> usize {
        self.membership.values().map(Vec::len).sum()
    }

    /// Merge entries per backend in configuration order, or `None` while
    /// any watch has yet to report.
    pub fn snapshot(&self) -> Option<BackendServers> {
        let results = self.results.lock();
        if results.iter().any(Option::is_none) {
            return None;
        }
        let merged = self
            .membership
            .iter()
            .map(|(backend, ids)| {
                let all = ids
                    .iter()
                    .filter_map(|id| results[id.0].as_deref())
                    .flatten()
                    .cloned()
                    .collect();
                (backend.clone(), all)
            })
            .collect();
        Some(merged)
    }

    /// Wait for the next change signal. Signals raised while nobody was
    /// waiting collapse into a single wake-up.
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}
