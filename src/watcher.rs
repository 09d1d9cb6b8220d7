// src/watcher.rs
use crate::backoff::BackoffPolicy;
use crate::config::WatchSpec;
use crate::consul_integration::{Discovery, ServiceEntry, ServiceQuery};
use crate::watch_state::{WatchId, WatchState};
use log::{debug, error};
use std::{sync::Arc, time::Duration};

/// Long-poll loop for a single watch.
pub struct Watcher<D: Discovery> {
    id: WatchId,
    spec: WatchSpec,
    client: Arc<D>,
    state: Arc<WatchState>,
    backoff: BackoffPolicy,
    wait_time: Duration,
    run_once: bool,
}

impl<D: Discovery> Watcher<D> {
    pub fn new(id: WatchId, spec: WatchSpec, client: Arc<D>, state: Arc<WatchState>) -> Self {
        Watcher {
            id,
            spec,
            client,
            state,
            backoff: BackoffPolicy::default(),
            wait_time: crate::config::DEFAULT_WAIT_TIME,
            run_once: false,
        }
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    /// Do a single query and return, whatever the outcome.
    pub fn run_once(mut self, run_once: bool) -> Self {
        self.run_once = run_once;
        self
    }

    pub async fn run(self) {
        let stop = self.state.stop_token().clone();
        let mut failures = 0u32;
        let mut wait_index: Option<u64> = None;

        loop {
            if stop.is_cancelled() {
                return;
            }

            let query = ServiceQuery {
                service: &self.spec.service,
                tag: self.spec.tag.as_deref(),
                datacenter: self.spec.datacenter.as_deref(),
                wait_index,
                wait_time: self.wait_time,
            };
            let result = tokio::select! {
                biased;
                _ = stop.cancelled() => return,
                r = self.client.healthy_service(&query) => r,
            };

            let failed = match result {
                Ok(res) => {
                    let entries = fixup_ports(res.entries, self.spec.port);
                    if self.state.record_success(self.id, entries) && !self.run_once {
                        debug!("Updated nodes for {}", self.spec);
                    }
                    failures = 0;
                    wait_index = next_wait_index(wait_index, res.last_index);
                    false
                }
                Err(e) => {
                    error!("Failed to fetch service nodes for {}: {}", self.spec, e);
                    self.state.record_failure(self.id);
                    true
                }
            };

            if self.run_once {
                return;
            }

            if failed {
                failures = self.backoff.next_failure(failures);
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(self.backoff.delay(failures)) => {}
                }
            }
        }
    }
}

/// Resumption token for the next query. A rewound index means the backend
/// reset, so start over; a zero index is clamped to 1 so the next query
/// still blocks instead of spinning.
fn next_wait_index(prev: Option<u64>, last_index: u64) -> Option<u64> {
    let index = last_index.max(1);
    match prev {
        Some(prev) if index < prev => None,
        _ => Some(index),
    }
}

/// Fill in the configured port on entries that report none.
pub fn fixup_ports(mut entries: Vec<ServiceEntry>, port: Option<u16>) -> Vec<ServiceEntry> {
    if let Some(port) = port {
        for entry in entries.iter_mut().filter(|e| e.port == 0) {
            entry.port = port;
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(port: u16) -> ServiceEntry {
        ServiceEntry { node: "n".into(), address: "10.0.0.1".into(), service_id: "s".into(), port }
    }

    #[test]
    fn override_applies_only_to_unset_ports() {
        let out = fixup_ports(vec![entry(0), entry(9000)], Some(8080));
        assert_eq!(out.iter().map(|e| e.port).collect::<Vec<_>>(), vec![8080, 9000]);
    }

    #[test]
    fn zero_index_still_blocks() {
        assert_eq!(next_wait_index(None, 0), Some(1));
        assert_eq!(next_wait_index(Some(1), 0), Some(1));
        assert_eq!(next_wait_index(Some(1), 1), Some(1));
        assert_eq!(next_wait_index(Some(50), 10), None);
        assert_eq!(next_wait_index(Some(10), 50), Some(50));
    }

    #[test]
    fn no_override_leaves_zero() {
        let out = fixup_ports(vec![entry(0)], None);
        assert_eq!(out[0].port, 0);
    }
}
