#![allow(dead_code)]

use async_trait::async_trait;
use consul_sync::{Discovery, DiscoveryError, QueryResult, ReloadAction, ReloadError, ServiceEntry, ServiceQuery};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub fn entry(node: &str, address: &str, id: &str, port: u16) -> ServiceEntry {
    ServiceEntry { node: node.into(), address: address.into(), service_id: id.into(), port }
}

pub fn ok(entries: Vec<ServiceEntry>, last_index: u64) -> Result<QueryResult, DiscoveryError> {
    Ok(QueryResult { entries, last_index })
}

pub fn fail(msg: &str) -> Result<QueryResult, DiscoveryError> {
    Err(DiscoveryError::Unavailable(msg.into()))
}

#[derive(Debug, Clone)]
pub struct SeenQuery {
    pub key: String,
    pub wait_index: Option<u64>,
    pub at: Instant,
}

/// Discovery backend answering from per-service scripts. Once a script runs
/// dry the query blocks forever, like a long poll that never sees a change.
#[derive(Default)]
pub struct ScriptedDiscovery {
    probe_error: Option<String>,
    scripts: Mutex<HashMap<String, VecDeque<Result<QueryResult, DiscoveryError>>>>,
    seen: Mutex<Vec<SeenQuery>>,
}

impl ScriptedDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable(msg: &str) -> Self {
        ScriptedDiscovery { probe_error: Some(msg.into()), ..Self::default() }
    }

    /// Queue responses for `key`, which is `service` or `tag.service`.
    pub fn script(self, key: &str, responses: Vec<Result<QueryResult, DiscoveryError>>) -> Self {
        self.scripts.lock().entry(key.to_string()).or_default().extend(responses);
        self
    }

    pub fn seen(&self) -> Vec<SeenQuery> {
        self.seen.lock().clone()
    }

    pub fn query_count(&self) -> usize {
        self.seen.lock().len()
    }

    /// Poll until at least `n` queries have been issued.
    pub async fn wait_for_queries(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(600), async {
            while self.query_count() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queries were not issued in time");
    }
}

#[async_trait]
impl Discovery for ScriptedDiscovery {
    async fn probe(&self) -> Result<String, DiscoveryError> {
        match &self.probe_error {
            Some(msg) => Err(DiscoveryError::Unavailable(msg.clone())),
            None => Ok("test-agent".into()),
        }
    }

    async fn healthy_service(&self, query: &ServiceQuery<'_>) -> Result<QueryResult, DiscoveryError> {
        let key = match query.tag {
            Some(tag) => format!("{}.{}", tag, query.service),
            None => query.service.to_string(),
        };
        self.seen.lock().push(SeenQuery { key: key.clone(), wait_index: query.wait_index, at: Instant::now() });
        let next = self.scripts.lock().get_mut(&key).and_then(VecDeque::pop_front);
        match next {
            Some(res) => res,
            None => std::future::pending().await,
        }
    }
}

/// Reload action that counts invocations.
#[derive(Default)]
pub struct RecordingReload {
    calls: AtomicUsize,
    fail: bool,
    reloaded: Notify,
}

impl RecordingReload {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(RecordingReload { fail: true, ..Self::default() })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn wait_reloaded(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.reloaded.notified())
            .await
            .expect("reload was not invoked in time");
    }
}

#[async_trait]
impl ReloadAction for RecordingReload {
    async fn reload(&self) -> Result<(), ReloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reloaded.notify_one();
        if self.fail {
            Err(ReloadError::Other("reload refused".into()))
        } else {
            Ok(())
        }
    }
}

/// In-memory sink for dry-run output
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub const WEB_POOL_TEMPLATE: &str = "backend web_pool\n{% for s in web_pool %}    {{ s }}\n{% endfor %}";
