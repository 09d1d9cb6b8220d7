// src/consul_integration.rs
//
// Consul service discovery: blocking health queries over the HTTP API.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Agent address used when the configuration leaves it blank.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:8500";

/// Consul may hold a blocking query open for up to wait/16 past the
/// requested wait, so the HTTP timeout needs headroom on top of it.
const TIMEOUT_MARGIN: Duration = Duration::from_secs(15);

const INDEX_HEADER: &str = "X-Consul-Index";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to build consul client: {0}")]
    Init(#[source] reqwest::Error),

    #[error("request to consul failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("consul returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("consul response is missing a valid X-Consul-Index header")]
    MissingIndex,

    #[error("discovery backend unavailable: {0}")]
    Unavailable(String),
}

/// One healthy service instance as returned by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub node: String,
    pub address: String,
    pub service_id: String,
    pub port: u16,
}

/// Parameters of a single blocking health query
#[derive(Debug, Clone, Copy)]
pub struct ServiceQuery<'a> {
    pub service: &'a str,
    pub tag: Option<&'a str>,
    pub datacenter: Option<&'a str>,
    /// Resumption token from the previous successful response
    pub wait_index: Option<u64>,
    pub wait_time: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub entries: Vec<ServiceEntry>,
    pub last_index: u64,
}

/// A discovery backend that supports blocking queries.
///
/// `healthy_service` must block for up to `wait_time` when `wait_index`
/// matches the backend's current state, and return promptly on change.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Cheap reachability check; returns the agent's node name.
    async fn probe(&self) -> Result<String, DiscoveryError>;

    async fn healthy_service(&self, query: &ServiceQuery<'_>) -> Result<QueryResult, DiscoveryError>;
}

/// Talks to a Consul agent over its HTTP API
#[derive(Debug, Clone)]
pub struct ConsulClient {
    base_url: String,
    http: Client,
}

impl ConsulClient {
    pub fn new(address: Option<&str>) -> Result<Self, DiscoveryError> {
        let address = address.filter(|a| !a.is_empty()).unwrap_or(DEFAULT_ADDRESS);
        let http = Client::builder().build().map_err(DiscoveryError::Init)?;
        Ok(ConsulClient { base_url: base_url(address), http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Discovery for ConsulClient {
    async fn probe(&self) -> Result<String, DiscoveryError> {
        let url = format!("{}/v1/agent/self", self.base_url);
        let res = check_status(self.http.get(url).send().await?).await?;
        let agent: AgentSelf = res.json().await?;
        Ok(agent.config.node_name)
    }

    async fn healthy_service(&self, query: &ServiceQuery<'_>) -> Result<QueryResult, DiscoveryError> {
        let url = format!("{}/v1/health/service/{}", self.base_url, query.service);
        let mut params: Vec<(&str, String)> = vec![("passing", "1".into())];
        if let Some(tag) = query.tag {
            params.push(("tag", tag.to_string()));
        }
        if let Some(dc) = query.datacenter {
            params.push(("dc", dc.to_string()));
        }
        if let Some(index) = query.wait_index {
            params.push(("index", index.to_string()));
            params.push(("wait", format!("{}s", query.wait_time.as_secs().max(1))));
        }

        let res = self
            .http
            .get(url)
            .query(&params)
            .timeout(request_timeout(query.wait_time))
            .send()
            .await?;
        let res = check_status(res).await?;
        let last_index = res
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(DiscoveryError::MissingIndex)?;
        let raw: Vec<HealthEntry> = res.json().await?;
        Ok(QueryResult {
            entries: raw.into_iter().map(ServiceEntry::from).collect(),
            last_index,
        })
    }
}

async fn check_status(res: reqwest::Response) -> Result<reqwest::Response, DiscoveryError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(DiscoveryError::Status { status, body: body.trim().to_string() })
}

fn request_timeout(wait_time: Duration) -> Duration {
    wait_time.saturating_add(TIMEOUT_MARGIN)
}

fn base_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentSelf {
    config: AgentConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentConfig {
    node_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: HealthNode,
    service: HealthService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    node: String,
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    port: u16,
}

impl From<HealthEntry> for ServiceEntry {
    fn from(e: HealthEntry) -> Self {
        ServiceEntry {
            node: e.node.node,
            address: e.node.address,
            service_id: e.service.id,
            port: e.service.port,
        }
    }
}
