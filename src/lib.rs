// src/lib.rs

// Keeps a rendered config file in sync with healthy service instances in Consul.
pub mod aggregator;
pub mod backoff;
pub mod config;
pub mod consul_integration;
pub mod render;
pub mod supervisor;
pub mod watch_state;
pub mod watcher;

pub use aggregator::{Aggregator, Refresh};
pub use backoff::BackoffPolicy;
pub use config::{Cli, Config, ConfigError, WatchSpec};
pub use consul_integration::{ConsulClient, Discovery, DiscoveryError, QueryResult, ServiceEntry, ServiceQuery};
pub use render::{ReloadAction, ReloadError, RenderError, RenderPipeline, ShellReload};
pub use supervisor::{Supervisor, WatchError, WatchHandle, WatchSettings};
pub use watch_state::{BackendServers, WatchId, WatchState};
pub use watcher::Watcher;
