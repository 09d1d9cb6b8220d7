// src/supervisor.rs
use crate::aggregator::Aggregator;
use crate::backoff::BackoffPolicy;
use crate::config::{WatchSpec, DEFAULT_WAIT_TIME};
use crate::consul_integration::{Discovery, DiscoveryError};
use crate::render::RenderPipeline;
use crate::watch_state::{WatchId, WatchState};
use crate::watcher::Watcher;
use futures::future::join_all;
use log::{error, info};
use std::{io::Write, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to contact consul agent: {0}")]
    Connect(#[source] DiscoveryError),

    #[error("watch task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Knobs shared by every watcher
#[derive(Debug, Clone, Copy)]
pub struct WatchSettings {
    pub wait_time: Duration,
    pub backoff: BackoffPolicy,
    pub dry_run: bool,
}

impl Default for WatchSettings {
    fn default() -> Self {
        WatchSettings { wait_time: DEFAULT_WAIT_TIME, backoff: BackoffPolicy::default(), dry_run: false }
    }
}

/// Wires watches, the shared state and the aggregator together.
pub struct Supervisor<D: Discovery> {
    client: Arc<D>,
    watches: Vec<WatchSpec>,
    pipeline: RenderPipeline,
    settings: WatchSettings,
    dry_run_out: Option<Box<dyn Write + Send>>,
}

impl<D: Discovery> Supervisor<D> {
    pub fn new(client: Arc<D>, watches: Vec<WatchSpec>, pipeline: RenderPipeline, settings: WatchSettings) -> Self {
        Supervisor { client, watches, pipeline, settings, dry_run_out: None }
    }

    /// Destination of dry-run output; stdout unless set.
    pub fn dry_run_output(mut self, out: Box<dyn Write + Send>) -> Self {
        self.dry_run_out = Some(out);
        self
    }

    /// Start the run in the background.
    pub fn spawn(self) -> WatchHandle {
        let stop = CancellationToken::new();
        let done = CancellationToken::new();
        let task = tokio::spawn(self.run(stop.clone(), done.clone()));
        WatchHandle { stop, done, task }
    }

    async fn run(self, stop: CancellationToken, done: CancellationToken) -> Result<(), WatchError> {
        let _done = done.drop_guard();

        if let Err(e) = self.client.probe().await {
            error!("Failed to contact consul agent: {}", e);
            return Err(WatchError::Connect(e));
        }

        // Membership is complete before the first watcher starts
        let state = Arc::new(WatchState::new(&self.watches, stop.clone()));

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.watches.len());
        for (idx, spec) in self.watches.into_iter().enumerate() {
            let watcher = Watcher::new(WatchId(idx), spec, self.client.clone(), state.clone())
                .backoff(self.settings.backoff)
                .wait_time(self.settings.wait_time)
                .run_once(self.settings.dry_run);
            handles.push(tokio::spawn(watcher.run()));
        }
        info!("Watching {} services", state.total());

        let mut aggregator = Aggregator::new(state, self.pipeline);
        if self.settings.dry_run {
            let out = self.dry_run_out.unwrap_or_else(|| Box::new(std::io::stdout()));
            aggregator = aggregator.dry_run(out);
        }
        aggregator.run().await;

        stop.cancel();
        for res in join_all(handles).await {
            res?;
        }
        Ok(())
    }
}

/// Control over a running supervisor
#[derive(Debug)]
pub struct WatchHandle {
    stop: CancellationToken,
    done: CancellationToken,
    task: JoinHandle<Result<(), WatchError>>,
}

impl WatchHandle {
    /// Ask every watcher and the aggregator to stop. Safe to call repeatedly.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Resolves once the run has fully completed.
    pub async fn finished(&self) {
        self.done.cancelled().await
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    pub async fn wait(self) -> Result<(), WatchError> {
        self.task.await?
    }
}
