// src/aggregator.rs
use crate::render::RenderPipeline;
use crate::watch_state::WatchState;
use log::{debug, error, info};
use std::io::Write;
use std::sync::Arc;

/// Result of handling one change signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refresh {
    /// Some watch has not reported yet
    NotReady,
    /// Output written (and reload attempted)
    Rendered,
    /// The cycle aborted; the next change retries
    Failed,
    /// Stop the whole run (dry run finished)
    Exit,
}

/// Turns change signals into render cycles. Only one cycle ever runs at a time.
pub struct Aggregator {
    state: Arc<WatchState>,
    pipeline: RenderPipeline,
    dry_run: Option<Box<dyn Write + Send>>,
}

impl Aggregator {
    pub fn new(state: Arc<WatchState>, pipeline: RenderPipeline) -> Self {
        Aggregator { state, pipeline, dry_run: None }
    }

    /// Print rendered output to `out` instead of writing the file, then exit.
    pub fn dry_run(mut self, out: Box<dyn Write + Send>) -> Self {
        self.dry_run = Some(out);
        self
    }

    /// Handle change signals until stopped or a dry run completes.
    pub async fn run(mut self) {
        let state = self.state.clone();
        let stop = state.stop_token().clone();
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return,
                _ = state.changed() => {
                    if self.refresh().await == Refresh::Exit {
                        return;
                    }
                }
            }
        }
    }

    pub async fn refresh(&mut self) -> Refresh {
        // Ignore updates until every watch has reported
        let servers = match self.state.snapshot() {
            Some(servers) => servers,
            None => {
                debug!("Waiting for watches: {}/{} reported", self.state.reported(), self.state.total());
                return Refresh::NotReady;
            }
        };

        let output = match self.pipeline.render(&servers).await {
            Ok(output) => output,
            Err(e) => {
                error!("{}", e);
                // run-once watchers won't signal again
                return if self.dry_run.is_some() { Refresh::Exit } else { Refresh::Failed };
            }
        };

        if let Some(out) = self.dry_run.as_mut() {
            if let Err(e) = writeln!(out, "{}", output).and_then(|_| out.flush()) {
                error!("Failed to emit dry run output: {}", e);
            }
            return Refresh::Exit;
        }

        if let Err(e) = self.pipeline.write(&output).await {
            error!("{}", e);
            return Refresh::Failed;
        }
        info!("Updated configuration file at {}", self.pipeline.path.display());

        if let Some(reload) = &self.pipeline.reload {
            match reload.reload().await {
                Ok(()) => info!("Completed reload"),
                Err(e) => error!("Failed to reload: {}", e),
            }
        }
        Refresh::Rendered
    }
}
