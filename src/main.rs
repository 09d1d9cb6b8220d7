use anyhow::Context;
use clap::Parser;
use consul_sync::{Cli, Config, ConsulClient, RenderPipeline, ShellReload, Supervisor, WatchSettings};
use log::{error, info};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 1) Flags + optional YAML file
    let config = Config::load(Cli::parse()).context("invalid configuration")?;
    let watches = config.watches()?;

    // 2) Consul client; reachability is checked once the run starts
    let client = match ConsulClient::new(config.address.as_deref()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to initialize consul client: {}", e);
            return Err(e.into());
        }
    };

    // 3) Render pipeline
    let template = config.template.clone().unwrap_or_default();
    let mut pipeline = RenderPipeline::new(template, config.path.clone().unwrap_or_default());
    if let Some(cmd) = config.reload_command.as_deref().filter(|c| !c.trim().is_empty()) {
        pipeline = pipeline.with_reload(Arc::new(ShellReload::new(cmd)));
    }

    let settings = WatchSettings {
        wait_time: config.wait_time(),
        backoff: config.backoff,
        dry_run: config.dry_run,
    };
    let handle = Supervisor::new(client, watches, pipeline, settings).spawn();

    // 4) Run until Ctrl-C or a dry run completes
    tokio::select! {
        _ = handle.finished() => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
            handle.stop();
        }
    }
    handle.wait().await?;
    Ok(())
}
