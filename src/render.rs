// src/render.rs
//
// Everything between a merged snapshot and a reloaded proxy: server-line
// formatting, templating, writing the output file and running the reload hook.

use crate::watch_state::BackendServers;
use async_trait::async_trait;
use minijinja::{Environment, UndefinedBehavior};
use std::{
    collections::BTreeMap,
    io,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    process::ExitStatus,
    sync::Arc,
};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to read template {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("failed to parse the template: {0}")]
    Parse(#[source] minijinja::Error),

    #[error("failed to generate the template: {0}")]
    Render(#[source] minijinja::Error),

    #[error("failed to write config file {path}: {source}")]
    Write { path: String, source: io::Error },
}

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("failed to start reload command: {0}")]
    Spawn(#[from] io::Error),

    #[error("reload command exited with {0}")]
    Exit(ExitStatus),

    #[error("{0}")]
    Other(String),
}

/// Action run after a new configuration has been written.
#[async_trait]
pub trait ReloadAction: Send + Sync {
    async fn reload(&self) -> Result<(), ReloadError>;
}

/// Runs a command line through the platform shell, inheriting stdio.
#[derive(Debug, Clone)]
pub struct ShellReload {
    command: String,
}

impl ShellReload {
    pub fn new(command: impl Into<String>) -> Self {
        ShellReload { command: command.into() }
    }
}

#[async_trait]
impl ReloadAction for ShellReload {
    async fn reload(&self) -> Result<(), ReloadError> {
        let (shell, flag) = if cfg!(windows) { ("cmd", "/C") } else { ("/bin/sh", "-c") };
        let status = Command::new(shell).arg(flag).arg(&self.command).status().await?;
        if status.success() {
            Ok(())
        } else {
            Err(ReloadError::Exit(status))
        }
    }
}

/// Where rendered output goes and what happens after.
#[derive(Clone)]
pub struct RenderPipeline {
    pub template: PathBuf,
    /// Output file; unused in dry run
    pub path: PathBuf,
    pub reload: Option<Arc<dyn ReloadAction>>,
}

impl RenderPipeline {
    pub fn new(template: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        RenderPipeline { template: template.into(), path: path.into(), reload: None }
    }

    pub fn with_reload(mut self, reload: Arc<dyn ReloadAction>) -> Self {
        self.reload = Some(reload);
        self
    }

    /// Read the template fresh from disk and render the servers through it.
    pub async fn render(&self, servers: &BackendServers) -> Result<String, RenderError> {
        let source = tokio::fs::read_to_string(&self.template)
            .await
            .map_err(|e| RenderError::Read { path: self.template.display().to_string(), source: e })?;
        render_template(&source, &format_output(servers))
    }

    pub async fn write(&self, output: &str) -> Result<(), RenderError> {
        write_output(&self.path, output.as_bytes())
            .await
            .map_err(|e| RenderError::Write { path: self.path.display().to_string(), source: e })
    }
}

/// Convert entries into `server <node>_<id> <ip>:<port>` lines per backend.
pub fn format_output(servers: &BackendServers) -> BTreeMap<String, Vec<String>> {
    servers
        .iter()
        .map(|(backend, entries)| {
            let lines = entries
                .iter()
                .map(|e| {
                    let name = format!("{}_{}", e.node, e.service_id);
                    let addr = match e.address.parse::<IpAddr>() {
                        Ok(ip) => SocketAddr::new(ip, e.port).to_string(),
                        Err(_) => format!("{}:{}", e.address, e.port),
                    };
                    format!("server {} {}", name, addr)
                })
                .collect();
            (backend.clone(), lines)
        })
        .collect()
}

/// Render `source` with every backend exposed as a list variable.
/// Referencing a backend that doesn't exist is an error.
pub fn render_template(source: &str, vars: &BTreeMap<String, Vec<String>>) -> Result<String, RenderError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    let tmpl = env.template_from_str(source).map_err(RenderError::Parse)?;
    tmpl.render(vars).map_err(RenderError::Render)
}

async fn write_output(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(0o660);
    let mut file = opts.open(path).await?;
    file.write_all(bytes).await?;
    file.flush().await
}
