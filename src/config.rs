use crate::backoff::BackoffPolicy;
use clap::Parser;
use serde::Deserialize;
use std::{fmt, fs::File, io::BufReader, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

/// Default blocking-query wait
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(60);

/// Consul caps blocking queries at ten minutes
pub const MAX_WAIT_TIME_SECS: u64 = 600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open config file '{path}' : {source}")]
    Io { path: String, source: std::io::Error },

    #[error("failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid backend spec '{spec}': {reason}")]
    InvalidWatch { spec: String, reason: &'static str },

    #[error("missing template path")]
    MissingTemplate,

    #[error("missing output path (required unless dry run)")]
    MissingPath,

    #[error("no backends configured")]
    NoBackends,

    #[error("wait_time_secs must be between 1 and {max}, got {value}")]
    WaitTime { value: u64, max: u64 },
}

/// A single configured watch: one service (optionally filtered by tag and
/// datacenter) feeding one backend group.
///
/// Parsed from `backend=[tag.]service[@datacenter][:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSpec {
    pub backend: String,
    pub service: String,
    pub tag: Option<String>,
    pub datacenter: Option<String>,
    /// Substituted for entries that report port 0
    pub port: Option<u16>,
    /// The spec string as written, for logs
    pub label: String,
}

impl WatchSpec {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason| ConfigError::InvalidWatch { spec: raw.to_string(), reason };
        let raw_trimmed = raw.trim();

        let (backend, mut rest) = raw_trimmed.split_once('=').ok_or(invalid("expected 'backend=service'"))?;
        if backend.is_empty() {
            return Err(invalid("empty backend name"));
        }

        let mut port = None;
        if let Some((head, p)) = rest.rsplit_once(':') {
            let p: u16 = p.parse().map_err(|_| invalid("port is not a number"))?;
            if p == 0 {
                return Err(invalid("override port must be non-zero"));
            }
            port = Some(p);
            rest = head;
        }

        let mut datacenter = None;
        if let Some((head, dc)) = rest.split_once('@') {
            if dc.is_empty() {
                return Err(invalid("empty datacenter"));
            }
            datacenter = Some(dc.to_string());
            rest = head;
        }

        let (tag, service) = match rest.split_once('.') {
            Some((tag, service)) => {
                if tag.is_empty() {
                    return Err(invalid("empty tag"));
                }
                (Some(tag.to_string()), service)
            }
            None => (None, rest),
        };
        if service.is_empty() {
            return Err(invalid("empty service name"));
        }

        Ok(WatchSpec {
            backend: backend.to_string(),
            service: service.to_string(),
            tag,
            datacenter,
            port,
            label: raw_trimmed.to_string(),
        })
    }
}

impl fmt::Display for WatchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Consul agent address, defaults to 127.0.0.1:8500
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub template: Option<PathBuf>,
    /// Destination of the rendered configuration
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub reload_command: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub backends: Vec<String>,
    #[serde(default)]
    pub wait_time_secs: Option<u64>,
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

/// Command line flags; any flag given overrides the config file.
#[derive(Debug, Default, Parser)]
#[command(name = "consul-sync", about = "Render a config file from Consul service health and reload on change")]
pub struct Cli {
    /// YAML config file
    #[arg(short = 'f', long = "config")]
    pub config: Option<PathBuf>,

    /// Consul agent address
    #[arg(long = "addr")]
    pub address: Option<String>,

    /// Template file
    #[arg(long = "in")]
    pub template: Option<PathBuf>,

    /// Output file
    #[arg(long = "out")]
    pub path: Option<PathBuf>,

    /// Command run after the output file changes
    #[arg(long = "reload")]
    pub reload_command: Option<String>,

    /// Watch spec `backend=[tag.]service[@dc][:port]`, repeatable
    #[arg(long = "backend")]
    pub backends: Vec<String>,

    /// Render once to stdout and exit
    #[arg(long = "dry")]
    pub dry_run: bool,
}

impl Config {
    /// Load and parse configuration from the given YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let p = path.as_ref();
        let file = File::open(p)
            .map_err(|e| ConfigError::Io { path: p.display().to_string(), source: e })?;
        let reader = BufReader::new(file);
        let cfg = serde_yaml::from_reader(reader)?;
        Ok(cfg)
    }

    /// Build the effective configuration from flags and the optional file.
    pub fn load(cli: Cli) -> Result<Self, ConfigError> {
        let base = match &cli.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        let cfg = base.merge(cli);
        cfg.validate()?;
        Ok(cfg)
    }

    fn merge(mut self, cli: Cli) -> Self {
        if cli.address.is_some() {
            self.address = cli.address;
        }
        if cli.template.is_some() {
            self.template = cli.template;
        }
        if cli.path.is_some() {
            self.path = cli.path;
        }
        if cli.reload_command.is_some() {
            self.reload_command = cli.reload_command;
        }
        self.dry_run |= cli.dry_run;
        self.backends.extend(cli.backends);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.template.is_none() {
            return Err(ConfigError::MissingTemplate);
        }
        if self.path.is_none() && !self.dry_run {
            return Err(ConfigError::MissingPath);
        }
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        if let Some(secs) = self.wait_time_secs {
            if secs == 0 || secs > MAX_WAIT_TIME_SECS {
                return Err(ConfigError::WaitTime { value: secs, max: MAX_WAIT_TIME_SECS });
            }
        }
        self.watches().map(|_| ())
    }

    /// Parsed watch specs in configuration order.
    pub fn watches(&self) -> Result<Vec<WatchSpec>, ConfigError> {
        self.backends.iter().map(|raw| WatchSpec::parse(raw)).collect()
    }

    pub fn wait_time(&self) -> Duration {
        self.wait_time_secs.map(Duration::from_secs).unwrap_or(DEFAULT_WAIT_TIME)
    }
}
