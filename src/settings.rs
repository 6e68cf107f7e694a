//! Daemon settings
//!
//! Every option comes from the command line or its environment variable,
//! then from the optional TOML file, then from built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;

use kubeship_k8s::{DEFAULT_CA_CERT_FILE, DEFAULT_TOKEN_FILE, ResolverConfig};
use kubeship_logs::{FollowConfig, SessionConfig};
use kubeship_types::{OptInPolicy, OptInSource};

pub const DEFAULT_LOGS_DIR: &str = "/var/log/containers/";
pub const DEFAULT_BUFFER_SIZE: usize = 100;
pub const DEFAULT_RESTART_DELAY_MS: u64 = 1000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Kubeship - ships opted-in Kubernetes container logs to Graylog
#[derive(Parser, Debug, Default)]
#[command(name = "kubeship")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TOML settings file
    #[arg(long, env = "KUBESHIP_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory holding the container log files
    #[arg(long, env = "K8S_CONTAINERS_LOGS_DIR", value_name = "DIR")]
    pub logs_dir: Option<PathBuf>,

    /// Only follow files ending in .log
    #[arg(long, env = "ONLY_LOG_SUFFIX", value_parser = clap::builder::BoolishValueParser::new())]
    pub only_log_suffix: bool,

    /// Kubernetes API server host
    #[arg(long, env = "KUBERNETES_SERVICE_HOST")]
    pub kubernetes_host: Option<String>,

    /// Kubernetes API server port
    #[arg(long, env = "KUBERNETES_SERVICE_PORT")]
    pub kubernetes_port: Option<u16>,

    /// Cluster CA certificate (PEM)
    #[arg(long, env = "CA_CERT_FILE", value_name = "FILE")]
    pub ca_cert_file: Option<PathBuf>,

    /// Service account bearer token
    #[arg(long, env = "TOKEN_FILE", value_name = "FILE")]
    pub token_file: Option<PathBuf>,

    /// Graylog GELF UDP input host
    #[arg(long, env = "GRAYLOG_HOST")]
    pub graylog_host: Option<String>,

    /// Graylog GELF UDP input port
    #[arg(long, env = "GRAYLOG_PORT")]
    pub graylog_port: Option<u16>,

    /// Where the opt-in flag is read from: annotation or label
    #[arg(long, env = "LOGGING_OPT_IN_SOURCE")]
    pub opt_in_source: Option<OptInSource>,

    /// Annotation or label key holding the opt-in flag
    #[arg(long, env = "LOGGING_OPT_IN_KEY")]
    pub opt_in_key: Option<String>,

    /// Value that enables shipping
    #[arg(long, env = "LOGGING_OPT_IN_VALUE")]
    pub opt_in_value: Option<String>,

    /// Messages buffered between the sessions and the sender
    #[arg(long, env = "FORWARD_BUFFER_SIZE")]
    pub buffer_size: Option<usize>,

    /// Pause before restarting a failed session
    #[arg(long, env = "RESTART_DELAY_MS")]
    pub restart_delay_ms: Option<u64>,

    /// How often an idle log file is checked for new data
    #[arg(long, env = "POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<u64>,

    /// Timeout for a single pod lookup (no timeout when unset)
    #[arg(long, env = "LOOKUP_TIMEOUT_SECS")]
    pub lookup_timeout_secs: Option<u64>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, env = "KUBESHIP_LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// Contents of the optional settings file
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileSettings {
    pub logs_dir: Option<PathBuf>,
    pub only_log_suffix: Option<bool>,
    pub kubernetes_host: Option<String>,
    pub kubernetes_port: Option<u16>,
    pub ca_cert_file: Option<PathBuf>,
    pub token_file: Option<PathBuf>,
    pub graylog_host: Option<String>,
    pub graylog_port: Option<u16>,
    pub opt_in_source: Option<OptInSource>,
    pub opt_in_key: Option<String>,
    pub opt_in_value: Option<String>,
    pub buffer_size: Option<usize>,
    pub restart_delay_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub lookup_timeout_secs: Option<u64>,
    pub log_level: Option<String>,
}

impl FileSettings {
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("invalid settings file {}", path.display()))
    }
}

/// Fully resolved daemon settings
#[derive(Clone, Debug)]
pub struct Settings {
    pub logs_dir: PathBuf,
    pub only_log_suffix: bool,
    pub resolver: ResolverConfig,
    pub graylog_host: String,
    pub graylog_port: u16,
    pub buffer_size: usize,
    pub session: SessionConfig,
    pub log_level: String,
}

impl Settings {
    /// Resolve settings from `args` and the settings file it names
    pub fn load(args: &Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileSettings::read(path)?,
            None => FileSettings::default(),
        };
        Self::resolve(args, file)
    }

    pub fn resolve(args: &Args, file: FileSettings) -> Result<Self> {
        let kubernetes_host = args
            .kubernetes_host
            .clone()
            .or(file.kubernetes_host)
            .context("KUBERNETES_SERVICE_HOST environment variable must be set")?;
        let kubernetes_port = args
            .kubernetes_port
            .or(file.kubernetes_port)
            .context("KUBERNETES_SERVICE_PORT environment variable must be set")?;
        let graylog_host = args
            .graylog_host
            .clone()
            .or(file.graylog_host)
            .context("GRAYLOG_HOST environment variable must be set")?;
        let graylog_port = args
            .graylog_port
            .or(file.graylog_port)
            .context("GRAYLOG_PORT environment variable must be set")?;
        if graylog_port == 0 {
            bail!("GRAYLOG_PORT must be a positive number");
        }

        let mut resolver = ResolverConfig::new(kubernetes_host, kubernetes_port);
        resolver.ca_cert_file = args
            .ca_cert_file
            .clone()
            .or(file.ca_cert_file)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CA_CERT_FILE));
        resolver.token_file = args
            .token_file
            .clone()
            .or(file.token_file)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKEN_FILE));
        resolver.timeout = args
            .lookup_timeout_secs
            .or(file.lookup_timeout_secs)
            .map(Duration::from_secs);

        let defaults = OptInPolicy::default();
        let opt_in = OptInPolicy {
            source: args
                .opt_in_source
                .or(file.opt_in_source)
                .unwrap_or(defaults.source),
            key: args
                .opt_in_key
                .clone()
                .or(file.opt_in_key)
                .unwrap_or(defaults.key),
            value: args
                .opt_in_value
                .clone()
                .or(file.opt_in_value)
                .unwrap_or(defaults.value),
        };

        let buffer_size = args
            .buffer_size
            .or(file.buffer_size)
            .unwrap_or(DEFAULT_BUFFER_SIZE);
        if buffer_size == 0 {
            bail!("FORWARD_BUFFER_SIZE must be a positive number");
        }

        let restart_delay = args
            .restart_delay_ms
            .or(file.restart_delay_ms)
            .unwrap_or(DEFAULT_RESTART_DELAY_MS);
        let poll_interval = args
            .poll_interval_ms
            .or(file.poll_interval_ms)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        Ok(Self {
            logs_dir: args
                .logs_dir
                .clone()
                .or(file.logs_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOGS_DIR)),
            only_log_suffix: args.only_log_suffix || file.only_log_suffix.unwrap_or(false),
            resolver,
            graylog_host,
            graylog_port,
            buffer_size,
            session: SessionConfig {
                opt_in,
                restart_delay: Duration::from_millis(restart_delay),
                follow: FollowConfig {
                    poll_interval: Duration::from_millis(poll_interval),
                    ..Default::default()
                },
            },
            log_level: args
                .log_level
                .clone()
                .or(file.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        })
    }
}
