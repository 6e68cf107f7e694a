mod discovery;
mod settings;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kubeship_gelf::{UdpGelfSink, spawn_sender};
use kubeship_k8s::{CredentialCache, PodResolver};
use kubeship_logs::{ManagedFileRegistry, SessionContext};

use crate::discovery::Discovery;
use crate::settings::{Args, Settings};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let settings = Settings::load(&args)?;
    init_tracing(&settings.log_level);

    info!(
        logs_dir = %settings.logs_dir.display(),
        api_server = %settings.resolver.cluster_url(),
        graylog = %format!("{}:{}", settings.graylog_host, settings.graylog_port),
        "kubeship starting"
    );

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone())?;

    let sink = UdpGelfSink::connect(&settings.graylog_host, settings.graylog_port)
        .await
        .with_context(|| {
            format!(
                "failed to set up GELF output to {}:{}",
                settings.graylog_host, settings.graylog_port
            )
        })?;
    let (channel, receiver) = kubeship_gelf::bounded(settings.buffer_size);
    let sender = spawn_sender(receiver, Arc::new(sink), cancel.clone());

    let credentials = Arc::new(CredentialCache::new());
    let resolver = PodResolver::new(settings.resolver.clone(), credentials);
    let ctx = SessionContext::new(
        Arc::new(resolver),
        Arc::new(channel),
        ManagedFileRegistry::new(),
        settings.session.clone(),
        cancel.clone(),
    );

    let discovery = Discovery::new(&settings.logs_dir, settings.only_log_suffix, ctx);
    let result = discovery.run().await;

    cancel.cancel();
    if let Err(e) = sender.await {
        warn!(error = %e, "GELF sender task failed");
    }

    result
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel `cancel` on SIGINT or SIGTERM
fn spawn_shutdown_listener(cancel: CancellationToken) -> Result<()> {
    let mut sig_term =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sig_int =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sig_term.recv() => {},
            _ = sig_int.recv() => {},
        }
        info!("shutdown requested");
        cancel.cancel();
    });

    Ok(())
}
