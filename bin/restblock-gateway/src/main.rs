//! RestBlock Gateway
//!
//! Attaches remote objects as block devices and serves them over NBD. A Unix
//! control socket manages servers and attachments at runtime.

mod config;
mod control;
mod nbd;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use restblock_block::Registry;
use restblock_common::{CompletionPolicy, DebugLevel};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{AttachSpec, GatewayConfig};
use crate::control::ControlServer;
use crate::nbd::NbdServer;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "restblock-gateway", about = "RestBlock NBD gateway")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "/etc/restblock/gateway.toml")]
    config: PathBuf,

    /// NBD TCP listen address
    #[arg(long)]
    nbd_listen: Option<String>,

    /// Control socket path
    #[arg(long)]
    control_socket: Option<PathBuf>,

    /// Server base URL, repeatable
    #[arg(long = "server")]
    servers: Vec<String>,

    /// Attach at startup as <object>:<device>, repeatable
    #[arg(long = "attach")]
    attachments: Vec<AttachSpec>,

    /// Worker threads (and connections) per device
    #[arg(long)]
    thread_pool_size: Option<usize>,

    /// Attempts per range request
    #[arg(long)]
    request_retries: Option<u32>,

    /// Socket timeout in seconds (0 = none)
    #[arg(long)]
    request_timeout: Option<u64>,

    /// Report request failures to the block layer
    #[arg(long)]
    strict: bool,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, env = "RESTBLOCK_LOG", default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command-line values override the file
    fn merge_into(self, config: &mut GatewayConfig) {
        let driver = &mut config.driver;
        if let Some(n) = self.thread_pool_size {
            driver.thread_pool_size = n;
        }
        if let Some(n) = self.request_retries {
            driver.request_retries = n;
        }
        if let Some(secs) = self.request_timeout {
            driver.request_timeout_secs = secs;
        }
        if self.strict {
            driver.completion = CompletionPolicy::Strict;
        }
        if let Ok(level) = self.log_level.parse::<DebugLevel>() {
            driver.log_level = level;
        }

        let gateway = &mut config.gateway;
        if let Some(addr) = self.nbd_listen {
            gateway.nbd_listen = addr;
        }
        if let Some(path) = self.control_socket {
            gateway.control_socket = path;
        }
        gateway.servers.extend(self.servers);
        gateway.attach.extend(self.attachments);
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting RestBlock Gateway");

    let mut config = GatewayConfig::load(&args.config)?;
    args.merge_into(&mut config);

    if config.driver.completion == CompletionPolicy::Unconditional {
        warn!("Unconditional completion: failed requests are reported as successful");
    }

    // ── Registry ──────────────────────────────────────────────────────────────
    let registry = Arc::new(Registry::new(config.driver.clone()));

    for url in &config.gateway.servers {
        registry
            .add_server(url)
            .with_context(|| format!("add server {url}"))?;
    }

    for spec in config.gateway.attach.clone() {
        let reg = Arc::clone(&registry);
        let attached = tokio::task::spawn_blocking(move || reg.attach(&spec.object, &spec.device))
            .await
            .context("attach task panicked")?;
        if let Err(e) = attached {
            error!("Startup attach failed: {e}");
        }
    }

    // ── NBD server ────────────────────────────────────────────────────────────
    let nbd_addr: SocketAddr = config
        .gateway
        .nbd_listen
        .parse()
        .context("parse NBD listen address")?;
    let nbd_server = Arc::new(NbdServer::new(Arc::clone(&registry)));
    let nbd_task = tokio::spawn(nbd_server.serve(nbd_addr));

    // ── Control socket ────────────────────────────────────────────────────────
    let control_server = Arc::new(ControlServer::new(Arc::clone(&registry)));
    let control_path = config.gateway.control_socket.clone();
    let control_task = tokio::spawn(async move { control_server.serve(&control_path).await });

    // ── Run until Ctrl-C or a listener fails ──────────────────────────────────
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("wait for Ctrl-C")?;
            info!("Shutting down");
        }
        res = nbd_task => {
            res.context("NBD task panicked")??;
        }
        res = control_task => {
            res.context("control task panicked")??;
        }
    }

    // A second Ctrl-C aborts transfers stuck on unresponsive servers
    let reg = Arc::clone(&registry);
    let mut detaching = tokio::task::spawn_blocking(move || reg.detach_all());
    let failed = tokio::select! {
        res = &mut detaching => res.context("detach task panicked")?,
        res = tokio::signal::ctrl_c() => {
            res.context("wait for Ctrl-C")?;
            let cancelled = registry.cancel_all();
            warn!(cancelled, "Cancelling in-flight requests");
            detaching.await.context("detach task panicked")?
        }
    };
    if failed > 0 {
        warn!("{failed} device(s) could not be detached");
    }
    if let Err(e) = std::fs::remove_file(&config.gateway.control_socket) {
        warn!("Removing control socket: {e}");
    }

    info!("RestBlock Gateway stopped");
    Ok(())
}
