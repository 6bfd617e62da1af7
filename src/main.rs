//! eden-proxy: intercepting HTTP/HTTPS/WebSocket forward proxy
//!
//! This is the main entry point for the eden-proxy binary. It handles CLI argument
//! parsing, configuration loading, tracing initialization, and runs the proxy
//! until Ctrl-C.
//!
//! # Output
//!
//! - **Diagnostics** go to stderr through `tracing`, filtered by `-v`, `RUST_LOG`
//!   or `general.log_level`
//! - **Traffic records** are emitted as JSON lines under the `eden_proxy::records`
//!   target, which stays enabled at the default verbosity

use anyhow::{Context, Result};
use clap::Parser;
use eden_proxy::{
    ca::{RootAuthority, read_pem_certificates},
    cli::{Cli, Commands, RunArgs},
    config::{Config, ConfigLoader},
    proxy::{ProxyServerBuilder, Throttle},
    recorder::{RECORDS_TARGET, RecorderHandle, TracingRecorder},
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::InitCa { dir, force }) => {
            init_tracing(cli.verbose, "")?;
            let config = ConfigLoader::new()
                .load(&RunArgs::default())
                .context("Failed to load configuration")?;
            let dir = dir.clone().unwrap_or_else(|| config.certificates_dir());
            init_ca(&dir, *force)
        }
        _ => {
            let args = cli.run_args();
            let config = ConfigLoader::new()
                .load(args)
                .context("Failed to load configuration")?;
            init_tracing(cli.verbose, &config.general.log_level)?;
            debug!("Loaded configuration: {:?}", config);
            config.validate().context("Invalid configuration")?;
            run_proxy(config)
        }
    }
}

/// Generate the root pair and print where it was written.
fn init_ca(dir: &Path, force: bool) -> Result<()> {
    let ca = RootAuthority::generate(dir, force)
        .with_context(|| format!("Failed to generate root CA in {}", dir.display()))?;
    println!("Root certificate: {}", ca.cert_path().display());
    println!("Root private key: {}", ca.key_path().display());
    println!("Install the certificate into the client trust store to intercept HTTPS.");
    Ok(())
}

fn run_proxy(config: Config) -> Result<()> {
    let ca_dir = config.certificates_dir();
    let ca = RootAuthority::load_or_generate(&ca_dir)
        .with_context(|| format!("Failed to load root CA from {}", ca_dir.display()))?;
    info!("Using root CA at {}", ca.cert_path().display());

    let mut builder = ProxyServerBuilder::new()
        .bind_address(config.bind_address())
        .port(config.port())
        .ca(Arc::new(ca))
        .force_intercept(config.force_intercept())
        .ws_intercept(config.ws_intercept())
        .ignore_unauthorized(config.ignore_unauthorized())
        .throttle(Throttle::from_kbps(config.throttle_kbps()))
        .chunk_threshold(config.chunk_threshold())
        .upstream_timeout(config.upstream_timeout())
        .drain_timeout(config.drain_timeout())
        .cache_leaves(config.cache_leaves())
        .recorder(RecorderHandle::new(Arc::new(TracingRecorder::new())));

    if let Some(hostname) = config.https_hostname() {
        builder = builder.https(hostname);
    }

    for path in config.extra_roots() {
        let roots = read_pem_certificates(&path)
            .with_context(|| format!("Failed to read extra root {}", path.display()))?;
        debug!("Trusting {} certificate(s) from {}", roots.len(), path.display());
        for root in roots {
            builder = builder.trust_root(root);
        }
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = builder
            .build(shutdown_rx)
            .context("Failed to build proxy server")?;

        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
            }
            let _ = shutdown_tx.send(true);
        });

        server.run().await.context("Proxy server failed")
    })
}

/// Initialize the tracing subscriber.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, else `general.log_level`, else warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
///
/// Traffic records stay enabled at every level.
fn init_tracing(verbose: u8, log_level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let fallback = if log_level.is_empty() { "warn" } else { log_level };
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    let filter = filter.add_directive(
        format!("{RECORDS_TARGET}=info")
            .parse()
            .context("Invalid records directive")?,
    );

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
