//! Tunnel Daemon - admission-controlled control and proxy listener

mod config;
mod context;
mod control;
mod dispatcher;
mod msg;
mod registry;
mod tls;

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Args, LogTarget, ServerConfig};
use crate::context::ServerContext;
use crate::tls::TlsConfig;

fn init_logging(level: &str, target: &LogTarget) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match target {
        LogTarget::Stdout => builder.init(),
        LogTarget::Stderr => builder.with_writer(std::io::stderr).init(),
        LogTarget::None => {}
        LogTarget::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .context(format!("Failed to open log file: {:?}", path))?;
            builder.with_writer(Arc::new(file)).with_ansi(false).init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, &args.log_to)?;

    // Health check
    if args.health {
        match TcpStream::connect(&args.tunnel_addr).await {
            Ok(_) => {
                println!("OK");
                std::process::exit(0);
            }
            Err(_) => {
                eprintln!("FAILED");
                std::process::exit(1);
            }
        }
    }

    let config = ServerConfig::from_args(&args)?;

    info!("Starting Tunnel Daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Tunnel domain: {}", config.domain);
    info!(
        "IP limit: {}/s burst {}; connection limit: {}/s burst {}, {} per IP",
        config.ip_rate, config.ip_burst, config.conn_rate, config.conn_burst, config.max_conns_per_ip
    );

    let tls = match &config.tls {
        Some((crt, key)) => TlsConfig::from_files(crt, key)?,
        None => TlsConfig::disabled(),
    };
    if !tls.is_enabled() {
        warn!("TLS disabled, accepting plain TCP");
    }

    let ctx = Arc::new(ServerContext::new(&config, tls));

    if let Some(path) = &config.registry_cache_file {
        match ctx.tunnels.load_affinity(path) {
            Ok(n) => info!("Restored {} registry cache entries", n),
            Err(e) => error!("Failed to load registry cache from {:?}: {}", path, e),
        }
        ctx.tunnels.spawn_saver(path.clone(), config.registry_save_interval);
    }

    if ctx.reclaims() {
        for limiter in ctx.limiters() {
            limiter.spawn_reclaimer();
        }
    }

    let listener = TcpListener::bind(&config.tunnel_addr)
        .await
        .context(format!("Failed to bind {}", config.tunnel_addr))?;
    info!("Listening for control and proxy connections on {}", config.tunnel_addr);

    tokio::select! {
        res = dispatcher::serve(listener, Arc::clone(&ctx)) => res?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    if let Some(path) = &config.registry_cache_file {
        match ctx.tunnels.save_affinity(path) {
            Ok(n) => info!("Saved {} registry cache entries to {:?}", n, path),
            Err(e) => error!("Failed to save registry cache to {:?}: {}", path, e),
        }
    }
    info!("Registry cache stats: {}", ctx.tunnels.cache_stats_json());

    Ok(())
}
