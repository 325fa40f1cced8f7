//! oxircd - Oxide IRC Daemon.
//!
//! A federated TS6-style IRC server: clients over plaintext or TLS,
//! peer servers over a spanning tree kept eventually consistent by
//! timestamped state exchange.

mod channel;
mod config;
mod core;
mod dispatch;
mod error;
mod handlers;
mod link;
mod net;
mod send;
mod tasks;

use crate::config::Config;
use crate::core::Core;
use crate::net::Shared;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path.
/// Falls back to `oxircd.toml` when no argument is provided.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);

    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {flag}");
            std::process::exit(1);
        }),
        Some(path) => path,
        None => "oxircd.toml".to_string(),
    };

    // Canonicalize so later rewrites don't depend on the working
    // directory.
    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => raw_path,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = resolve_config_path();
    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("ERROR: failed to load config from {config_path}: {e}");
        e
    })?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match config.log.format {
        config::LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        config::LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }

    info!(
        server = %config.server.name,
        sid = %config.server.sid,
        "starting oxircd"
    );

    let mut core = Core::new(Arc::new(config));
    link::read_links_file(&mut core);
    let shared = Arc::new(Shared::new(core));

    let link_tx = link::spawn_link_manager(Arc::clone(&shared));
    shared.lock().link_requests = Some(link_tx);

    net::spawn_listeners(Arc::clone(&shared)).await?;
    tasks::spawn_periodic(Arc::clone(&shared));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    // Tear down channels and clients before the listeners go away.
    {
        let mut core = shared.lock();
        let uids: Vec<String> = core
            .clients
            .values()
            .filter(|c| c.is_local())
            .map(|c| c.uid.clone())
            .collect();
        for uid in uids {
            core.exit_client(&uid, "Server shutting down");
        }
    }

    Ok(())
}
