// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # paynode
//!
//! Entry point for the `paynode` binary. Parses CLI arguments, initializes
//! logging and metrics, builds the session registry and serves the
//! HTTP/WebSocket API until a shutdown signal arrives.
//!
//! Subcommands:
//!
//! - `serve`: run the API server
//! - `check`: validate node and session config files
//! - `version`: print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use paynode_protocol::config::{NodeConfig, SessionConfig};
use paynode_protocol::sim::SimNetwork;
use paynode_protocol::Node;

use cli::{Commands, PaynodeCli};
use logging::LogFormat;
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = PaynodeCli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Check(args) => check(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn load_node_config(path: Option<&std::path::Path>) -> Result<NodeConfig> {
    match path {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("invalid node config {}", path.display())),
        None => Ok(NodeConfig::default()),
    }
}

/// Runs the API server until SIGINT/SIGTERM, then force-closes every session.
async fn serve(args: cli::ServeArgs) -> Result<()> {
    logging::init_logging(
        logging::DEFAULT_FILTER,
        LogFormat::from_str_lossy(&args.log_format),
    );

    let mut config = load_node_config(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.api_port = port;
    }
    let port = config.api_port;

    tracing::info!(
        port,
        currencies = ?config.currencies,
        response_timeout_secs = config.response_timeout_secs,
        on_chain_tx_timeout_secs = config.on_chain_tx_timeout_secs,
        "starting paynode"
    );

    // Backends: the in-process simulated network.
    let network = SimNetwork::new();
    let node = Arc::new(Node::new(config, network.backends()).context("invalid node config")?);
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);

    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        node: Arc::clone(&node),
        metrics: node_metrics,
    };
    let router = api::create_router(app_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", addr))?;
    tracing::info!(%addr, "API server listening");

    tokio::select! {
        res = axum::serve(listener, router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "API server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, closing sessions");
        }
    }

    node.shutdown().await;
    tracing::info!("paynode stopped");
    Ok(())
}

/// Validates config files and reports the first problem in each.
fn check(args: cli::CheckArgs) -> Result<()> {
    let config = load_node_config(args.config.as_deref())?;
    println!(
        "node config ok: port {}, currencies {}",
        config.api_port,
        config.currencies.join(",")
    );

    let mut failures = 0;
    for path in &args.sessions {
        match SessionConfig::load(path) {
            Ok(cfg) => println!("{}: ok (user {}, {})", path.display(), cfg.user.name, cfg.currency),
            Err(e) => {
                failures += 1;
                println!("{}: {}", path.display(), e);
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{} session config(s) invalid", failures);
    }
    Ok(())
}

fn print_version() {
    println!("paynode {}", env!("CARGO_PKG_VERSION"));
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
