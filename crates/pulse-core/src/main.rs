//! Pulse Link node
//!
//! Runs one device: follows the announced mode, shares the local heart rate
//! and plays the pulse of whichever rate the mode selects.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize the Prometheus metrics recorder and scrape endpoint
//! 3. Connect to the Redis store
//! 4. Start the node and apply the configured role
//! 5. Read heart-rate samples (one bpm value per line) from stdin
//! 6. Wait for shutdown signal

#![warn(clippy::pedantic)]

use std::sync::Arc;

use anyhow::Context;
use common::secret::ExposeSecret;
use pulse_core::config::Config;
use pulse_core::node::{NodeConfig, NodeEvent, PulseNode};
use pulse_core::observability::metrics::init_metrics_recorder;
use pulse_core::pulse::PulseEvent;
use pulse_core::store::RedisStore;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse_core=debug,pulse_node=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Pulse node");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        user_id = %config.user_id,
        display_name = %config.display_name,
        role = ?config.role,
        poll_interval_s = config.poll_interval.as_secs(),
        heartbeat_timeout_s = config.heartbeat_timeout.as_secs(),
        heartbeat_interval_s = config.heartbeat_interval.as_secs(),
        check_tick_ms = config.check_tick.as_millis(),
        metrics_bind_address = %config.metrics_bind_address,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    init_metrics_recorder(config.metrics_bind_address)
        .map_err(anyhow::Error::msg)
        .context("Failed to install Prometheus metrics recorder")?;
    info!(addr = %config.metrics_bind_address, "Prometheus metrics endpoint started");

    info!("Connecting to store...");
    let store = RedisStore::connect(config.store_url.expose_secret())
        .await
        .context("Failed to connect to store")?;
    info!("Store connection established");

    let node = PulseNode::start(Arc::new(store), NodeConfig::from(&config));
    if let Err(e) = node.apply_role(&config.role).await {
        // The node keeps running in whatever mode the store announces.
        warn!(role = ?config.role, error = %e, "Failed to apply configured role");
    }

    let shutdown_token = CancellationToken::new();
    let events_task = tokio::spawn(log_events(node.subscribe(), shutdown_token.child_token()));

    info!("Pulse node running - write bpm values to stdin, press Ctrl+C to shutdown");
    tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
        }
        () = read_samples(&node) => {
            info!("Sample input closed, shutting down");
        }
    }

    shutdown_token.cancel();
    if let Err(e) = events_task.await {
        warn!(error = %e, "Event logger ended abnormally");
    }
    node.shutdown().await;

    info!("Pulse node shutdown complete");
    Ok(())
}

/// Feed stdin samples to the node until EOF.
async fn read_samples(node: &PulseNode) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "Failed to read sample input");
                return;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match trimmed.parse::<f64>() {
            Ok(bpm) if bpm.is_finite() => {
                if let Err(e) = node.record_local_rate(bpm).await {
                    warn!(bpm, error = %e, "Failed to record heart rate");
                }
            }
            _ => warn!(input = %trimmed, "Ignoring malformed heart-rate sample"),
        }
    }
}

async fn log_events(
    mut events: tokio::sync::broadcast::Receiver<NodeEvent>,
    cancel_token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel_token.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(NodeEvent::ModeChanged(mode)) => info!(mode = %mode, "Mode changed"),
            Ok(NodeEvent::PeerStateChanged(change)) => info!(
                peer_id = %change.peer_id,
                state = %change.state,
                cause = change.cause.as_str(),
                "Peer state changed"
            ),
            Ok(NodeEvent::Pulse(PulseEvent::Beat { interval, bpm, .. })) => info!(
                bpm,
                interval_ms = interval.as_millis(),
                "Beat"
            ),
            Ok(NodeEvent::Pulse(_)) => {}
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "Event logger lagged"),
            Err(RecvError::Closed) => return,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
