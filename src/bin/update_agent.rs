// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! The update-agent binary: the per-node daemon.
//!
//! Connects to the host update engine and session manager over the system
//! bus, then runs the agent state machine against this node's object until
//! the host reboots or the process is asked to stop.

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use klocksmith::agent::{Agent, Config};
use klocksmith::constants::{
    DEFAULT_POD_DELETION_GRACE_PERIOD, DEFAULT_POLL_INTERVAL, MAX_OPERATOR_RESPONSE_TIME,
    TOKIO_WORKER_THREADS,
};
use klocksmith::drain::KubeWorkloads;
use klocksmith::nodes::KubeNodes;
use klocksmith::{login1, update_engine};

#[derive(Parser)]
#[command(name = "update-agent", version, about = "Watches the host update engine and reboots the node when permitted")]
struct Args {
    /// Kubernetes node name.
    #[arg(long, env = "UPDATE_AGENT_NODE")]
    node: String,

    /// Period of time in seconds given to a pod to terminate when rebooting
    /// for an update.
    #[arg(
        long,
        env = "UPDATE_AGENT_GRACE_PERIOD",
        default_value_t = DEFAULT_POD_DELETION_GRACE_PERIOD.as_secs()
    )]
    grace_period: u64,
}

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(TOKIO_WORKER_THREADS)
        .thread_name("update-agent")
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

/// Initialize logging with custom format
///
/// Respects `RUST_LOG` environment variable if set, otherwise defaults to
/// INFO level. Respects `RUST_LOG_FORMAT` environment variable for output
/// format (json or text).
fn initialize_logging(name: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_thread_names(true)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_thread_names(true)
                .with_target(false)
                .with_ansi(true)
                .compact()
                .init();
        }
    }

    info!("Starting {name}");
}

/// Resolve when the process receives SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                result.map_err(anyhow::Error::from)
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM (pod termination), initiating graceful shutdown...");
                Ok(())
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(anyhow::Error::from)
    }
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    initialize_logging("update-agent");

    // Honors in-cluster credentials and kubeconfig discovery from the
    // ambient environment.
    let client = Client::try_default()
        .await
        .context("creating Kubernetes client")?;

    let update_engine_client = update_engine::Client::connect()
        .await
        .context("establishing connection to the update engine")?;

    let rebooter = login1::LogindRebooter::connect()
        .await
        .context("establishing connection to logind")?;

    let agent = Agent::new(Config {
        node_name: args.node,
        nodes: Arc::new(KubeNodes::new(client.clone())),
        workloads: Arc::new(KubeWorkloads::new(client)),
        status_receiver: Arc::new(update_engine_client),
        rebooter: Arc::new(rebooter),
        pod_deletion_grace_period: Duration::from_secs(args.grace_period),
        poll_interval: DEFAULT_POLL_INTERVAL,
        max_operator_response_time: MAX_OPERATOR_RESPONSE_TIME,
        host_files_prefix: PathBuf::from("/"),
    })
    .context("initializing update-agent")?;

    let stop = CancellationToken::new();

    // Signals cancel the token; the agent unwinds at its next suspension
    // point without issuing further mutations.
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            tracing::error!(error = %e, "Failed waiting for shutdown signal");
        }
        signal_stop.cancel();
    });

    agent.run(stop).await.context("running agent")?;

    info!("Graceful shutdown completed successfully");
    Ok(())
}
