// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! The update-operator binary: the singleton reboot coordinator.
//!
//! Runs the reconciler behind a leader-election gate. Loss of leadership is
//! terminal: the process exits non-zero so its supervisor restarts it into a
//! fresh election.

use anyhow::{bail, Context, Result};
use axum::{routing::get, Router};
use clap::Parser;
use kube::Client;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use klocksmith::constants::{
    DEFAULT_LEADER_ELECTION_GRACE, DEFAULT_LEADER_ELECTION_LEASE, DEFAULT_MAX_REBOOTING_NODES,
    DEFAULT_RECONCILIATION_PERIOD, LEADER_ELECTION_LEASE_NAME, METRICS_SERVER_BIND_ADDRESS,
    METRICS_SERVER_PATH, METRICS_SERVER_PORT, TOKIO_WORKER_THREADS,
};
use klocksmith::nodes::KubeNodes;
use klocksmith::operator::Operator;
use klocksmith::{leader, metrics, operator};

#[derive(Parser)]
#[command(name = "update-operator", version, about = "Coordinates reboots of Flatcar Container Linux nodes")]
struct Args {
    /// Path to a kubeconfig file. Defaults to the in-cluster configuration
    /// if not provided.
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<std::path::PathBuf>,

    /// List of comma-separated node annotations that must be set to 'true'
    /// before a reboot is allowed.
    #[arg(
        long,
        env = "UPDATE_OPERATOR_BEFORE_REBOOT_ANNOTATIONS",
        value_delimiter = ','
    )]
    before_reboot_annotations: Vec<String>,

    /// List of comma-separated node annotations that must be set to 'true'
    /// before a rebooted node's cycle is retired.
    #[arg(
        long,
        env = "UPDATE_OPERATOR_AFTER_REBOOT_ANNOTATIONS",
        value_delimiter = ','
    )]
    after_reboot_annotations: Vec<String>,

    /// Day of week ('Sun', 'Mon', ...; optional) and time of day at which
    /// the reboot window starts. E.g. 'Mon 14:00', '11:00'.
    #[arg(long, env = "UPDATE_OPERATOR_REBOOT_WINDOW_START", default_value = "")]
    reboot_window_start: String,

    /// Length of the reboot window. E.g. '1h30m'.
    #[arg(long, env = "UPDATE_OPERATOR_REBOOT_WINDOW_LENGTH", default_value = "")]
    reboot_window_length: String,

    /// Maximum number of nodes rebooting in parallel.
    #[arg(
        long,
        env = "UPDATE_OPERATOR_MAX_REBOOTING_NODES",
        default_value_t = DEFAULT_MAX_REBOOTING_NODES
    )]
    max_rebooting_nodes: usize,
}

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(TOKIO_WORKER_THREADS)
        .thread_name("update-operator")
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

/// Build a Kubernetes client from an explicit kubeconfig path, or from the
/// ambient environment (in-cluster config or `~/.kube/config`).
async fn kube_client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;

            let config = kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await
            .context("building client configuration from kubeconfig")?;

            Client::try_from(config).context("creating Kubernetes client")
        }
        None => Client::try_default()
            .await
            .context("creating Kubernetes client"),
    }
}

/// Identity written into the leader-election lease for this replica.
fn lock_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("update-operator-{}", rand::random::<u32>()))
}

/// Start the Prometheus metrics HTTP server.
fn start_metrics_server() -> tokio::task::JoinHandle<()> {
    info!(
        bind_address = METRICS_SERVER_BIND_ADDRESS,
        port = METRICS_SERVER_PORT,
        path = METRICS_SERVER_PATH,
        "Starting metrics HTTP server"
    );

    tokio::spawn(async move {
        async fn metrics_handler() -> String {
            match metrics::gather_metrics() {
                Ok(metrics_text) => metrics_text,
                Err(e) => {
                    error!("Failed to gather metrics: {e}");
                    String::from("# Error gathering metrics\n")
                }
            }
        }

        let app = Router::new().route(METRICS_SERVER_PATH, get(metrics_handler));

        let bind_addr = format!("{METRICS_SERVER_BIND_ADDRESS}:{METRICS_SERVER_PORT}");
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind metrics server to {bind_addr}: {e}");
                return;
            }
        };

        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {e}");
        }
    })
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

    initialize_logging("update-operator");

    let client = kube_client(args.kubeconfig.as_deref()).await?;

    let namespace = std::env::var("POD_NAMESPACE").context(
        "unable to determine operator namespace: please ensure POD_NAMESPACE \
         environment variable is set",
    )?;

    let _metrics_handle = start_metrics_server();

    // The reconciler must never run outside the leader-election gate.
    let mut gate = leader::acquire(
        client.clone(),
        leader::Config {
            lease_name: LEADER_ELECTION_LEASE_NAME.to_string(),
            namespace,
            identity: lock_identity(),
            lease_duration: DEFAULT_LEADER_ELECTION_LEASE,
            grace: DEFAULT_LEADER_ELECTION_GRACE,
        },
    )
    .await
    .context("acquiring leader-election lease")?;

    let operator = Operator::new(operator::Config {
        nodes: Arc::new(KubeNodes::new(client)),
        before_reboot_annotations: args.before_reboot_annotations,
        after_reboot_annotations: args.after_reboot_annotations,
        reboot_window_start: args.reboot_window_start,
        reboot_window_length: args.reboot_window_length,
        reconciliation_period: DEFAULT_RECONCILIATION_PERIOD,
        max_rebooting_nodes: args.max_rebooting_nodes,
    })
    .context("initializing update-operator")?;

    let stop = CancellationToken::new();

    // Signals cancel the token; the reconciler then finishes its in-flight
    // cycle and returns.
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "Failed waiting for shutdown signal");
        }
        signal_stop.cancel();
    });

    tokio::select! {
        lost = gate.lost() => {
            stop.cancel();
            lost?;

            error!("Leadership lost, exiting so a fresh election can run");
            bail!("leadership lost - stepping down");
        }
        run = operator.run(stop.clone()) => {
            run.context("running reconciler")?;

            info!("Graceful shutdown completed successfully");
            Ok(())
        }
    }
}
