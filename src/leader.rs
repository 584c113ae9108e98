// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Leader-election gate for the singleton operator.
//!
//! A thin wrapper over a cluster Lease: [`acquire`] blocks until this
//! replica holds the lease, and [`LeaderGate::lost`] resolves when it no
//! longer does. Losing the lease is terminal: the caller exits so a fresh
//! election runs through process restart; the reconciler never runs outside
//! the gate.
//!
//! Leader transitions are emitted to the cluster event stream against the
//! Lease object.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use kube_lease_manager::{LeaseManager, LeaseManagerBuilder};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::metrics;

/// Leader election configuration.
pub struct Config {
    /// Name of the Lease object.
    pub lease_name: String,
    /// Namespace holding the Lease object.
    pub namespace: String,
    /// Identity written into the Lease while this replica leads.
    pub identity: String,
    /// Duration of the lease.
    pub lease_duration: Duration,
    /// Grace period used when renewing the lease.
    pub grace: Duration,
}

/// A held leader-election lease.
///
/// Dropping the gate stops lease renewal.
pub struct LeaderGate {
    leader_rx: watch::Receiver<bool>,
    recorder: Recorder,
    lease_reference: ObjectReference,
    _lease_handle: JoinHandle<Result<LeaseManager, kube_lease_manager::LeaseManagerError>>,
}

/// Block until this replica acquires the lease, then return the gate.
///
/// Emits a `started leading` event once leadership is acquired.
///
/// # Errors
///
/// Fails when the lease manager cannot be built or the leadership watch
/// channel closes before leadership is acquired.
pub async fn acquire(client: Client, config: Config) -> Result<LeaderGate> {
    info!(
        lease_name = %config.lease_name,
        namespace = %config.namespace,
        identity = %config.identity,
        lease_duration = ?config.lease_duration,
        "Starting leader election, waiting to acquire leadership..."
    );

    let lease_manager = LeaseManagerBuilder::new(client.clone(), &config.lease_name)
        .with_namespace(&config.namespace)
        .with_identity(&config.identity)
        .with_duration(config.lease_duration.as_secs())
        .with_grace(config.grace.as_secs())
        .build()
        .await
        .context("building lease manager")?;

    let (leader_rx, lease_handle) = lease_manager.watch().await;

    let mut rx = leader_rx.clone();
    while !*rx.borrow_and_update() {
        rx.changed()
            .await
            .context("leadership watch channel closed before leadership was acquired")?;
    }

    info!("Leadership acquired");
    metrics::set_leader(true);

    let reporter = Reporter {
        controller: "update-operator".to_string(),
        instance: Some(config.identity.clone()),
    };

    let gate = LeaderGate {
        leader_rx,
        recorder: Recorder::new(client, reporter),
        lease_reference: ObjectReference {
            api_version: Some("coordination.k8s.io/v1".to_string()),
            kind: Some("Lease".to_string()),
            name: Some(config.lease_name),
            namespace: Some(config.namespace),
            ..ObjectReference::default()
        },
        _lease_handle: lease_handle,
    };

    gate.publish_transition("started leading").await;

    Ok(gate)
}

impl LeaderGate {
    /// Resolve once leadership is lost.
    ///
    /// Emits a `stopped leading` event. The caller must treat this as a
    /// terminal condition and exit rather than re-acquire in-process.
    pub async fn lost(&mut self) -> Result<()> {
        loop {
            self.leader_rx
                .changed()
                .await
                .context("leadership watch channel closed")?;

            if !*self.leader_rx.borrow() {
                metrics::set_leader(false);
                self.publish_transition("stopped leading").await;

                return Ok(());
            }
        }
    }

    /// Publish a leader-transition event against the Lease object. Event
    /// delivery is best effort.
    async fn publish_transition(&self, note: &str) {
        let event = Event {
            type_: EventType::Normal,
            reason: "LeaderElection".to_string(),
            note: Some(note.to_string()),
            action: "LeaderElection".to_string(),
            secondary: None,
        };

        if let Err(e) = self.recorder.publish(&event, &self.lease_reference).await {
            warn!(error = %e, "Failed publishing leader-transition event");
        }
    }
}
