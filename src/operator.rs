// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! The update-operator reconciler.
//!
//! Every reconciliation period the operator lists the cluster's nodes and
//! applies five ordered phases to the coordination state:
//!
//! 1. **cleanup**: retract before-reboot scheduling from nodes that no
//!    longer need (or are paused from) rebooting.
//! 2. **finish-after-reboot**: retire completed reboot cycles once every
//!    configured after-reboot hook annotation reports `"true"`.
//! 3. **schedule-after-reboot**: arm the after-reboot hooks on nodes that
//!    just came back from a reboot.
//! 4. **confirm-before-reboot**: grant reboot permission once every
//!    configured before-reboot hook annotation reports `"true"`.
//! 5. **admit**: while the reboot window is open and the pipeline has
//!    capacity, schedule more nodes that want to reboot.
//!
//! Any list or write failure aborts the cycle; the next cycle re-evaluates
//! from scratch. The protocol is shaped so that partial progress is always
//! safe.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Node;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::labels::{
    ANNOTATION_OK_TO_REBOOT, ANNOTATION_REBOOT_IN_PROGRESS, ANNOTATION_REBOOT_NEEDED,
    ANNOTATION_REBOOT_PAUSED, FALSE, LABEL_AFTER_REBOOT, LABEL_BEFORE_REBOOT, TRUE,
};
use crate::metrics;
use crate::nodes::{update_node_retry, Nodes};
use crate::reboot_window::RebootWindow;
use crate::retry::retry_api_call;
use crate::selector::{
    all_annotations_true, annotation_is_true, filter_nodes_by_label_true, label_is_true,
};

/// Configurable options for the operator.
pub struct Config {
    /// Node store used for all coordination reads and writes.
    pub nodes: Arc<dyn Nodes>,
    /// Annotations that must all be `"true"` before a scheduled node is
    /// granted permission to reboot.
    pub before_reboot_annotations: Vec<String>,
    /// Annotations that must all be `"true"` before a rebooted node's cycle
    /// is retired.
    pub after_reboot_annotations: Vec<String>,
    /// Reboot window start, e.g. `"Mon 14:00"` or `"11:00"`. Empty means the
    /// window is always open.
    pub reboot_window_start: String,
    /// Reboot window length, e.g. `"1h30m"`.
    pub reboot_window_length: String,
    /// Delay between reconciliation cycles.
    pub reconciliation_period: Duration,
    /// Maximum number of nodes in the reboot pipeline at once.
    pub max_rebooting_nodes: usize,
}

/// The singleton reboot coordinator. Must only run while holding the
/// leader-election lease.
pub struct Operator {
    nodes: Arc<dyn Nodes>,
    before_reboot_annotations: Vec<String>,
    after_reboot_annotations: Vec<String>,
    reboot_window: Option<RebootWindow>,
    reconciliation_period: Duration,
    max_rebooting_nodes: usize,
}

impl Operator {
    /// Create an operator from its configuration.
    ///
    /// # Errors
    ///
    /// Fails when the reboot window cannot be parsed.
    pub fn new(config: Config) -> Result<Self> {
        let reboot_window = RebootWindow::parse(
            &config.reboot_window_start,
            &config.reboot_window_length,
        )
        .context("parsing reboot window")?;

        Ok(Self {
            nodes: config.nodes,
            before_reboot_annotations: config.before_reboot_annotations,
            after_reboot_annotations: config.after_reboot_annotations,
            reboot_window,
            reconciliation_period: config.reconciliation_period,
            max_rebooting_nodes: config.max_rebooting_nodes,
        })
    }

    /// Reconcile in a loop until `stop` fires.
    ///
    /// A failing cycle is logged and fully abandoned; the next cycle starts
    /// from a fresh view of the cluster.
    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        info!(
            period = ?self.reconciliation_period,
            max_rebooting_nodes = self.max_rebooting_nodes,
            "Starting reconciliation loop"
        );

        let mut ticks = tokio::time::interval(self.reconciliation_period);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = stop.cancelled() => {
                    info!("Stopping reconciliation loop");
                    return Ok(());
                }
                _ = ticks.tick() => {
                    let started = std::time::Instant::now();

                    match self.process().await {
                        Ok(()) => metrics::record_reconcile_cycle(true, started.elapsed()),
                        Err(e) => {
                            error!(error = %e, "Reconciliation cycle failed");
                            metrics::record_reconcile_cycle(false, started.elapsed());
                        }
                    }
                }
            }
        }
    }

    /// Run one reconciliation cycle: all five phases, in order.
    ///
    /// # Errors
    ///
    /// The first failing list or write aborts the cycle.
    pub async fn process(&self) -> Result<()> {
        debug!("Starting reconciliation cycle");

        self.cleanup_unrebootable_nodes()
            .await
            .context("cleanup phase")?;
        self.finish_after_reboot()
            .await
            .context("finish-after-reboot phase")?;
        self.schedule_after_reboot_hooks()
            .await
            .context("schedule-after-reboot phase")?;
        self.confirm_before_reboot_hooks()
            .await
            .context("confirm-before-reboot phase")?;
        self.admit_rebootable_nodes().await.context("admit phase")?;

        debug!("Finished reconciliation cycle");

        Ok(())
    }

    /// List all nodes, retrying transient API errors.
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes = self.nodes.as_ref();

        retry_api_call(move || nodes.list(), "list nodes")
            .await
            .context("listing nodes")
    }

    /// Phase 1: retract before-reboot scheduling from nodes that no longer
    /// want a reboot, or whose reboot an administrator paused.
    ///
    /// The before-reboot label selects pre-reboot hook workloads, so it must
    /// only remain on nodes that may start rebooting any minute. Permission
    /// is deliberately NOT granted here, even when every hook reported done:
    /// the node asked for the reboot to be cancelled.
    async fn cleanup_unrebootable_nodes(&self) -> Result<()> {
        let nodes = self.list_nodes().await?;

        let stale: Vec<&Node> = filter_nodes_by_label_true(&nodes, LABEL_BEFORE_REBOOT)
            .into_iter()
            .filter(|node| {
                !annotation_is_true(node, ANNOTATION_REBOOT_NEEDED)
                    || annotation_is_true(node, ANNOTATION_REBOOT_PAUSED)
            })
            .collect();

        for node in stale {
            let name = node_name(node);
            info!(
                phase = "cleanup",
                node = name,
                "Node no longer needs a reboot, retracting before-reboot state"
            );

            update_node_retry(self.nodes.as_ref(), name, |node| {
                remove_label(node, LABEL_BEFORE_REBOOT);
                remove_annotations(node, &self.before_reboot_annotations);
            })
            .await?;
        }

        Ok(())
    }

    /// Phase 2: retire the reboot cycle of nodes whose after-reboot hooks
    /// have all reported done. This is the terminal step: clearing
    /// `reboot-ok` releases the agent's permission wait and frees pipeline
    /// capacity.
    async fn finish_after_reboot(&self) -> Result<()> {
        let nodes = self.list_nodes().await?;

        let finished: Vec<&Node> = filter_nodes_by_label_true(&nodes, LABEL_AFTER_REBOOT)
            .into_iter()
            .filter(|node| all_annotations_true(node, &self.after_reboot_annotations))
            .collect();

        for node in finished {
            let name = node_name(node);
            info!(
                phase = "finish-after-reboot",
                node = name,
                "After-reboot hooks completed, finishing reboot cycle"
            );

            update_node_retry(self.nodes.as_ref(), name, |node| {
                remove_label(node, LABEL_AFTER_REBOOT);
                remove_annotations(node, &self.after_reboot_annotations);
                set_annotation(node, ANNOTATION_OK_TO_REBOOT, FALSE);
            })
            .await?;
        }

        Ok(())
    }

    /// Phase 3: arm after-reboot hooks on nodes that just came back from a
    /// reboot: permission still granted, but the agent has reset its
    /// reboot-needed and reboot-in-progress markers.
    async fn schedule_after_reboot_hooks(&self) -> Result<()> {
        let nodes = self.list_nodes().await?;

        let just_rebooted: Vec<&Node> = nodes
            .iter()
            .filter(|node| {
                annotation_is_true(node, ANNOTATION_OK_TO_REBOOT)
                    && !annotation_is_true(node, ANNOTATION_REBOOT_NEEDED)
                    && !annotation_is_true(node, ANNOTATION_REBOOT_IN_PROGRESS)
                    && !label_is_true(node, LABEL_AFTER_REBOOT)
            })
            .collect();

        for node in just_rebooted {
            let name = node_name(node);
            info!(
                phase = "schedule-after-reboot",
                node = name,
                "Node came back from reboot, scheduling after-reboot hooks"
            );

            update_node_retry(self.nodes.as_ref(), name, |node| {
                set_label(node, LABEL_AFTER_REBOOT, TRUE);
                remove_annotations(node, &self.after_reboot_annotations);
            })
            .await?;
        }

        Ok(())
    }

    /// Phase 4: grant reboot permission to scheduled nodes whose
    /// before-reboot hooks have all reported done. Removing the
    /// before-reboot label de-schedules the hook workloads.
    async fn confirm_before_reboot_hooks(&self) -> Result<()> {
        let nodes = self.list_nodes().await?;

        let ready: Vec<&Node> = filter_nodes_by_label_true(&nodes, LABEL_BEFORE_REBOOT)
            .into_iter()
            .filter(|node| all_annotations_true(node, &self.before_reboot_annotations))
            .collect();

        for node in ready {
            let name = node_name(node);
            info!(
                phase = "confirm-before-reboot",
                node = name,
                "Before-reboot hooks completed, granting permission to reboot"
            );

            update_node_retry(self.nodes.as_ref(), name, |node| {
                remove_label(node, LABEL_BEFORE_REBOOT);
                remove_annotations(node, &self.before_reboot_annotations);
                set_annotation(node, ANNOTATION_OK_TO_REBOOT, TRUE);
            })
            .await?;
        }

        Ok(())
    }

    /// Phase 5: admit more nodes into the reboot pipeline, up to the
    /// configured bound, while the reboot window is open. Candidates are
    /// taken in name order so a single cycle is deterministic.
    async fn admit_rebootable_nodes(&self) -> Result<()> {
        let nodes = self.list_nodes().await?;

        let rebooting = nodes.iter().filter(|node| in_pipeline(node)).count();
        metrics::set_nodes_in_pipeline(rebooting);

        if rebooting >= self.max_rebooting_nodes {
            debug!(
                phase = "admit",
                rebooting = rebooting,
                "Maximum number of rebooting nodes reached, deferring admissions"
            );
            return Ok(());
        }

        if let Some(window) = &self.reboot_window {
            if !window.is_open_now() {
                debug!(phase = "admit", "Reboot window closed, deferring admissions");
                return Ok(());
            }
        }

        let mut candidates: Vec<&Node> = nodes
            .iter()
            .filter(|node| {
                annotation_is_true(node, ANNOTATION_REBOOT_NEEDED)
                    && !annotation_is_true(node, ANNOTATION_REBOOT_PAUSED)
                    && !in_pipeline(node)
            })
            .collect();
        candidates.sort_by(|a, b| node_name(a).cmp(node_name(b)));

        let capacity = self.max_rebooting_nodes - rebooting;

        for node in candidates.into_iter().take(capacity) {
            let name = node_name(node);
            info!(phase = "admit", node = name, "Scheduling node for reboot");

            update_node_retry(self.nodes.as_ref(), name, |node| {
                set_label(node, LABEL_BEFORE_REBOOT, TRUE);
                remove_annotations(node, &self.before_reboot_annotations);
            })
            .await?;
        }

        Ok(())
    }
}

/// Whether the node occupies a reboot pipeline slot: scheduled, permitted,
/// or actively rebooting. Nodes merely running after-reboot hooks keep their
/// slot only through the permission annotation, which phase 2 clears.
fn in_pipeline(node: &Node) -> bool {
    label_is_true(node, LABEL_BEFORE_REBOOT)
        || annotation_is_true(node, ANNOTATION_OK_TO_REBOOT)
        || annotation_is_true(node, ANNOTATION_REBOOT_IN_PROGRESS)
}

fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or_default()
}

fn set_annotation(node: &mut Node, key: &str, value: &str) {
    node.metadata
        .annotations
        .get_or_insert_default()
        .insert(key.to_string(), value.to_string());
}

fn set_label(node: &mut Node, key: &str, value: &str) {
    node.metadata
        .labels
        .get_or_insert_default()
        .insert(key.to_string(), value.to_string());
}

fn remove_label(node: &mut Node, key: &str) {
    if let Some(labels) = node.metadata.labels.as_mut() {
        labels.remove(key);
    }
}

fn remove_annotations(node: &mut Node, keys: &[String]) {
    if let Some(annotations) = node.metadata.annotations.as_mut() {
        for key in keys {
            annotations.remove(key);
        }
    }
}

#[cfg(test)]
#[path = "operator_tests.rs"]
mod operator_tests;
