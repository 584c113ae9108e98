// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! The update-agent: a per-node daemon reconciling local host state with the
//! coordination fields on the node object.
//!
//! The agent watches the host update engine for status updates, propagates
//! them to the operator via node labels and annotations, and reacts to the
//! operator's decision about when to drain the node and reboot to finish the
//! upgrade. It survives process restarts by recovering from whatever state
//! the node's coordination fields describe.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::drain::{self, DrainError, Workloads};
use crate::host_info;
use crate::labels::{
    ANNOTATION_AGENT_MADE_UNSCHEDULABLE, ANNOTATION_LAST_CHECKED_TIME, ANNOTATION_NEW_VERSION,
    ANNOTATION_OK_TO_REBOOT, ANNOTATION_REBOOT_IN_PROGRESS, ANNOTATION_REBOOT_NEEDED,
    ANNOTATION_STATUS, FALSE, LABEL_GROUP, LABEL_ID, LABEL_REBOOT_NEEDED, LABEL_VERSION, TRUE,
};
use crate::nodes::{
    get_node_retry, set_node_annotations, set_node_annotations_labels, set_node_labels,
    set_node_unschedulable, string_map, Nodes,
};
use crate::selector::{annotation_is_true, annotations};
use crate::update_engine::{Status, UPDATE_STATUS_UPDATED_NEED_REBOOT};

/// How long the agent parks after triggering the reboot before giving up on
/// the host actually going down.
const REBOOT_PARK_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Capability of receiving status updates from the host update engine.
///
/// Implemented by [`crate::update_engine::Client`]; tests substitute a
/// scripted source.
#[async_trait]
pub trait StatusReceiver: Send + Sync {
    /// Send the current status once, then forward every status change onto
    /// `tx` until `stop` fires.
    async fn receive_statuses(
        &self,
        tx: mpsc::Sender<Status>,
        stop: CancellationToken,
    ) -> Result<()>;
}

/// Capability of rebooting the host machine.
///
/// Implemented by [`crate::login1::LogindRebooter`]; tests substitute a
/// recorder.
#[async_trait]
pub trait Rebooter: Send + Sync {
    /// Reboot the host. `interactive` controls whether the session manager
    /// may prompt for authentication.
    async fn reboot(&self, interactive: bool) -> Result<()>;
}

/// Configurable options and collaborators for the agent.
pub struct Config {
    /// Name of the node this agent runs on.
    pub node_name: String,
    /// Node store used for all coordination reads and writes.
    pub nodes: Arc<dyn Nodes>,
    /// Workload APIs used by the drain executor.
    pub workloads: Arc<dyn Workloads>,
    /// Source of update engine statuses.
    pub status_receiver: Arc<dyn StatusReceiver>,
    /// Host reboot trigger.
    pub rebooter: Arc<dyn Rebooter>,
    /// Per-pod grace period when waiting for drained pods to terminate.
    pub pod_deletion_grace_period: Duration,
    /// Fixed interval between retries of status writes and drain polls.
    pub poll_interval: Duration,
    /// How long to wait for the operator to react before giving up.
    pub max_operator_response_time: Duration,
    /// Filesystem prefix for the host configuration files. Empty in
    /// production; tests point it at a scratch directory.
    pub host_files_prefix: PathBuf,
}

/// The per-node agent.
pub struct Agent {
    node_name: String,
    nodes: Arc<dyn Nodes>,
    workloads: Arc<dyn Workloads>,
    status_receiver: Arc<dyn StatusReceiver>,
    rebooter: Arc<dyn Rebooter>,
    grace_period: Duration,
    poll_interval: Duration,
    max_operator_response_time: Duration,
    host_files_prefix: PathBuf,
}

impl Agent {
    /// Create an agent from its configuration.
    ///
    /// # Errors
    ///
    /// Fails when the node name is empty.
    pub fn new(config: Config) -> Result<Self> {
        if config.node_name.is_empty() {
            bail!("node name can't be empty");
        }

        Ok(Self {
            node_name: config.node_name,
            nodes: config.nodes,
            workloads: config.workloads,
            status_receiver: config.status_receiver,
            rebooter: config.rebooter,
            grace_period: config.pod_deletion_grace_period,
            poll_interval: config.poll_interval,
            max_operator_response_time: config.max_operator_response_time,
            host_files_prefix: config.host_files_prefix,
        })
    }

    /// Run the agent until the node reboots or `stop` fires.
    ///
    /// The agent process is expected to reboot the node, so there is no
    /// outer loop: one pass resets recovery state, waits for permission,
    /// drains and reboots.
    ///
    /// # Errors
    ///
    /// Any failure to read or write the node's coordination state is fatal;
    /// the supervisor restarts the agent and recovery runs from scratch.
    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        info!("Setting info labels");
        self.set_info_labels()
            .await
            .context("setting node info labels")?;

        info!("Checking annotations");
        let node = get_node_retry(self.nodes.as_ref(), &self.node_name).await?;

        // Only make the node schedulable again if we were the ones who made
        // it unschedulable. This prevents undoing a cordon placed by
        // something other than the agent.
        let made_unschedulable = annotations(&node)
            .get(ANNOTATION_AGENT_MADE_UNSCHEDULABLE)
            .cloned();
        let make_schedulable = made_unschedulable.as_deref() == Some(TRUE);

        let reset_annotations = string_map(&[
            (ANNOTATION_REBOOT_IN_PROGRESS, FALSE),
            (ANNOTATION_REBOOT_NEEDED, FALSE),
        ]);
        let reset_labels = string_map(&[(LABEL_REBOOT_NEEDED, FALSE)]);

        info!(annotations = ?reset_annotations, "Setting annotations");
        set_node_annotations_labels(
            self.nodes.as_ref(),
            &self.node_name,
            &reset_annotations,
            &reset_labels,
        )
        .await
        .context("resetting coordination state")?;

        // Since reboot-needed was just cleared, the operator should clear
        // reboot-ok. Wait for it to do so, else we might start
        // reboot-looping.
        tokio::select! {
            () = stop.cancelled() => return Ok(()),
            result = tokio::time::timeout(
                self.max_operator_response_time,
                self.wait_for_not_ok_to_reboot(),
            ) => {
                result
                    .map_err(|_| {
                        anyhow::anyhow!(
                            "operator did not clear reboot permission within {:?}; \
                             is the update-operator running?",
                            self.max_operator_response_time
                        )
                    })?
                    .context("waiting for the operator to clear reboot permission")?;
            }
        }

        if make_schedulable {
            // We are schedulable now.
            info!("Marking node as schedulable");
            set_node_unschedulable(self.nodes.as_ref(), &self.node_name, false)
                .await
                .context("marking node as schedulable")?;

            let cleared = string_map(&[(ANNOTATION_AGENT_MADE_UNSCHEDULABLE, FALSE)]);
            set_node_annotations(self.nodes.as_ref(), &self.node_name, &cleared)
                .await
                .context("clearing agent-made-unschedulable annotation")?;
        } else if made_unschedulable.is_some() {
            info!("Skipping marking node as schedulable, it was made unschedulable by an external party");
        }

        // Watch the update engine for status updates on background tasks.
        let (status_tx, status_rx) = mpsc::channel(1);

        let receiver = Arc::clone(&self.status_receiver);
        let receiver_stop = stop.child_token();
        tokio::spawn(async move {
            if let Err(e) = receiver.receive_statuses(status_tx, receiver_stop).await {
                error!(error = %e, "Update engine status receiver failed");
            }
        });

        tokio::spawn(watch_update_status(
            Arc::clone(&self.nodes),
            self.node_name.clone(),
            status_rx,
            self.poll_interval,
            stop.child_token(),
        ));

        // Block until the operator grants permission to reboot.
        loop {
            info!("Waiting for ok-to-reboot from the operator...");

            tokio::select! {
                () = stop.cancelled() => return Ok(()),
                result = tokio::time::timeout(
                    self.max_operator_response_time,
                    self.wait_for_ok_to_reboot(),
                ) => {
                    match result {
                        Ok(Ok(())) => break,
                        Ok(Err(e)) => warn!(error = %e, "Error waiting for ok-to-reboot"),
                        // Not fatal: reboot-needed may have been set
                        // concurrently with an operator cycle; the operator
                        // will observe it eventually.
                        Err(_) => warn!(
                            timeout = ?self.max_operator_response_time,
                            "No ok-to-reboot from the operator yet"
                        ),
                    }
                }
            }
        }

        info!("Checking if node is already unschedulable");
        let node = get_node_retry(self.nodes.as_ref(), &self.node_name).await?;
        let already_unschedulable = node
            .spec
            .as_ref()
            .and_then(|spec| spec.unschedulable)
            .unwrap_or(false);

        // Confirm the reboot in a single write, remembering whether the
        // cordon is ours to undo.
        let mut confirm = string_map(&[(ANNOTATION_REBOOT_IN_PROGRESS, TRUE)]);
        if !already_unschedulable {
            confirm.insert(ANNOTATION_AGENT_MADE_UNSCHEDULABLE.to_string(), TRUE.to_string());
        }

        info!(annotations = ?confirm, "Setting annotations");
        set_node_annotations(self.nodes.as_ref(), &self.node_name, &confirm)
            .await
            .context("confirming reboot")?;

        if already_unschedulable {
            info!("Node already marked as unschedulable");
        } else {
            info!("Marking node as unschedulable");
            set_node_unschedulable(self.nodes.as_ref(), &self.node_name, true)
                .await
                .context("marking node as unschedulable")?;
        }

        info!("Getting pod list for deletion");
        let pods = drain::pods_for_deletion(self.workloads.as_ref(), &self.node_name)
            .await
            .context("getting list of pods for deletion")?;

        match drain::drain_pods(
            self.workloads.as_ref(),
            &pods,
            self.grace_period,
            self.poll_interval,
            &stop,
        )
        .await
        {
            Ok(()) => {}
            Err(DrainError::Cancelled) => {
                info!("Drain interrupted by shutdown, skipping reboot");
                return Ok(());
            }
            Err(DrainError::Other(e)) => return Err(e.context("draining node")),
        }

        info!("Node drained, rebooting");
        self.rebooter
            .reboot(false)
            .await
            .context("triggering host reboot")?;

        // The host is going down; park until it does.
        tokio::select! {
            () = stop.cancelled() => {}
            () = tokio::time::sleep(REBOOT_PARK_TIMEOUT) => {}
        }

        Ok(())
    }

    /// Label the node with identifying information about the host OS.
    async fn set_info_labels(&self) -> Result<()> {
        let info = host_info::version_info(&self.host_files_prefix)
            .context("getting host version info")?;

        let labels: BTreeMap<String, String> = [
            (LABEL_ID.to_string(), info.id),
            (LABEL_GROUP.to_string(), info.group),
            (LABEL_VERSION.to_string(), info.version),
        ]
        .into();

        set_node_labels(self.nodes.as_ref(), &self.node_name, &labels).await
    }

    /// Wait for both `reboot-ok` and `reboot-needed` to be `"true"`.
    async fn wait_for_ok_to_reboot(&self) -> Result<()> {
        self.wait_for_node(|node| {
            annotation_is_true(node, ANNOTATION_OK_TO_REBOOT)
                && annotation_is_true(node, ANNOTATION_REBOOT_NEEDED)
        })
        .await
    }

    /// Wait for `reboot-ok` to be anything but `"true"`.
    ///
    /// The operator only ever matches on the exact literal, so the correct
    /// condition is the inverse of what it checks, not an explicit
    /// `"false"`.
    async fn wait_for_not_ok_to_reboot(&self) -> Result<()> {
        self.wait_for_node(|node| !annotation_is_true(node, ANNOTATION_OK_TO_REBOOT))
            .await
    }

    /// Read-then-watch the agent's node until `condition` holds.
    async fn wait_for_node<F>(&self, condition: F) -> Result<()>
    where
        F: Fn(&k8s_openapi::api::core::v1::Node) -> bool + Send,
    {
        let node = self
            .nodes
            .get(&self.node_name)
            .await
            .with_context(|| format!("getting node {:?}", self.node_name))?;

        if condition(&node) {
            return Ok(());
        }

        let mut watch = self
            .nodes
            .watch(&self.node_name)
            .await
            .with_context(|| format!("watching node {:?}", self.node_name))?;

        while let Some(node) = watch.next().await {
            let node = node.context("receiving node watch event")?;

            if condition(&node) {
                return Ok(());
            }
        }

        bail!("node watch ended while waiting for a coordination state change")
    }
}

/// Receive statuses from the listener channel and mirror each distinct
/// status transition onto the node.
async fn watch_update_status(
    nodes: Arc<dyn Nodes>,
    node_name: String,
    mut statuses: mpsc::Receiver<Status>,
    poll_interval: Duration,
    stop: CancellationToken,
) {
    info!("Beginning to watch update engine status");

    let mut last_operation = String::new();

    while let Some(status) = statuses.recv().await {
        if status.current_operation == last_operation {
            continue;
        }
        last_operation = status.current_operation.clone();

        update_status_annotations(nodes.as_ref(), &node_name, &status, poll_interval, &stop)
            .await;

        if stop.is_cancelled() {
            return;
        }
    }
}

/// Mirror one update engine status onto the node, retrying at a fixed
/// interval until the write succeeds or the agent shuts down.
async fn update_status_annotations(
    nodes: &dyn Nodes,
    node_name: &str,
    status: &Status,
    poll_interval: Duration,
    stop: &CancellationToken,
) {
    info!(status = %status, "Updating node status annotations");

    let mut annotations = BTreeMap::from([
        (
            ANNOTATION_STATUS.to_string(),
            status.current_operation.clone(),
        ),
        (
            ANNOTATION_LAST_CHECKED_TIME.to_string(),
            status.last_checked_time.to_string(),
        ),
        (
            ANNOTATION_NEW_VERSION.to_string(),
            status.new_version.clone(),
        ),
    ]);
    let mut labels = BTreeMap::new();

    // Indicate we need a reboot.
    if status.current_operation == UPDATE_STATUS_UPDATED_NEED_REBOOT {
        info!("Indicating a reboot is needed");
        annotations.insert(ANNOTATION_REBOOT_NEEDED.to_string(), TRUE.to_string());
        labels.insert(LABEL_REBOOT_NEEDED.to_string(), TRUE.to_string());
    }

    loop {
        match set_node_annotations_labels(nodes, node_name, &annotations, &labels).await {
            Ok(()) => return,
            Err(e) => {
                error!(error = %e, "Failed updating node annotations and labels");
            }
        }

        tokio::select! {
            () = stop.cancelled() => return,
            () = tokio::time::sleep(poll_interval) => {}
        }
    }
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod agent_tests;
