// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Drain executor: removal of pods from a node ahead of a reboot.
//!
//! Pod selection mimics `kubectl drain`, reduced to what a reboot needs:
//! mirror pods are skipped (they cannot be deleted through the API server),
//! pods owned by a live `DaemonSet` are skipped (the controller would
//! recreate them immediately), and the control-plane namespace is left
//! alone. The remainder is evicted through the graceful eviction subresource
//! when the cluster offers it, and deleted otherwise.
//!
//! Draining is preemptible: when the stop token fires while waiting for pod
//! termination, the executor returns [`DrainError::Cancelled`] promptly and
//! the caller skips the reboot.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, EvictParams, ListParams};
use kube::{Api, Client};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::constants::{MIRROR_POD_ANNOTATION, PROTECTED_NAMESPACE};

/// Error returned by the drain executor.
#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    /// The stop signal fired while draining; the reboot must not proceed.
    #[error("drain cancelled by stop signal")]
    Cancelled,

    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Capabilities the drain executor requires from the cluster's workload
/// APIs. Tests substitute an in-memory fake.
#[async_trait]
pub trait Workloads: Send + Sync {
    /// List all pods bound to the given node.
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>, kube::Error>;

    /// Fetch a pod, returning `None` when it does not exist.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, kube::Error>;

    /// Whether the named `DaemonSet` exists.
    async fn daemon_set_exists(&self, namespace: &str, name: &str) -> Result<bool, kube::Error>;

    /// Evict a pod through the graceful eviction subresource.
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// Delete a pod directly.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;
}

/// [`Workloads`] implementation backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeWorkloads {
    client: Client,
}

impl KubeWorkloads {
    /// Create a workload store from a Kubernetes client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Workloads for KubeWorkloads {
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>, kube::Error> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));

        Ok(api.list(&params).await?.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, kube::Error> {
        self.pods(namespace).get_opt(name).await
    }

    async fn daemon_set_exists(&self, namespace: &str, name: &str) -> Result<bool, kube::Error> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);

        Ok(api.get_opt(name).await?.is_some())
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.pods(namespace)
            .evict(name, &EvictParams::default())
            .await?;

        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await?;

        Ok(())
    }
}

/// Select the pods on `node` that must be removed before a reboot.
///
/// # Errors
///
/// Fails when pods cannot be listed or a `DaemonSet` owner lookup fails for
/// a reason other than the owner being gone.
pub async fn pods_for_deletion<W: Workloads + ?Sized>(
    workloads: &W,
    node: &str,
) -> Result<Vec<Pod>> {
    let pods = workloads
        .list_pods_on_node(node)
        .await
        .with_context(|| format!("listing pods on node {node:?}"))?;

    let mut selected = Vec::new();

    for pod in pods {
        // Mirror pods are materialized from host manifests and cannot be
        // deleted through the API server.
        if pod
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION))
        {
            continue;
        }

        // Skipping the control-plane namespace is a simple way to avoid
        // evicting critical components such as the scheduler and the
        // controller manager.
        if pod.metadata.namespace.as_deref() == Some(PROTECTED_NAMESPACE) {
            continue;
        }

        if has_live_daemon_set_owner(workloads, &pod).await? {
            continue;
        }

        selected.push(pod);
    }

    Ok(selected)
}

/// Whether the pod is owned by a `DaemonSet` that still exists. Such pods
/// would be recreated right after deletion, so removing them is futile.
async fn has_live_daemon_set_owner<W: Workloads + ?Sized>(
    workloads: &W,
    pod: &Pod,
) -> Result<bool> {
    let Some(owners) = pod.metadata.owner_references.as_ref() else {
        return Ok(false);
    };

    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();

    for owner in owners {
        if owner.kind != "DaemonSet" {
            continue;
        }

        let exists = workloads
            .daemon_set_exists(namespace, &owner.name)
            .await
            .with_context(|| {
                format!(
                    "looking up DaemonSet owner {:?} of pod {:?}",
                    owner.name, pod.metadata.name
                )
            })?;

        if exists {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Evict or delete the given pods and wait for them to terminate.
///
/// Per-pod failures are logged and do not abort the drain; the reboot will
/// terminate surviving pods anyway. A pod that has not disappeared within
/// `grace_period` is skipped with a warning.
///
/// # Errors
///
/// Returns [`DrainError::Cancelled`] as soon as `stop` fires while waiting
/// for termination.
pub async fn drain_pods<W: Workloads + ?Sized>(
    workloads: &W,
    pods: &[Pod],
    grace_period: Duration,
    poll_interval: Duration,
    stop: &CancellationToken,
) -> Result<(), DrainError> {
    info!(count = pods.len(), "Deleting pods");

    for pod in pods {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let name = pod.metadata.name.as_deref().unwrap_or_default();

        info!(pod = name, namespace = namespace, "Terminating pod");

        if let Err(e) = evict_or_delete(workloads, namespace, name).await {
            // Continue anyway, the reboot should terminate it.
            error!(pod = name, namespace = namespace, error = %e, "Failed terminating pod");
        }
    }

    let waits = pods.iter().map(|pod| async {
        let name = pod.metadata.name.as_deref().unwrap_or_default();

        match tokio::time::timeout(
            grace_period,
            wait_for_pod_gone(workloads, pod, poll_interval, stop),
        )
        .await
        {
            Ok(Ok(())) => {
                info!(pod = name, "Deleted pod");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(pod = name, "Timed out waiting for pod to terminate, skipping");
                Ok(())
            }
        }
    });

    for result in join_all(waits).await {
        result?;
    }

    Ok(())
}

async fn evict_or_delete<W: Workloads + ?Sized>(
    workloads: &W,
    namespace: &str,
    name: &str,
) -> Result<(), kube::Error> {
    match workloads.evict_pod(namespace, name).await {
        Ok(()) => Ok(()),
        // The eviction subresource is not available on this cluster; fall
        // back to a plain delete.
        Err(kube::Error::Api(ae)) if ae.code == 404 || ae.code == 405 => {
            workloads.delete_pod(namespace, name).await
        }
        Err(e) => Err(e),
    }
}

/// Poll until the pod is gone or was replaced by a new incarnation (same
/// name, different UID).
async fn wait_for_pod_gone<W: Workloads + ?Sized>(
    workloads: &W,
    pod: &Pod,
    poll_interval: Duration,
    stop: &CancellationToken,
) -> Result<(), DrainError> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let name = pod.metadata.name.as_deref().unwrap_or_default();

    loop {
        match workloads.get_pod(namespace, name).await {
            Ok(None) => return Ok(()),
            Ok(Some(current)) if current.metadata.uid != pod.metadata.uid => return Ok(()),
            Ok(Some(_)) => {}
            // Most errors will be transient. Log the error and continue
            // polling.
            Err(e) => {
                warn!(pod = name, namespace = namespace, error = %e, "Failed to get pod");
            }
        }

        tokio::select! {
            () = stop.cancelled() => return Err(DrainError::Cancelled),
            () = tokio::time::sleep(poll_interval) => {}
        }
    }
}

#[cfg(test)]
#[path = "drain_tests.rs"]
mod drain_tests;
