// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Node access capability and compare-and-swap mutation helpers.
//!
//! Both coordination parties mutate the shared `Node` object under optimistic
//! concurrency control. The [`Nodes`] trait captures exactly the capabilities
//! the protocol needs (get, list, update, watch) so that tests can
//! substitute an in-memory store for the API server.
//!
//! Every mutation helper in this module performs the read-modify-write in a
//! single update call per attempt, retrying on conflict, so that no
//! intermediate state is ever observable by the other party.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::api::{ListParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::retry::{default_backoff, is_conflict, is_retryable_error, retry_api_call};

/// Capabilities the coordination protocol requires from the cluster's node
/// store.
///
/// The production implementation is [`KubeNodes`]; tests use an in-memory
/// fake.
#[async_trait]
pub trait Nodes: Send + Sync {
    /// Fetch a node by name.
    async fn get(&self, name: &str) -> Result<Node, kube::Error>;

    /// List all nodes in the cluster.
    async fn list(&self) -> Result<Vec<Node>, kube::Error>;

    /// Submit an updated node object. The update is compare-and-swap against
    /// the object's resource version and fails with a conflict when stale.
    async fn update(&self, node: &Node) -> Result<Node, kube::Error>;

    /// Watch a single node for changes. The returned stream yields the full
    /// object on every modification, starting from the current state.
    async fn watch(&self, name: &str) -> Result<BoxStream<'static, Result<Node>>>;
}

/// [`Nodes`] implementation backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeNodes {
    api: Api<Node>,
}

impl KubeNodes {
    /// Create a node store from a Kubernetes client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl Nodes for KubeNodes {
    async fn get(&self, name: &str) -> Result<Node, kube::Error> {
        self.api.get(name).await
    }

    async fn list(&self) -> Result<Vec<Node>, kube::Error> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    async fn update(&self, node: &Node) -> Result<Node, kube::Error> {
        let name = node.metadata.name.as_deref().unwrap_or_default();

        self.api.replace(name, &PostParams::default(), node).await
    }

    async fn watch(&self, name: &str) -> Result<BoxStream<'static, Result<Node>>> {
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));

        let stream = watcher(self.api.clone(), config)
            .applied_objects()
            .map_err(anyhow::Error::from)
            .boxed();

        Ok(stream)
    }
}

/// Fetch a node, retrying transient API errors.
///
/// # Errors
///
/// Returns an error when the node cannot be fetched within the retry budget.
pub async fn get_node_retry<N: Nodes + ?Sized>(nodes: &N, name: &str) -> Result<Node> {
    retry_api_call(move || nodes.get(name), "get node")
        .await
        .with_context(|| format!("getting node {name:?}"))
}

/// Update a node by applying `mutate` to a freshly fetched object.
///
/// The closure is re-applied to a fresh copy on every attempt, since the
/// object will likely have changed if a retry is necessary. Conflicts and
/// transient API errors are retried with bounded exponential backoff; other
/// errors fail immediately.
///
/// # Errors
///
/// Returns an error when the node cannot be fetched, a non-retryable error
/// occurs, or the retry budget is exhausted.
pub async fn update_node_retry<N, F>(nodes: &N, name: &str, mut mutate: F) -> Result<Node>
where
    N: Nodes + ?Sized,
    F: FnMut(&mut Node) + Send,
{
    let mut backoff = default_backoff();
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match nodes.get(name).await {
            Ok(mut node) => {
                mutate(&mut node);

                nodes.update(&node).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(node) => return Ok(node),
            Err(e) if is_retryable_error(&e) => match backoff.next_backoff() {
                Some(duration) => {
                    // Conflicts are routine under contention; anything else
                    // retryable is worth a warning.
                    if is_conflict(&e) {
                        debug!(node = name, attempt = attempt, "Conflict updating node, retrying");
                    } else {
                        warn!(
                            node = name,
                            attempt = attempt,
                            retry_after = ?duration,
                            error = %e,
                            "Retryable error updating node, will retry"
                        );
                    }
                    tokio::time::sleep(duration).await;
                }
                None => {
                    return Err(anyhow::anyhow!(
                        "backoff exhausted after {attempt} attempts updating node {name:?}: {e}"
                    ));
                }
            },
            Err(e) => {
                return Err(e).with_context(|| format!("updating node {name:?}"));
            }
        }
    }
}

/// Set all keys in `annotations` on the node's annotations.
pub async fn set_node_annotations<N: Nodes + ?Sized>(
    nodes: &N,
    name: &str,
    annotations: &BTreeMap<String, String>,
) -> Result<()> {
    update_node_retry(nodes, name, |node| {
        insert_all(node.metadata.annotations.get_or_insert_default(), annotations);
    })
    .await?;

    Ok(())
}

/// Set all keys in `labels` on the node's labels.
pub async fn set_node_labels<N: Nodes + ?Sized>(
    nodes: &N,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> Result<()> {
    update_node_retry(nodes, name, |node| {
        insert_all(node.metadata.labels.get_or_insert_default(), labels);
    })
    .await?;

    Ok(())
}

/// Set annotations and labels in a single write, so the other party never
/// observes one without the other.
pub async fn set_node_annotations_labels<N: Nodes + ?Sized>(
    nodes: &N,
    name: &str,
    annotations: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> Result<()> {
    update_node_retry(nodes, name, |node| {
        insert_all(node.metadata.annotations.get_or_insert_default(), annotations);
        insert_all(node.metadata.labels.get_or_insert_default(), labels);
    })
    .await?;

    Ok(())
}

/// Mark the node schedulable or unschedulable.
pub async fn set_node_unschedulable<N: Nodes + ?Sized>(
    nodes: &N,
    name: &str,
    unschedulable: bool,
) -> Result<()> {
    update_node_retry(nodes, name, |node| {
        node.spec.get_or_insert_default().unschedulable = Some(unschedulable);
    })
    .await?;

    Ok(())
}

fn insert_all(target: &mut BTreeMap<String, String>, source: &BTreeMap<String, String>) {
    for (key, value) in source {
        target.insert(key.clone(), value.clone());
    }
}

/// Build a `BTreeMap` from string pairs. Shorthand used when assembling
/// annotation/label writes.
#[must_use]
pub fn string_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}
