// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! In-memory fakes for the coordination capability traits.
//!
//! These back the unit tests for the operator and the agent: a node store
//! with compare-and-swap semantics and watch support, a workload store for
//! drain tests, a recording rebooter, and a scripted status source.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::agent::{Rebooter, StatusReceiver};
use crate::drain::Workloads;
use crate::nodes::Nodes;
use crate::update_engine::Status;

fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    })
}

// ============================================================================
// FakeNodes
// ============================================================================

/// In-memory [`Nodes`] store with optimistic concurrency and watch support.
pub struct FakeNodes {
    state: Mutex<BTreeMap<String, Node>>,
    events: broadcast::Sender<Node>,
}

impl FakeNodes {
    /// Create a store seeded with the given nodes. Nodes get a resource
    /// version assigned if they lack one.
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);

        let state = nodes
            .into_iter()
            .map(|mut node| {
                node.metadata
                    .resource_version
                    .get_or_insert_with(|| "1".to_string());

                (
                    node.metadata.name.clone().unwrap_or_default(),
                    node,
                )
            })
            .collect();

        Arc::new(Self {
            state: Mutex::new(state),
            events,
        })
    }

    /// Fetch a stored node, panicking when it is missing. Test helper.
    pub fn node(&self, name: &str) -> Node {
        self.state
            .lock()
            .expect("fake node store lock")
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("node {name:?} not found in fake store"))
    }

    /// Overwrite a node, bypassing the resource-version check. Models an
    /// external actor (administrator, hook workload) mutating the object.
    pub fn put(&self, mut node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();

        {
            let mut state = self.state.lock().expect("fake node store lock");
            let version = state
                .get(&name)
                .and_then(|n| n.metadata.resource_version.clone())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            node.metadata.resource_version = Some((version + 1).to_string());
            state.insert(name, node.clone());
        }

        let _ = self.events.send(node);
    }

    /// Mutate a stored node in place through `mutate`, as [`put`](Self::put)
    /// does. Test helper for simulating hook workloads flipping annotations.
    pub fn mutate(&self, name: &str, mutate: impl FnOnce(&mut Node)) {
        let mut node = self.node(name);
        mutate(&mut node);
        self.put(node);
    }
}

#[async_trait]
impl Nodes for FakeNodes {
    async fn get(&self, name: &str) -> Result<Node, kube::Error> {
        self.state
            .lock()
            .expect("fake node store lock")
            .get(name)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound"))
    }

    async fn list(&self) -> Result<Vec<Node>, kube::Error> {
        Ok(self
            .state
            .lock()
            .expect("fake node store lock")
            .values()
            .cloned()
            .collect())
    }

    async fn update(&self, node: &Node) -> Result<Node, kube::Error> {
        let name = node.metadata.name.clone().unwrap_or_default();

        let updated = {
            let mut state = self.state.lock().expect("fake node store lock");

            let current = state
                .get(&name)
                .ok_or_else(|| api_error(404, "NotFound"))?;

            if current.metadata.resource_version != node.metadata.resource_version {
                return Err(api_error(409, "Conflict"));
            }

            let version = current
                .metadata
                .resource_version
                .as_deref()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);

            let mut updated = node.clone();
            updated.metadata.resource_version = Some((version + 1).to_string());
            state.insert(name, updated.clone());

            updated
        };

        let _ = self.events.send(updated.clone());

        Ok(updated)
    }

    async fn watch(&self, name: &str) -> Result<BoxStream<'static, Result<Node>>> {
        let events = self.events.subscribe();
        let current = self
            .state
            .lock()
            .expect("fake node store lock")
            .get(name)
            .cloned();
        let name = name.to_string();

        let stream = futures::stream::unfold(
            (events, current, name),
            |(mut events, mut pending, name)| async move {
                if let Some(node) = pending.take() {
                    return Some((Ok(node), (events, None, name)));
                }

                loop {
                    match events.recv().await {
                        Ok(node) => {
                            if node.metadata.name.as_deref() == Some(name.as_str()) {
                                return Some((Ok(node), (events, None, name)));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        )
        .boxed();

        Ok(stream)
    }
}

// ============================================================================
// FakeWorkloads
// ============================================================================

/// In-memory [`Workloads`] store for drain tests.
pub struct FakeWorkloads {
    pods: Mutex<Vec<Pod>>,
    daemon_sets: Vec<(String, String)>,
    evicted: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    /// When set, evictions fail with 404 as on clusters without the
    /// eviction subresource.
    pub eviction_unsupported: bool,
    /// When set, evicted/deleted pods stay visible, as when termination
    /// hangs.
    pub hold_terminations: bool,
}

impl FakeWorkloads {
    pub fn new(
        pods: impl IntoIterator<Item = Pod>,
        daemon_sets: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            pods: Mutex::new(pods.into_iter().collect()),
            daemon_sets: daemon_sets.into_iter().collect(),
            evicted: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            eviction_unsupported: false,
            hold_terminations: false,
        }
    }

    pub fn evicted(&self) -> Vec<String> {
        self.evicted.lock().expect("fake workloads lock").clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().expect("fake workloads lock").clone()
    }

    fn remove(&self, namespace: &str, name: &str) {
        if self.hold_terminations {
            return;
        }

        self.pods.lock().expect("fake workloads lock").retain(|pod| {
            pod.metadata.namespace.as_deref() != Some(namespace)
                || pod.metadata.name.as_deref() != Some(name)
        });
    }
}

#[async_trait]
impl Workloads for FakeWorkloads {
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>, kube::Error> {
        Ok(self
            .pods
            .lock()
            .expect("fake workloads lock")
            .iter()
            .filter(|pod| {
                pod.spec
                    .as_ref()
                    .and_then(|spec| spec.node_name.as_deref())
                    == Some(node)
            })
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, kube::Error> {
        Ok(self
            .pods
            .lock()
            .expect("fake workloads lock")
            .iter()
            .find(|pod| {
                pod.metadata.namespace.as_deref() == Some(namespace)
                    && pod.metadata.name.as_deref() == Some(name)
            })
            .cloned())
    }

    async fn daemon_set_exists(&self, namespace: &str, name: &str) -> Result<bool, kube::Error> {
        Ok(self
            .daemon_sets
            .iter()
            .any(|(ns, n)| ns == namespace && n == name))
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        if self.eviction_unsupported {
            return Err(api_error(404, "the server could not find the requested resource"));
        }

        self.evicted
            .lock()
            .expect("fake workloads lock")
            .push(format!("{namespace}/{name}"));
        self.remove(namespace, name);

        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.deleted
            .lock()
            .expect("fake workloads lock")
            .push(format!("{namespace}/{name}"));
        self.remove(namespace, name);

        Ok(())
    }
}

// ============================================================================
// FakeRebooter
// ============================================================================

/// [`Rebooter`] that records whether a reboot was requested.
#[derive(Default)]
pub struct FakeRebooter {
    rebooted: AtomicBool,
}

impl FakeRebooter {
    pub fn rebooted(&self) -> bool {
        self.rebooted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Rebooter for FakeRebooter {
    async fn reboot(&self, _interactive: bool) -> Result<()> {
        self.rebooted.store(true, Ordering::SeqCst);

        Ok(())
    }
}

// ============================================================================
// ScriptedStatuses
// ============================================================================

/// [`StatusReceiver`] that plays back a fixed list of statuses, then idles
/// until stopped.
pub struct ScriptedStatuses {
    statuses: Vec<Status>,
}

impl ScriptedStatuses {
    pub fn new(statuses: impl IntoIterator<Item = Status>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
        }
    }
}

#[async_trait]
impl StatusReceiver for ScriptedStatuses {
    async fn receive_statuses(
        &self,
        tx: mpsc::Sender<Status>,
        stop: CancellationToken,
    ) -> Result<()> {
        for status in &self.statuses {
            if tx.send(status.clone()).await.is_err() {
                return Ok(());
            }
        }

        stop.cancelled().await;

        Ok(())
    }
}
