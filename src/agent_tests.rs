// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `agent.rs`
//!
//! These run the real agent state machine against in-memory fakes for the
//! node store, workloads, status source and rebooter, and play the
//! operator's side of the protocol by mutating the node directly.

#[cfg(test)]
mod tests {
    use super::super::{Agent, Config};
    use crate::constants::{OS_RELEASE_PATH, UPDATE_CONF_PATH};
    use crate::fake::{FakeNodes, FakeRebooter, FakeWorkloads, ScriptedStatuses};
    use crate::labels::{
        ANNOTATION_AGENT_MADE_UNSCHEDULABLE, ANNOTATION_OK_TO_REBOOT,
        ANNOTATION_REBOOT_IN_PROGRESS, ANNOTATION_REBOOT_NEEDED, ANNOTATION_STATUS, FALSE,
        LABEL_GROUP, LABEL_ID, LABEL_REBOOT_NEEDED, LABEL_VERSION, TRUE,
    };
    use crate::update_engine::{Status, UPDATE_STATUS_UPDATED_NEED_REBOOT};
    use k8s_openapi::api::core::v1::{Node, NodeSpec, Pod, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const NODE_NAME: &str = "test-node";

    fn write_host_files(root: &std::path::Path) {
        for (relative, contents) in [
            (OS_RELEASE_PATH, "ID=flatcar\nVERSION=3815.2.0\n"),
            (UPDATE_CONF_PATH, "GROUP=stable\n"),
        ] {
            let path = root.join(relative);
            std::fs::create_dir_all(path.parent().expect("file has a parent"))
                .expect("creating host file directory");
            std::fs::write(path, contents).expect("writing host file");
        }
    }

    fn bare_node() -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(NODE_NAME.to_string()),
                ..ObjectMeta::default()
            },
            ..Node::default()
        }
    }

    fn unschedulable_node(agent_made: Option<&str>) -> Node {
        let mut node = bare_node();
        node.spec = Some(NodeSpec {
            unschedulable: Some(true),
            ..NodeSpec::default()
        });
        if let Some(value) = agent_made {
            node.metadata.annotations = Some(
                [(
                    ANNOTATION_AGENT_MADE_UNSCHEDULABLE.to_string(),
                    value.to_string(),
                )]
                .into(),
            );
        }
        node
    }

    fn pod(name: &str, namespace: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some(format!("uid-{name}")),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                node_name: Some(NODE_NAME.to_string()),
                ..PodSpec::default()
            }),
            ..Pod::default()
        }
    }

    struct Fixture {
        store: Arc<FakeNodes>,
        workloads: Arc<FakeWorkloads>,
        rebooter: Arc<FakeRebooter>,
        agent: Agent,
        _host_files: tempfile::TempDir,
    }

    fn fixture(node: Node, statuses: Vec<Status>, workloads: FakeWorkloads) -> Fixture {
        let host_files = tempfile::tempdir().expect("creating temp dir");
        write_host_files(host_files.path());

        let store = FakeNodes::new([node]);
        let workloads = Arc::new(workloads);
        let rebooter = Arc::new(FakeRebooter::default());

        let agent = Agent::new(Config {
            node_name: NODE_NAME.to_string(),
            nodes: Arc::clone(&store) as Arc<dyn crate::nodes::Nodes>,
            workloads: Arc::clone(&workloads) as Arc<dyn crate::drain::Workloads>,
            status_receiver: Arc::new(ScriptedStatuses::new(statuses)),
            rebooter: Arc::clone(&rebooter) as Arc<dyn super::super::Rebooter>,
            pod_deletion_grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            max_operator_response_time: Duration::from_secs(10),
            host_files_prefix: PathBuf::from(host_files.path()),
        })
        .expect("creating agent");

        Fixture {
            store,
            workloads,
            rebooter,
            agent,
            _host_files: host_files,
        }
    }

    /// Poll the fake node store until `condition` holds, panicking after a
    /// few seconds.
    async fn wait_for_node_state(
        store: &FakeNodes,
        what: &str,
        condition: impl Fn(&Node) -> bool,
    ) {
        for _ in 0..500 {
            if condition(&store.node(NODE_NAME)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for node state: {what}");
    }

    fn annotation(node: &Node, key: &str) -> Option<String> {
        node.metadata.annotations.as_ref()?.get(key).cloned()
    }

    fn label(node: &Node, key: &str) -> Option<String> {
        node.metadata.labels.as_ref()?.get(key).cloned()
    }

    #[test]
    fn test_agent_requires_a_node_name() {
        let store = FakeNodes::new([]);

        let result = Agent::new(Config {
            node_name: String::new(),
            nodes: store as Arc<dyn crate::nodes::Nodes>,
            workloads: Arc::new(FakeWorkloads::new([], [])),
            status_receiver: Arc::new(ScriptedStatuses::new([])),
            rebooter: Arc::new(FakeRebooter::default()),
            pod_deletion_grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            max_operator_response_time: Duration::from_secs(10),
            host_files_prefix: PathBuf::new(),
        });

        assert!(result.is_err(), "Empty node name should be rejected");
    }

    #[tokio::test]
    async fn test_agent_startup_sets_info_labels_and_resets_coordination_state() {
        let fx = fixture(bare_node(), Vec::new(), FakeWorkloads::new([], []));
        let stop = CancellationToken::new();

        let run_stop = stop.clone();
        let agent = fx.agent;
        let agent = tokio::spawn(async move { agent.run(run_stop).await });

        wait_for_node_state(&fx.store, "coordination state reset", |node| {
            annotation(node, ANNOTATION_REBOOT_IN_PROGRESS).as_deref() == Some(FALSE)
                && annotation(node, ANNOTATION_REBOOT_NEEDED).as_deref() == Some(FALSE)
                && label(node, LABEL_REBOOT_NEEDED).as_deref() == Some(FALSE)
        })
        .await;

        let node = fx.store.node(NODE_NAME);
        assert_eq!(label(&node, LABEL_ID).as_deref(), Some("flatcar"));
        assert_eq!(label(&node, LABEL_GROUP).as_deref(), Some("stable"));
        assert_eq!(label(&node, LABEL_VERSION).as_deref(), Some("3815.2.0"));

        stop.cancel();
        agent
            .await
            .expect("agent task")
            .expect("agent should stop cleanly on cancellation");
        assert!(!fx.rebooter.rebooted());
    }

    #[tokio::test]
    async fn test_agent_startup_clears_its_own_cordon() {
        let fx = fixture(
            unschedulable_node(Some(TRUE)),
            Vec::new(),
            FakeWorkloads::new([], []),
        );
        let stop = CancellationToken::new();

        let run_stop = stop.clone();
        let agent = fx.agent;
        let agent = tokio::spawn(async move { agent.run(run_stop).await });

        wait_for_node_state(&fx.store, "cordon cleared", |node| {
            let unschedulable = node
                .spec
                .as_ref()
                .and_then(|spec| spec.unschedulable)
                .unwrap_or(false);

            !unschedulable
                && annotation(node, ANNOTATION_AGENT_MADE_UNSCHEDULABLE).as_deref() == Some(FALSE)
        })
        .await;

        stop.cancel();
        agent.await.expect("agent task").expect("agent run");
    }

    #[tokio::test]
    async fn test_agent_startup_leaves_external_cordon_alone() {
        let fx = fixture(
            unschedulable_node(Some(FALSE)),
            Vec::new(),
            FakeWorkloads::new([], []),
        );
        let stop = CancellationToken::new();

        let run_stop = stop.clone();
        let agent = fx.agent;
        let agent = tokio::spawn(async move { agent.run(run_stop).await });

        // The agent clears reboot-in-progress on startup; once that has
        // happened, the cordon decision has also been made.
        wait_for_node_state(&fx.store, "coordination state reset", |node| {
            annotation(node, ANNOTATION_REBOOT_IN_PROGRESS).as_deref() == Some(FALSE)
        })
        .await;

        // Give the agent a moment to (wrongly) uncordon, then check it
        // did not.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let node = fx.store.node(NODE_NAME);
        assert_eq!(
            node.spec.as_ref().and_then(|spec| spec.unschedulable),
            Some(true),
            "A cordon placed by an external party must not be undone"
        );

        stop.cancel();
        agent.await.expect("agent task").expect("agent run");
    }

    #[tokio::test]
    async fn test_agent_startup_fails_when_operator_never_clears_permission() {
        let mut node = bare_node();
        node.metadata.annotations = Some(
            [(ANNOTATION_OK_TO_REBOOT.to_string(), TRUE.to_string())].into(),
        );

        let host_files = tempfile::tempdir().expect("creating temp dir");
        write_host_files(host_files.path());

        let store = FakeNodes::new([node]);
        let agent = Agent::new(Config {
            node_name: NODE_NAME.to_string(),
            nodes: Arc::clone(&store) as Arc<dyn crate::nodes::Nodes>,
            workloads: Arc::new(FakeWorkloads::new([], [])),
            status_receiver: Arc::new(ScriptedStatuses::new([])),
            rebooter: Arc::new(FakeRebooter::default()),
            pod_deletion_grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            max_operator_response_time: Duration::from_millis(100),
            host_files_prefix: PathBuf::from(host_files.path()),
        })
        .expect("creating agent");

        let err = agent
            .run(CancellationToken::new())
            .await
            .expect_err("agent should give up when permission is never cleared");
        assert!(
            format!("{err:#}").contains("clear reboot permission"),
            "Unexpected error: {err:#}"
        );
    }

    #[tokio::test]
    async fn test_agent_full_reboot_cycle() {
        let workloads = FakeWorkloads::new([pod("workload", "default")], []);
        let need_reboot = Status {
            current_operation: UPDATE_STATUS_UPDATED_NEED_REBOOT.to_string(),
            last_checked_time: 1_700_000_000,
            new_version: "3815.2.1".to_string(),
            ..Status::default()
        };

        let fx = fixture(bare_node(), vec![need_reboot], workloads);
        let stop = CancellationToken::new();

        let run_stop = stop.clone();
        let agent = fx.agent;
        let agent = tokio::spawn(async move { agent.run(run_stop).await });

        // The agent observes the update engine and asks for a reboot.
        wait_for_node_state(&fx.store, "reboot-needed signalled", |node| {
            annotation(node, ANNOTATION_REBOOT_NEEDED).as_deref() == Some(TRUE)
                && label(node, LABEL_REBOOT_NEEDED).as_deref() == Some(TRUE)
                && annotation(node, ANNOTATION_STATUS).as_deref()
                    == Some(UPDATE_STATUS_UPDATED_NEED_REBOOT)
        })
        .await;
        assert!(!fx.rebooter.rebooted(), "Reboot must wait for permission");

        // Play the operator: grant permission.
        fx.store.mutate(NODE_NAME, |node| {
            node.metadata
                .annotations
                .get_or_insert_default()
                .insert(ANNOTATION_OK_TO_REBOOT.to_string(), TRUE.to_string());
        });

        // The agent confirms, cordons itself and reboots.
        wait_for_node_state(&fx.store, "reboot confirmed", |node| {
            annotation(node, ANNOTATION_REBOOT_IN_PROGRESS).as_deref() == Some(TRUE)
                && annotation(node, ANNOTATION_AGENT_MADE_UNSCHEDULABLE).as_deref() == Some(TRUE)
                && node
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.unschedulable)
                    .unwrap_or(false)
        })
        .await;

        for _ in 0..500 {
            if fx.rebooter.rebooted() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fx.rebooter.rebooted(), "Expected the host reboot trigger");
        assert_eq!(
            fx.workloads.evicted(),
            vec!["default/workload".to_string()],
            "The workload pod should have been drained before the reboot"
        );

        stop.cancel();
        agent.await.expect("agent task").expect("agent run");
    }

    #[tokio::test]
    async fn test_agent_skips_reboot_when_drain_is_interrupted() {
        let mut workloads = FakeWorkloads::new([pod("stuck", "default")], []);
        workloads.hold_terminations = true;

        let need_reboot = Status {
            current_operation: UPDATE_STATUS_UPDATED_NEED_REBOOT.to_string(),
            ..Status::default()
        };

        let fx = fixture(bare_node(), vec![need_reboot], workloads);
        let stop = CancellationToken::new();

        let run_stop = stop.clone();
        let agent = fx.agent;
        let agent = tokio::spawn(async move { agent.run(run_stop).await });

        wait_for_node_state(&fx.store, "reboot-needed signalled", |node| {
            annotation(node, ANNOTATION_REBOOT_NEEDED).as_deref() == Some(TRUE)
        })
        .await;

        fx.store.mutate(NODE_NAME, |node| {
            node.metadata
                .annotations
                .get_or_insert_default()
                .insert(ANNOTATION_OK_TO_REBOOT.to_string(), TRUE.to_string());
        });

        // Wait until the drain has started (the pod was asked to go away),
        // then pull the plug.
        for _ in 0..500 {
            if !fx.workloads.evicted().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!fx.workloads.evicted().is_empty(), "Drain never started");

        stop.cancel();

        agent
            .await
            .expect("agent task")
            .expect("interrupted drain should end the run cleanly");
        assert!(
            !fx.rebooter.rebooted(),
            "The reboot must be skipped when the drain is interrupted"
        );
    }
}
