// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Global constants for the klocksmith operator and agent.
//!
//! This module contains all numeric and string constants used throughout the
//! codebase. Constants are organized by category for easy maintenance. The
//! coordination label/annotation vocabulary lives in [`crate::labels`].

use std::time::Duration;

// ============================================================================
// Operator Constants
// ============================================================================

/// How often the operator reconciles the cluster state.
pub const DEFAULT_RECONCILIATION_PERIOD: Duration = Duration::from_secs(10);

/// Maximum number of nodes admitted into the reboot pipeline at once.
pub const DEFAULT_MAX_REBOOTING_NODES: usize = 1;

/// Duration of the leader-election lease.
pub const DEFAULT_LEADER_ELECTION_LEASE: Duration = Duration::from_secs(90);

/// Grace period used when renewing the leader-election lease.
pub const DEFAULT_LEADER_ELECTION_GRACE: Duration = Duration::from_secs(20);

/// Name of the Lease object guarding the singleton operator.
pub const LEADER_ELECTION_LEASE_NAME: &str = "klocksmith-update-operator-lock";

// ============================================================================
// Agent Constants
// ============================================================================

/// Fixed interval between retries of node status writes and pod-termination
/// polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How long the agent waits for the operator to react to its signals before
/// giving up. 24 hours should be enough time between indicating a reboot is
/// needed and the operator telling the agent to proceed.
pub const MAX_OPERATOR_RESPONSE_TIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Default per-pod grace period when waiting for drained pods to terminate.
pub const DEFAULT_POD_DELETION_GRACE_PERIOD: Duration = Duration::from_secs(600);

// ============================================================================
// Host Files (agent)
// ============================================================================

/// Update configuration shipped with the OS image. Always present on Flatcar.
pub const UPDATE_CONF_PATH: &str = "usr/share/flatcar/update.conf";

/// Machine-local update configuration. Optional; keys override
/// [`UPDATE_CONF_PATH`].
pub const UPDATE_CONF_OVERRIDE_PATH: &str = "etc/flatcar/update.conf";

/// OS release identification file. Always present.
pub const OS_RELEASE_PATH: &str = "etc/os-release";

// ============================================================================
// Drain Constants
// ============================================================================

/// Annotation identifying mirror pods, whose manifest is sourced from the
/// host file system. Mirror pods cannot be deleted through the API server.
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Namespace holding cluster control-plane components, which are never
/// drained.
pub const PROTECTED_NAMESPACE: &str = "kube-system";

// ============================================================================
// Metrics Server Constants
// ============================================================================

/// Address the operator metrics HTTP server binds to.
pub const METRICS_SERVER_BIND_ADDRESS: &str = "0.0.0.0";

/// Port the operator metrics HTTP server listens on.
pub const METRICS_SERVER_PORT: u16 = 8080;

/// Path the metrics are served under.
pub const METRICS_SERVER_PATH: &str = "/metrics";

// ============================================================================
// Runtime Constants
// ============================================================================

/// Number of Tokio worker threads used by the binaries.
pub const TOKIO_WORKER_THREADS: usize = 2;
