// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! # Klocksmith - Reboot Coordinator for Flatcar Container Linux on Kubernetes
//!
//! Klocksmith coordinates controlled, cluster-wide reboots of auto-updating
//! Flatcar Container Linux nodes. Each node runs an `update-agent` that
//! watches the host update engine and signals when a staged OS image needs a
//! reboot; a singleton `update-operator` admits a bounded number of nodes
//! into the reboot pipeline, gates them on before- and after-reboot hook
//! annotations, and grants permission to drain and reboot.
//!
//! ## Overview
//!
//! All coordination state lives on the `Node` object as labels and
//! annotations under a common prefix, mutated by both parties under
//! optimistic concurrency control. The cluster object is the synchronization
//! medium: either party can restart at any time and recover its state from
//! the node's coordination fields.
//!
//! ## Modules
//!
//! - [`operator`] - the reconciler applying the five coordination phases
//! - [`agent`] - the per-node state machine reacting to operator decisions
//! - [`drain`] - pod selection, eviction and termination wait before reboots
//! - [`leader`] - leader-election gate for the singleton operator
//! - [`update_engine`] - D-Bus adapter for the host update engine
//! - [`login1`] - D-Bus adapter for the host session manager
//! - [`labels`] - the coordination label/annotation vocabulary

pub mod agent;
pub mod constants;
pub mod drain;
pub mod host_info;
pub mod labels;
pub mod leader;
pub mod login1;
pub mod metrics;
pub mod nodes;
pub mod operator;
pub mod reboot_window;
pub mod retry;
pub mod selector;
pub mod update_engine;

#[cfg(test)]
pub mod fake;
