// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Coordination label and annotation vocabulary shared by the update-agent
//! and the update-operator.
//!
//! All reboot-coordination state lives on the `Node` object as string labels
//! and annotations under a common key prefix. Annotation values are the
//! literals `"true"`/`"false"`; a missing key is treated as `"false"`.

// ============================================================================
// Annotation / Label Values
// ============================================================================

/// Annotation value used by the update-agent and update-operator.
pub const TRUE: &str = "true";

/// Annotation value used by the update-agent and update-operator.
pub const FALSE: &str = "false";

/// Prefix used by all label and annotation keys.
pub const PREFIX: &str = "flatcar-linux-update.v1.flatcar-linux.net/";

// ============================================================================
// Annotations
// ============================================================================

/// Annotation set to `"true"` by the update-agent when a reboot is requested.
pub const ANNOTATION_REBOOT_NEEDED: &str =
    "flatcar-linux-update.v1.flatcar-linux.net/reboot-needed";

/// Annotation set to `"true"` by the update-agent when node drain and reboot
/// are initiated.
pub const ANNOTATION_REBOOT_IN_PROGRESS: &str =
    "flatcar-linux-update.v1.flatcar-linux.net/reboot-in-progress";

/// Annotation set to `"true"` by the update-operator when an agent may proceed
/// with a node drain and reboot.
pub const ANNOTATION_OK_TO_REBOOT: &str = "flatcar-linux-update.v1.flatcar-linux.net/reboot-ok";

/// Annotation that may be set to `"true"` by the administrator to prevent the
/// update-operator from considering a node for rebooting. Never written by
/// the update-agent or the update-operator.
pub const ANNOTATION_REBOOT_PAUSED: &str =
    "flatcar-linux-update.v1.flatcar-linux.net/reboot-paused";

/// Annotation set by the update-agent to the current operation reported by
/// the host update engine.
///
/// Possible values are:
///  - `"UPDATE_STATUS_IDLE"`
///  - `"UPDATE_STATUS_CHECKING_FOR_UPDATE"`
///  - `"UPDATE_STATUS_UPDATE_AVAILABLE"`
///  - `"UPDATE_STATUS_DOWNLOADING"`
///  - `"UPDATE_STATUS_VERIFYING"`
///  - `"UPDATE_STATUS_FINALIZING"`
///  - `"UPDATE_STATUS_UPDATED_NEED_REBOOT"`
///  - `"UPDATE_STATUS_REPORTING_ERROR_EVENT"`
pub const ANNOTATION_STATUS: &str = "flatcar-linux-update.v1.flatcar-linux.net/status";

/// Annotation set by the update-agent to the `LAST_CHECKED_TIME` reported by
/// the update engine. Zero if an update has never been checked for, or a UNIX
/// timestamp.
pub const ANNOTATION_LAST_CHECKED_TIME: &str =
    "flatcar-linux-update.v1.flatcar-linux.net/last-checked-time";

/// Annotation set by the update-agent to the `NEW_VERSION` reported by the
/// update engine. An opaque string, but might be semver.
pub const ANNOTATION_NEW_VERSION: &str = "flatcar-linux-update.v1.flatcar-linux.net/new-version";

/// Annotation set by the update-agent to record that it was the party that
/// made the node unschedulable, and is therefore responsible for making it
/// schedulable again after the reboot.
pub const ANNOTATION_AGENT_MADE_UNSCHEDULABLE: &str =
    "flatcar-linux-update.v1.flatcar-linux.net/agent-made-unschedulable";

// ============================================================================
// Labels
// ============================================================================

/// Label set to `"true"` by the update-agent when a reboot is requested.
/// Selector-friendly mirror of [`ANNOTATION_REBOOT_NEEDED`].
pub const LABEL_REBOOT_NEEDED: &str = "flatcar-linux-update.v1.flatcar-linux.net/reboot-needed";

/// Label set to `"true"` while the operator waits for the configured
/// before-reboot hook annotations. Used to schedule pre-reboot hook pods.
pub const LABEL_BEFORE_REBOOT: &str = "flatcar-linux-update.v1.flatcar-linux.net/before-reboot";

/// Label set to `"true"` while the operator waits for the configured
/// after-reboot hook annotations. Used to schedule post-reboot hook pods.
pub const LABEL_AFTER_REBOOT: &str = "flatcar-linux-update.v1.flatcar-linux.net/after-reboot";

/// Label set by the update-agent to the value of `ID` in `/etc/os-release`.
pub const LABEL_ID: &str = "flatcar-linux-update.v1.flatcar-linux.net/id";

/// Label set by the update-agent to the value of `GROUP` in
/// `/usr/share/flatcar/update.conf`, overridden by the value of `GROUP` in
/// `/etc/flatcar/update.conf`.
pub const LABEL_GROUP: &str = "flatcar-linux-update.v1.flatcar-linux.net/group";

/// Label set by the update-agent to the value of `VERSION` in
/// `/etc/os-release`.
pub const LABEL_VERSION: &str = "flatcar-linux-update.v1.flatcar-linux.net/version";

#[cfg(test)]
#[path = "labels_tests.rs"]
mod labels_tests;
