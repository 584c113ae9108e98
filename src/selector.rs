// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Node matching utilities for the coordination protocol.
//!
//! This module provides helper functions for inspecting and filtering `Node`
//! objects by their coordination labels and annotations. The protocol treats
//! a missing key or an empty value as `"false"`; only the exact literal
//! `"true"` counts as set.

use k8s_openapi::api::core::v1::Node;
use std::collections::BTreeMap;

use crate::labels::TRUE;

static EMPTY: BTreeMap<String, String> = BTreeMap::new();

/// Borrow a node's annotations, treating absent metadata as an empty map.
#[must_use]
pub fn annotations(node: &Node) -> &BTreeMap<String, String> {
    node.metadata.annotations.as_ref().unwrap_or(&EMPTY)
}

/// Borrow a node's labels, treating absent metadata as an empty map.
#[must_use]
pub fn labels(node: &Node) -> &BTreeMap<String, String> {
    node.metadata.labels.as_ref().unwrap_or(&EMPTY)
}

/// Check whether an annotation is set to the exact literal `"true"`.
#[must_use]
pub fn annotation_is_true(node: &Node, key: &str) -> bool {
    annotations(node).get(key).map(String::as_str) == Some(TRUE)
}

/// Check whether a label is set to the exact literal `"true"`.
#[must_use]
pub fn label_is_true(node: &Node, key: &str) -> bool {
    labels(node).get(key).map(String::as_str) == Some(TRUE)
}

/// Check that every key in `keys` is an annotation set to `"true"`.
///
/// A missing key or any value other than `"true"` fails the check. An empty
/// key set is trivially satisfied, which is what makes hook gating optional
/// when no hook annotations are configured.
#[must_use]
pub fn all_annotations_true(node: &Node, keys: &[String]) -> bool {
    keys.iter().all(|key| annotation_is_true(node, key))
}

/// Filter nodes carrying the given label set to `"true"`.
#[must_use]
pub fn filter_nodes_by_label_true<'a>(nodes: &'a [Node], key: &str) -> Vec<&'a Node> {
    nodes
        .iter()
        .filter(|node| label_is_true(node, key))
        .collect()
}

#[cfg(test)]
#[path = "selector_tests.rs"]
mod selector_tests;
