// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Host identity discovery from Flatcar configuration files.
//!
//! The agent labels its node with the OS `ID`/`VERSION` from
//! `/etc/os-release` and the update `GROUP` from
//! `/usr/share/flatcar/update.conf`, where `/etc/flatcar/update.conf` may
//! override individual keys. An optional filesystem prefix lets tests supply
//! alternative roots.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::constants::{OS_RELEASE_PATH, UPDATE_CONF_OVERRIDE_PATH, UPDATE_CONF_PATH};

/// Flatcar version and update-group information read from the host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionInfo {
    /// `ID` from `/etc/os-release`.
    pub id: String,
    /// `GROUP` from update.conf, override file winning.
    pub group: String,
    /// `VERSION` from `/etc/os-release`.
    pub version: String,
}

/// Read [`VersionInfo`] from the host files under `prefix`.
///
/// # Errors
///
/// Fails when a required file (`os-release` or the base update.conf) is
/// missing or unreadable. The override update.conf is optional.
pub fn version_info(prefix: &Path) -> Result<VersionInfo> {
    let update_conf = update_map(prefix)?;
    let os_release = release_map(prefix)?;

    Ok(VersionInfo {
        id: os_release.get("ID").cloned().unwrap_or_default(),
        group: update_conf.get("GROUP").cloned().unwrap_or_default(),
        version: os_release.get("VERSION").cloned().unwrap_or_default(),
    })
}

fn update_map(prefix: &Path) -> Result<HashMap<String, String>> {
    let mut info = HashMap::new();

    let conf_path = prefix.join(UPDATE_CONF_PATH);

    // This file should always be present on Flatcar.
    let contents = std::fs::read_to_string(&conf_path)
        .with_context(|| format!("reading file {}", conf_path.display()))?;
    split_newline_env(&mut info, &contents);

    // If present and readable, this file has overrides.
    let override_path = prefix.join(UPDATE_CONF_OVERRIDE_PATH);
    match std::fs::read_to_string(&override_path) {
        Ok(contents) => split_newline_env(&mut info, &contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %override_path.display(), "Skipping missing update.conf override");
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("reading file {}", override_path.display()));
        }
    }

    Ok(info)
}

fn release_map(prefix: &Path) -> Result<HashMap<String, String>> {
    let mut info = HashMap::new();

    let release_path = prefix.join(OS_RELEASE_PATH);

    // This file should always be present on Flatcar.
    let contents = std::fs::read_to_string(&release_path)
        .with_context(|| format!("reading file {}", release_path.display()))?;
    split_newline_env(&mut info, &contents);

    Ok(info)
}

/// Split newline-delimited `KEY=VALUE` pairs and insert them into the map.
/// Lines without a `=` are skipped.
fn split_newline_env(map: &mut HashMap<String, String>, contents: &str) {
    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        map.insert(key.to_string(), value.to_string());
    }
}

#[cfg(test)]
#[path = "host_info_tests.rs"]
mod host_info_tests;
