// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! D-Bus adapter for the host update engine.
//!
//! The update engine stages OS upgrades on the host and exposes its state on
//! the system bus: a `GetStatus` method returning the current status tuple,
//! and a `StatusUpdate` signal carrying the same tuple whenever the state
//! changes. This module wraps both behind [`Client`], which implements the
//! agent's [`StatusReceiver`](crate::agent::StatusReceiver) capability.
//!
//! Shutdown ordering matters: the receive loop stops pulling from the signal
//! stream only once the stop token fires, and the caller drops the
//! [`Client`], closing the bus connection, only after the loop has returned.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::StatusReceiver;

// ============================================================================
// Update Engine Operations
// ============================================================================

/// The update engine is idle.
pub const UPDATE_STATUS_IDLE: &str = "UPDATE_STATUS_IDLE";

/// The update engine is checking for an update.
pub const UPDATE_STATUS_CHECKING_FOR_UPDATE: &str = "UPDATE_STATUS_CHECKING_FOR_UPDATE";

/// An update is available for download.
pub const UPDATE_STATUS_UPDATE_AVAILABLE: &str = "UPDATE_STATUS_UPDATE_AVAILABLE";

/// An update is downloading.
pub const UPDATE_STATUS_DOWNLOADING: &str = "UPDATE_STATUS_DOWNLOADING";

/// A downloaded update is being verified.
pub const UPDATE_STATUS_VERIFYING: &str = "UPDATE_STATUS_VERIFYING";

/// A verified update is being finalized.
pub const UPDATE_STATUS_FINALIZING: &str = "UPDATE_STATUS_FINALIZING";

/// A new OS image has been staged and a reboot is required to complete the
/// update. This is the terminal value the agent reacts to.
pub const UPDATE_STATUS_UPDATED_NEED_REBOOT: &str = "UPDATE_STATUS_UPDATED_NEED_REBOOT";

/// The update engine is reporting an error event.
pub const UPDATE_STATUS_REPORTING_ERROR_EVENT: &str = "UPDATE_STATUS_REPORTING_ERROR_EVENT";

// ============================================================================
// Status
// ============================================================================

/// Status reported by the update engine.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Status {
    /// Zero if an update has never been checked for, or a UNIX timestamp.
    pub last_checked_time: i64,
    /// Download progress in `[0, 1]`.
    pub progress: f64,
    /// One of the `UPDATE_STATUS_*` operation values.
    pub current_operation: String,
    /// Version of the staged update, if any.
    pub new_version: String,
    /// Size of the staged update in bytes.
    pub new_size: i64,
}

impl From<(i64, f64, String, String, i64)> for Status {
    fn from(
        (last_checked_time, progress, current_operation, new_version, new_size): (
            i64,
            f64,
            String,
            String,
            i64,
        ),
    ) -> Self {
        Self {
            last_checked_time,
            progress,
            current_operation,
            new_version,
            new_size,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LastCheckedTime={} Progress={} CurrentOperation={:?} NewVersion={} NewSize={}",
            self.last_checked_time,
            self.progress,
            self.current_operation,
            self.new_version,
            self.new_size
        )
    }
}

// ============================================================================
// D-Bus Client
// ============================================================================

#[zbus::proxy(
    interface = "com.coreos.update1.Manager",
    default_service = "com.coreos.update1",
    default_path = "/com/coreos/update1",
    gen_blocking = false
)]
trait UpdateEngineManager {
    /// Current update engine status.
    #[zbus(name = "GetStatus")]
    fn get_status(&self) -> zbus::Result<(i64, f64, String, String, i64)>;

    /// Emitted by the update engine whenever its status changes.
    #[zbus(signal, name = "StatusUpdate")]
    fn status_update(
        &self,
        last_checked_time: i64,
        progress: f64,
        current_operation: String,
        new_version: String,
        new_size: i64,
    ) -> zbus::Result<()>;
}

/// Client reading update engine status over the system bus.
///
/// Dropping the client closes the bus connection; do so only after
/// [`StatusReceiver::receive_statuses`] has returned.
pub struct Client {
    proxy: UpdateEngineManagerProxy<'static>,
}

impl Client {
    /// Connect to the update engine on the system bus.
    ///
    /// # Errors
    ///
    /// Fails when the system bus is unreachable or the proxy cannot be built.
    pub async fn connect() -> Result<Self> {
        let connection = zbus::Connection::system()
            .await
            .context("connecting to system bus")?;

        let proxy = UpdateEngineManagerProxy::new(&connection)
            .await
            .context("creating update engine proxy")?;

        Ok(Self { proxy })
    }

    /// Fetch the current status from the update engine.
    async fn status(&self) -> Result<Status> {
        let body = self
            .proxy
            .get_status()
            .await
            .context("calling GetStatus on update engine")?;

        Ok(Status::from(body))
    }
}

#[async_trait]
impl StatusReceiver for Client {
    /// Forward update engine statuses onto `tx` until `stop` fires.
    ///
    /// The current status is fetched once up front; if that call fails an
    /// empty status is sent instead, and reception proceeds with the signal
    /// stream.
    async fn receive_statuses(
        &self,
        tx: mpsc::Sender<Status>,
        stop: CancellationToken,
    ) -> Result<()> {
        // Subscribe before the initial fetch so no transition is missed
        // between the two.
        let mut signals = self
            .proxy
            .receive_status_update()
            .await
            .context("subscribing to update engine StatusUpdate signal")?;

        let initial = match self.status().await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Failed fetching initial update engine status");
                Status::default()
            }
        };

        if tx.send(initial).await.is_err() {
            return Ok(());
        }

        loop {
            tokio::select! {
                () = stop.cancelled() => {
                    debug!("Stopping update engine status reception");
                    return Ok(());
                }
                signal = signals.next() => {
                    let Some(signal) = signal else {
                        bail!("update engine signal stream closed unexpectedly");
                    };

                    let args = signal
                        .args()
                        .context("decoding StatusUpdate signal")?;

                    let status = Status {
                        last_checked_time: *args.last_checked_time(),
                        progress: *args.progress(),
                        current_operation: args.current_operation().clone(),
                        new_version: args.new_version().clone(),
                        new_size: *args.new_size(),
                    };

                    if tx.send(status).await.is_err() {
                        // Receiver side is gone; nothing left to forward to.
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "update_engine_tests.rs"]
mod update_engine_tests;
