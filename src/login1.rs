// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! D-Bus adapter for the host session manager (systemd-logind).
//!
//! The agent triggers the actual reboot through logind's
//! `org.freedesktop.login1.Manager.Reboot` method. [`LogindRebooter`]
//! implements the agent's [`Rebooter`](crate::agent::Rebooter) capability.

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::agent::Rebooter;

#[zbus::proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1",
    gen_blocking = false
)]
trait LoginManager {
    /// Reboot the machine. `interactive` controls whether polkit may ask the
    /// caller to authenticate.
    fn reboot(&self, interactive: bool) -> zbus::Result<()>;
}

/// Reboots the host through systemd-logind.
pub struct LogindRebooter {
    proxy: LoginManagerProxy<'static>,
}

impl LogindRebooter {
    /// Connect to logind on the system bus.
    ///
    /// # Errors
    ///
    /// Fails when the system bus is unreachable or the proxy cannot be built.
    pub async fn connect() -> Result<Self> {
        let connection = zbus::Connection::system()
            .await
            .context("connecting to system bus")?;

        let proxy = LoginManagerProxy::new(&connection)
            .await
            .context("creating logind proxy")?;

        Ok(Self { proxy })
    }
}

#[async_trait]
impl Rebooter for LogindRebooter {
    async fn reboot(&self, interactive: bool) -> Result<()> {
        self.proxy
            .reboot(interactive)
            .await
            .context("calling Reboot on logind")
    }
}
