// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RAII wrapper around a device notification registration.

use super::NotificationDispatcher;
use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::connection::AmsConnection;
use crate::error::Result;
use crate::proto::AmsAddr;
use std::sync::Weak;
use std::time::Duration;

/// Owns one registered notification.
///
/// Dropping the handle deregisters it: a DEL_DEVICE_NOTIFICATION is sent
/// through the originating connection (bounded timeout) and the
/// subscription is detached from its dispatcher. Both references are weak,
/// so a handle outliving the connection degrades to a no-op instead of
/// keeping the reader thread alive.
pub struct NotificationHandle {
    handle: u32,
    remote: AmsAddr,
    local_port: u16,
    dispatcher: Weak<NotificationDispatcher>,
    connection: Weak<AmsConnection>,
    closed: bool,
}

impl NotificationHandle {
    pub(crate) fn new(
        handle: u32,
        remote: AmsAddr,
        local_port: u16,
        dispatcher: Weak<NotificationDispatcher>,
        connection: Weak<AmsConnection>,
    ) -> Self {
        Self {
            handle,
            remote,
            local_port,
            dispatcher,
            connection,
            closed: false,
        }
    }

    /// Device-assigned notification handle.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Deregister explicitly. Idempotent: the DEL_DEVICE_NOTIFICATION goes
    /// out at most once, and a second call returns Ok without touching the
    /// wire.
    pub fn close(&mut self, timeout: Duration) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = match self.connection.upgrade() {
            Some(connection) => connection.delete_notification(
                self.remote,
                self.handle,
                timeout,
                self.local_port,
            ),
            // Connection already torn down; nothing left to tell the device.
            None => Ok(()),
        };

        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.erase(self.handle);
        }

        result
    }
}

impl Drop for NotificationHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close(DEFAULT_REQUEST_TIMEOUT) {
            log::warn!(
                "[notify] deregistering handle {:#x} failed: {}",
                self.handle,
                e
            );
        }
    }
}
