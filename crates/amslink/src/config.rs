// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global configuration - single source of truth.
//!
//! This module centralizes the AMS/TCP protocol constants and the runtime
//! defaults for the client. **NEVER hardcode these elsewhere!**

use std::time::Duration;

// =======================================================================
// AMS/TCP protocol constants
// =======================================================================

/// TCP port the remote ADS device listens on.
///
/// Every `AmsConnection` targets this port unless an explicit socket
/// address is supplied (tests use loopback listeners on ephemeral ports).
pub const ADS_TCP_SERVER_PORT: u16 = 48898;

/// First local AMS port the router leases to callers.
///
/// The response-slot table of every connection is indexed by
/// `local_port - PORT_BASE`, so all leased ports must stay inside
/// `[PORT_BASE, PORT_END]`.
pub const PORT_BASE: u16 = 30000;

/// Number of leasable local AMS ports.
pub const NUM_PORTS: usize = 128;

/// Last local AMS port the router leases (inclusive).
pub const PORT_END: u16 = PORT_BASE + NUM_PORTS as u16 - 1;

// =======================================================================
// Runtime defaults
// =======================================================================

/// Capacity of each response-slot frame.
///
/// Replies longer than this are drained and the caller sees an empty
/// frame; 4 KiB covers every ADS command reply in practice.
pub const DEFAULT_FRAME_CAPACITY: usize = 4096;

/// Capacity of each notification ring (one ring per dispatcher).
///
/// Sized for bursts: a slow callback queues subsequent notifications here
/// before the reader thread has to start dropping frames.
pub const DEFAULT_RING_CAPACITY: usize = 4 * 1024 * 1024;

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Default request timeout, applied when the caller does not supply one
/// (notification-handle teardown uses it for the DEL_DEVICE_NOTIFICATION
/// round trip).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5_000);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_range_is_contiguous() {
        assert_eq!(PORT_END - PORT_BASE + 1, NUM_PORTS as u16);
        assert!(PORT_BASE > 1024, "leased ports must not collide with OS ports");
    }

    #[test]
    fn test_frame_capacity_holds_headers() {
        // A slot frame must at least hold a maximal notification reply.
        assert!(DEFAULT_FRAME_CAPACITY >= 1024);
        assert!(DEFAULT_RING_CAPACITY >= DEFAULT_FRAME_CAPACITY);
    }
}
