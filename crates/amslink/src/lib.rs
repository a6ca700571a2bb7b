// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # amslink - AMS/ADS client runtime
//!
//! A pure Rust client for the AMS/ADS protocol spoken by a class of
//! industrial controllers: many logical request/response and notification
//! streams multiplexed over one long-lived TCP connection per device.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use amslink::{AmsAddr, CommandId, Frame, Router};
//! use std::time::Duration;
//!
//! fn main() -> amslink::Result<()> {
//!     let router = Router::with_net_id("10.0.0.2.1.1".parse()?);
//!     let connection = router.get_connection("192.168.0.1".parse().unwrap())?;
//!     let port = router.alloc_port()?;
//!
//!     // READ_STATE round trip.
//!     let device: AmsAddr = amslink::AmsAddr::new("192.168.0.1.1.1".parse()?, 851);
//!     let mut frame = Frame::new(256);
//!     let reply = connection.request(
//!         &mut frame,
//!         device,
//!         router.local_address(port),
//!         CommandId::ReadState,
//!         Duration::from_millis(5_000),
//!     )?;
//!     println!("device state: {:?}", reply);
//!
//!     router.free_port(port);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------+
//! |                        Caller threads                         |
//! |        build Frame -> write() -> block on ResponseSlot        |
//! +---------------------------------------------------------------+
//! |  Router: connection per destination IP, local port lease      |
//! +---------------------------------------------------------------+
//! |  AmsConnection: one TCP socket, one reader thread             |
//! |    replies    -> ResponseSlot (matched by invoke id)          |
//! |    notifications -> dispatcher ring -> worker -> callback     |
//! +---------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Router`] | Connection registry and local AMS port lease |
//! | [`AmsConnection`] | Multiplexed TCP connection to one device |
//! | [`Frame`] | Prepend-oriented buffer for building requests |
//! | [`NotificationHandle`] | RAII deregistration of a device notification |
//! | [`NotificationSink`] | Callback receiving notification samples |
//!
//! Ordering guarantees: replies are matched by invoke id (no FIFO across
//! ports); within one notification channel, callbacks observe samples in
//! the exact byte order they arrived on the socket; nothing is promised
//! across channels.

/// Global constants (protocol port, port range, capacities, timeouts).
pub mod config;
/// Connection multiplexer: reader thread, response slots, request path.
pub mod connection;
/// Error types.
pub mod error;
/// Prepend-oriented frame buffer.
pub mod frame;
/// Device-notification subsystem (dispatchers, handles, callbacks).
pub mod notify;
/// AMS wire protocol: addresses, headers, command ids.
pub mod proto;
/// SPSC byte ring between reader thread and dispatcher workers.
pub mod ring;
/// Per-local-port response slots.
pub mod slot;
/// Blocking stream abstraction and TCP helpers.
pub mod transport;
/// Process-wide connection registry and port lease.
pub mod router;

pub use connection::{AmsConnection, ConnectionConfig};
pub use error::{AmsError, Result};
pub use frame::Frame;
pub use notify::{NotificationHandle, NotificationSink};
pub use proto::{AmsAddr, AmsNetId, CommandId};
pub use router::Router;
