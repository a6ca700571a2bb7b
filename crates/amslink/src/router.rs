// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide connection registry and local port lease.
//!
//! The router owns one [`AmsConnection`] per destination IP and hands out
//! local AMS ports from the fixed range `[PORT_BASE, PORT_END]`. Tearing
//! the router down drops every connection it owns, which joins the reader
//! and dispatcher threads; nothing is left running past `close_all`.

use crate::config::{ADS_TCP_SERVER_PORT, NUM_PORTS, PORT_BASE};
use crate::connection::{AmsConnection, ConnectionConfig};
use crate::error::{AmsError, Result};
use crate::proto::{AmsAddr, AmsNetId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

/// Registry of AMS connections, routes and leased local ports.
pub struct Router {
    local_net_id: Mutex<AmsNetId>,
    connections: Mutex<HashMap<Ipv4Addr, Arc<AmsConnection>>>,
    routes: Mutex<HashMap<AmsNetId, Ipv4Addr>>,
    ports: Mutex<[bool; NUM_PORTS]>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            local_net_id: Mutex::new(AmsNetId::default()),
            connections: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            ports: Mutex::new([false; NUM_PORTS]),
        }
    }

    pub fn with_net_id(net_id: AmsNetId) -> Self {
        let router = Self::new();
        *router.local_net_id.lock() = net_id;
        router
    }

    /// Source net id stamped into new connections. Existing connections
    /// keep the id they were created with.
    pub fn set_local_net_id(&self, net_id: AmsNetId) {
        *self.local_net_id.lock() = net_id;
    }

    pub fn local_net_id(&self) -> AmsNetId {
        *self.local_net_id.lock()
    }

    /// Local AMS endpoint for a leased port.
    pub fn local_address(&self, port: u16) -> AmsAddr {
        AmsAddr::new(self.local_net_id(), port)
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Connection to `dest_ip`, established on first use (standard ADS
    /// port).
    pub fn get_connection(&self, dest_ip: Ipv4Addr) -> Result<Arc<AmsConnection>> {
        self.open_connection(dest_ip, SocketAddr::new(dest_ip.into(), ADS_TCP_SERVER_PORT))
    }

    /// Get-or-connect with an explicit socket address (non-standard ports,
    /// loopback test devices). Still keyed by `dest_ip`.
    pub fn open_connection(
        &self,
        dest_ip: Ipv4Addr,
        addr: SocketAddr,
    ) -> Result<Arc<AmsConnection>> {
        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(&dest_ip) {
            return Ok(Arc::clone(existing));
        }

        let config = ConnectionConfig {
            local_net_id: self.local_net_id(),
            ..ConnectionConfig::default()
        };
        let connection = AmsConnection::connect_to(addr, config)?;
        log::info!("[router] connected to {}", addr);
        connections.insert(dest_ip, Arc::clone(&connection));
        Ok(connection)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Drop every owned connection, joining their reader and dispatcher
    /// threads. Callers still blocked in a request observe the teardown
    /// within their own timeout.
    pub fn close_all(&self) {
        let dropped = {
            let mut connections = self.connections.lock();
            connections.drain().count()
        };
        if dropped > 0 {
            log::info!("[router] closed {} connection(s)", dropped);
        }
    }

    // ========================================================================
    // Routes
    // ========================================================================

    /// Map a remote AMS net id onto the IP to reach it through.
    pub fn add_route(&self, net_id: AmsNetId, dest_ip: Ipv4Addr) {
        self.routes.lock().insert(net_id, dest_ip);
    }

    /// Remove a route and drop the connection serving it, if any.
    pub fn del_route(&self, net_id: AmsNetId) {
        // The scrutinee guard of an `if let` lives for the whole body; bind
        // the removal first so the lock is released before re-acquiring.
        let removed = self.routes.lock().remove(&net_id);
        if let Some(ip) = removed {
            // Keep the connection if another route still uses the same IP.
            let still_used = self.routes.lock().values().any(|v| *v == ip);
            if !still_used {
                self.connections.lock().remove(&ip);
            }
        }
    }

    pub fn resolve(&self, net_id: AmsNetId) -> Option<Ipv4Addr> {
        self.routes.lock().get(&net_id).copied()
    }

    // ========================================================================
    // Port lease
    // ========================================================================

    /// Lease a local AMS port from `[PORT_BASE, PORT_END]`.
    pub fn alloc_port(&self) -> Result<u16> {
        let mut ports = self.ports.lock();
        for (index, used) in ports.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return Ok(PORT_BASE + index as u16);
            }
        }
        Err(AmsError::PortExhausted)
    }

    /// Return a leased port to the pool.
    pub fn free_port(&self, port: u16) {
        let index = port.checked_sub(PORT_BASE).map(usize::from);
        match index.filter(|i| *i < NUM_PORTS) {
            Some(i) => {
                let mut ports = self.ports.lock();
                if !ports[i] {
                    log::warn!("[router] port {} freed but was not leased", port);
                }
                ports[i] = false;
            }
            None => log::warn!("[router] port {} is outside the lease range", port),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.close_all();
    }
}
