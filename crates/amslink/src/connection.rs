// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One TCP connection to one ADS device, multiplexing all traffic.
//!
//! Caller threads build a [`Frame`], reserve the response slot of their
//! local port and block on it; a dedicated reader thread demultiplexes
//! everything coming back:
//!
//! ```text
//! callers ----write()---> +---------------+           +--------------+
//!    ^                    | AmsConnection |--- TCP -->| ADS device   |
//!    |   wake on reply    |  write lock   |           +--------------+
//!    +-- ResponseSlot <---|  reader thread|<-- frames ----+
//!                         +---------------+               |
//!                            | DEVICE_NOTIFICATION        |
//!                            v                            |
//!                    dispatcher ring --> worker --> user callback
//! ```
//!
//! Replies are matched by invoke id against the slot reserved on the
//! target port; notification frames are streamed into the ring of the
//! dispatcher registered for (target port, source address). The reader
//! never propagates protocol errors: a bad frame is drained and logged so
//! one rogue frame cannot poison the stream.

use crate::config::{
    ADS_TCP_SERVER_PORT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_FRAME_CAPACITY, DEFAULT_RING_CAPACITY,
    NUM_PORTS, PORT_BASE,
};
use crate::error::{AmsError, Result};
use crate::frame::Frame;
use crate::notify::{NotificationDispatcher, NotificationHandle, NotificationSink};
use crate::proto::{
    AmsAddr, AmsNetId, AmsTcpHeader, AoeHeader, CommandId, VirtualConnection,
};
use crate::slot::ResponseSlot;
use crate::transport::{self, AmsStream};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

// ============================================================================
// Configuration
// ============================================================================

/// Per-connection tuning knobs.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Source net id stamped into every outgoing AoE header.
    pub local_net_id: AmsNetId,

    /// Capacity of each dispatcher's notification ring.
    pub ring_capacity: usize,

    /// Capacity of each response-slot frame.
    pub frame_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            local_net_id: AmsNetId::default(),
            ring_capacity: DEFAULT_RING_CAPACITY,
            frame_capacity: DEFAULT_FRAME_CAPACITY,
        }
    }
}

// ============================================================================
// Dispatcher table
// ============================================================================

/// Dispatchers keyed by (local port, remote endpoint).
///
/// A single locked get-or-insert; lookup happens per incoming notification
/// frame, insertion only when a channel first subscribes.
struct DispatcherTable {
    map: Mutex<HashMap<VirtualConnection, Arc<NotificationDispatcher>>>,
    ring_capacity: usize,
}

impl DispatcherTable {
    fn new(ring_capacity: usize) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            ring_capacity,
        }
    }

    fn get(&self, key: &VirtualConnection) -> Option<Arc<NotificationDispatcher>> {
        self.map.lock().get(key).cloned()
    }

    fn get_or_insert(&self, key: VirtualConnection) -> io::Result<Arc<NotificationDispatcher>> {
        let mut map = self.map.lock();
        if let Some(existing) = map.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let dispatcher = Arc::new(NotificationDispatcher::new(
            key.local_port,
            key.remote,
            self.ring_capacity,
        )?);
        map.insert(key, Arc::clone(&dispatcher));
        Ok(dispatcher)
    }
}

// ============================================================================
// Shared state (connection handle + reader thread)
// ============================================================================

struct Shared {
    stream: Arc<dyn AmsStream>,
    slots: Box<[ResponseSlot]>,
    dispatchers: DispatcherTable,

    /// Flipped once the reader exits; writers fail fast afterwards.
    closed: AtomicBool,
}

impl Shared {
    fn slot(&self, port: u16) -> Result<&ResponseSlot> {
        let index = port
            .checked_sub(PORT_BASE)
            .map(usize::from)
            .filter(|i| *i < NUM_PORTS);
        match index {
            Some(i) => Ok(&self.slots[i]),
            None => Err(AmsError::InvalidPort { port }),
        }
    }
}

// ============================================================================
// AmsConnection
// ============================================================================

/// One long-lived TCP connection to a remote ADS device.
///
/// Owns the socket, the reader thread, the response-slot table and the
/// dispatcher table. Dropping the connection shuts the socket down, joins
/// the reader and then the dispatcher workers.
pub struct AmsConnection {
    shared: Arc<Shared>,
    local_net_id: AmsNetId,
    invoke_id: AtomicU32,
    write_lock: Mutex<()>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl AmsConnection {
    /// Connect to the standard ADS port of `dest_ip`.
    pub fn connect(dest_ip: Ipv4Addr, config: ConnectionConfig) -> Result<Arc<Self>> {
        Self::connect_to(
            SocketAddr::new(dest_ip.into(), ADS_TCP_SERVER_PORT),
            config,
        )
    }

    /// Connect to an explicit socket address (tests run loopback devices on
    /// ephemeral ports).
    pub fn connect_to(addr: SocketAddr, config: ConnectionConfig) -> Result<Arc<Self>> {
        let stream = transport::connect(addr, DEFAULT_CONNECT_TIMEOUT)?;
        Self::open(Arc::new(stream), config)
    }

    /// Wrap an already-connected stream and launch the reader thread.
    pub fn open(stream: Arc<dyn AmsStream>, config: ConnectionConfig) -> Result<Arc<Self>> {
        let slots = (0..NUM_PORTS)
            .map(|_| ResponseSlot::new(config.frame_capacity))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let shared = Arc::new(Shared {
            stream,
            slots,
            dispatchers: DispatcherTable::new(config.ring_capacity),
            closed: AtomicBool::new(false),
        });

        let reader_shared = Arc::clone(&shared);
        let reader = std::thread::Builder::new()
            .name("amslink-recv".to_string())
            .spawn(move || recv_loop(&reader_shared))
            .map_err(AmsError::Transport)?;

        Ok(Arc::new(Self {
            shared,
            local_net_id: config.local_net_id,
            invoke_id: AtomicU32::new(0),
            write_lock: Mutex::new(()),
            reader: Mutex::new(Some(reader)),
        }))
    }

    /// Source net id of this connection.
    pub fn local_net_id(&self) -> AmsNetId {
        self.local_net_id
    }

    /// Whether the reader thread has terminated (socket gone).
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Next invoke id; wraps but never hands out 0, which marks a free slot.
    fn next_invoke_id(&self) -> u32 {
        loop {
            let id = self.invoke_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Frame the request and send it, reserving the response slot of
    /// `source.port`. The caller blocks on the returned slot; on timeout it
    /// must release it (the [`request`](Self::request) helper does).
    pub fn write(
        &self,
        frame: &mut Frame,
        dest: AmsAddr,
        source: AmsAddr,
        cmd: CommandId,
    ) -> Result<&ResponseSlot> {
        if self.is_closed() {
            return Err(AmsError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            )));
        }

        let invoke_id = self.next_invoke_id();
        let aoe = AoeHeader::request(dest, source, cmd, frame.len() as u32, invoke_id);
        frame.prepend(&aoe.encode())?;
        frame.prepend(&AmsTcpHeader::new(frame.len() as u32).encode())?;

        let slot = self.shared.slot(source.port)?;
        if !slot.reserve(invoke_id) {
            log::warn!(
                "[conn] port {} already in use as {:#x}",
                source.port,
                slot.invoke_id()
            );
            return Err(AmsError::BusyPort { port: source.port });
        }

        // One logical frame per lock hold; the reader never writes.
        let written = {
            let _guard = self.write_lock.lock();
            self.shared.stream.write_all(frame.data())
        };
        if let Err(e) = written {
            slot.release();
            return Err(AmsError::Transport(e));
        }

        Ok(slot)
    }

    /// Round trip: send `frame` and wait up to `timeout` for the reply
    /// payload. The slot is always released on the way out, so a timeout
    /// never strands the port.
    pub fn request(
        &self,
        frame: &mut Frame,
        dest: AmsAddr,
        source: AmsAddr,
        cmd: CommandId,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let slot = self.write(frame, dest, source, cmd)?;

        if !slot.wait(timeout) {
            slot.release();
            return Err(AmsError::TimedOut);
        }
        if slot.was_aborted() {
            return Err(AmsError::Transport(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed while waiting for reply",
            )));
        }

        let data = slot.take_data();
        slot.release();
        Ok(data)
    }

    /// Register a notification callback on the dispatcher for
    /// (local port, remote), creating the dispatcher on first use.
    ///
    /// `handle` is the notification handle the device assigned via
    /// ADD_DEVICE_NOTIFICATION; `length` the registered payload size.
    pub fn create_notify_mapping(
        self: &Arc<Self>,
        local_port: u16,
        remote: AmsAddr,
        length: u32,
        handle: u32,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<NotificationHandle> {
        let dispatcher = self
            .shared
            .dispatchers
            .get_or_insert(VirtualConnection { local_port, remote })
            .map_err(AmsError::Transport)?;
        dispatcher.emplace(handle, length, sink);
        Ok(NotificationHandle::new(
            handle,
            remote,
            local_port,
            Arc::downgrade(&dispatcher),
            Arc::downgrade(self),
        ))
    }

    /// Tell the device to stop a notification and wait for its reply.
    pub fn delete_notification(
        &self,
        remote: AmsAddr,
        handle: u32,
        timeout: Duration,
        local_port: u16,
    ) -> Result<()> {
        let mut frame = Frame::new(AmsTcpHeader::SIZE + AoeHeader::SIZE + 4);
        frame.prepend(&handle.to_le_bytes())?;

        let source = AmsAddr::new(self.local_net_id, local_port);
        let reply = self.request(
            &mut frame,
            remote,
            source,
            CommandId::DelDeviceNotification,
            timeout,
        )?;

        // Replies to commands open with a u32 ADS result code.
        if reply.len() >= 4 {
            let code = u32::from_le_bytes([reply[0], reply[1], reply[2], reply[3]]);
            if code != 0 {
                return Err(AmsError::Device(code));
            }
        }
        Ok(())
    }
}

impl Drop for AmsConnection {
    fn drop(&mut self) {
        if let Err(e) = self.shared.stream.shutdown() {
            log::debug!("[conn] socket shutdown: {}", e);
        }
        if let Some(reader) = self.reader.lock().take() {
            if reader.join().is_err() {
                log::error!("[conn] reader thread panicked");
            }
        }
        // Dispatchers (and their workers) go down with the last Shared ref.
    }
}

// ============================================================================
// Reader thread
// ============================================================================

/// Reader loop: protocol errors are logged and the stream continues; the
/// first transport error terminates the loop, which then releases every
/// reserved slot so no caller strands on close.
fn recv_loop(shared: &Shared) {
    loop {
        match recv_one(shared) {
            Ok(()) => {}
            Err(e) if e.is_protocol() => log::warn!("[conn] {}", e),
            Err(e) => {
                log::info!("[conn] reader exiting: {}", e);
                break;
            }
        }
    }

    shared.closed.store(true, Ordering::Release);
    for slot in shared.slots.iter() {
        if slot.invoke_id() != 0 {
            slot.abort();
        }
    }
}

fn recv_one(shared: &Shared) -> Result<()> {
    let stream = &*shared.stream;

    let mut tcp_raw = [0u8; AmsTcpHeader::SIZE];
    transport::read_exact(stream, &mut tcp_raw)?;
    let frame_length = AmsTcpHeader::decode(tcp_raw).length as usize;

    if frame_length < AoeHeader::SIZE {
        transport::drain(stream, frame_length)?;
        return Err(AmsError::MalformedFrame {
            reason: "frame too short to carry an AoE header",
        });
    }

    let mut aoe_raw = [0u8; AoeHeader::SIZE];
    transport::read_exact(stream, &mut aoe_raw)?;
    let header = AoeHeader::decode(&aoe_raw);
    let payload_length = frame_length - AoeHeader::SIZE;

    if header.length as usize != payload_length {
        transport::drain(stream, payload_length)?;
        return Err(AmsError::MalformedFrame {
            reason: "AoE and AMS/TCP length fields disagree",
        });
    }

    if header.cmd_id == CommandId::DeviceNotification.as_u16() {
        receive_notification(shared, &header, payload_length)
    } else {
        receive_reply(shared, &header, payload_length)
    }
}

/// Stream a DEVICE_NOTIFICATION payload into its dispatcher's ring.
fn receive_notification(shared: &Shared, header: &AoeHeader, length: usize) -> Result<()> {
    let stream = &*shared.stream;
    let key = VirtualConnection {
        local_port: header.target.port,
        remote: header.source,
    };

    let dispatcher = match shared.dispatchers.get(&key) {
        Some(d) => d,
        None => {
            transport::drain(stream, length)?;
            return Err(AmsError::MalformedFrame {
                reason: "notification for a channel with no dispatcher",
            });
        }
    };

    if length < 4 {
        transport::drain(stream, length)?;
        return Err(AmsError::MalformedFrame {
            reason: "notification payload shorter than its length field",
        });
    }

    let ring = dispatcher.ring();
    let free = ring.bytes_free();
    if length > free {
        transport::drain(stream, length)?;
        return Err(AmsError::BufferOverflow {
            needed: length,
            free,
        });
    }

    // The payload's leading u32 must frame exactly the rest; the worker
    // relies on it to delimit frames inside the ring.
    let mut stream_length_raw = [0u8; 4];
    transport::read_exact(stream, &mut stream_length_raw)?;
    if u32::from_le_bytes(stream_length_raw) as usize != length - 4 {
        transport::drain(stream, length - 4)?;
        return Err(AmsError::MalformedFrame {
            reason: "notification stream length disagrees with frame length",
        });
    }

    // Known to fit: the free-space check covered prefix + stream.
    let _ = ring.produce(&stream_length_raw);
    ring.fill_with(length - 4, |chunk| transport::read_exact(stream, chunk))?;
    dispatcher.notify();
    Ok(())
}

/// Match a reply to the slot reserved on its target port and wake the
/// waiter.
fn receive_reply(shared: &Shared, header: &AoeHeader, length: usize) -> Result<()> {
    let stream = &*shared.stream;

    let slot = match shared.slot(header.target.port) {
        Ok(slot) => slot,
        Err(_) => {
            transport::drain(stream, length)?;
            return Err(AmsError::MalformedFrame {
                reason: "reply addressed to a port outside the leased range",
            });
        }
    };

    let expected = slot.invoke_id();
    if expected != header.invoke_id {
        transport::drain(stream, length)?;
        return Err(AmsError::InvokeIdMismatch {
            expected,
            received: header.invoke_id,
        });
    }

    let accepted = CommandId::from_u16(header.cmd_id)
        .map(CommandId::is_reply)
        .unwrap_or(false);
    if !accepted {
        log::warn!("[conn] unknown AMS command id {:#x}", header.cmd_id);
    }

    slot.complete(|frame| {
        if length > frame.capacity() {
            log::warn!(
                "[conn] reply of {} bytes exceeds slot frame capacity {}",
                length,
                frame.capacity()
            );
            transport::drain(stream, length)?;
            frame.reset();
            return Ok(());
        }
        let window = frame
            .window_mut(length)
            .map_err(|e| io::Error::other(e.to_string()))?;
        transport::read_exact(stream, window)?;
        if !accepted {
            // Unknown opcode: the waiter is woken with an empty frame.
            frame.clear();
        }
        Ok(())
    })?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
