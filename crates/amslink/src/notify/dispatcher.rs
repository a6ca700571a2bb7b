// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Notification dispatcher: one worker thread per subscription channel.
//!
//! The reader thread is the ring producer; the worker is the consumer. A
//! frame sits in the ring as `[length: u32][stream: length bytes]` where
//! `stream` is the device-notification layout parsed by
//! [`crate::proto::parse_notification_stream`]. The worker only picks up a
//! frame once all of its bytes are present, so a producer caught mid-write
//! never yields a torn frame.

use super::NotificationSink;
use crate::proto::{parse_notification_stream, AmsAddr};
use crate::ring::ByteRing;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

struct Subscription {
    sink: Arc<dyn NotificationSink>,
    /// Payload size promised at registration; larger samples are still
    /// delivered but logged.
    length: u32,
}

#[derive(Default)]
struct WorkerState {
    data_ready: bool,
    terminated: bool,
}

struct Inner {
    local_port: u16,
    remote: AmsAddr,
    ring: ByteRing,
    subscriptions: Mutex<HashMap<u32, Subscription>>,
    state: Mutex<WorkerState>,
    cv: Condvar,
}

/// Per-(local port, remote endpoint) notification channel.
///
/// Created lazily on the first subscription for the pair; destroyed only
/// with the owning connection. Removing the last subscription keeps the
/// dispatcher warm for the next one.
pub struct NotificationDispatcher {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    pub fn new(local_port: u16, remote: AmsAddr, ring_capacity: usize) -> std::io::Result<Self> {
        let inner = Arc::new(Inner {
            local_port,
            remote,
            ring: ByteRing::with_capacity(ring_capacity),
            subscriptions: Mutex::new(HashMap::new()),
            state: Mutex::new(WorkerState::default()),
            cv: Condvar::new(),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name(format!("amslink-notify-{}", local_port))
            .spawn(move || worker_inner.run())?;

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.inner.local_port
    }

    pub fn remote(&self) -> AmsAddr {
        self.inner.remote
    }

    /// Ring the reader thread streams notification frames into.
    pub(crate) fn ring(&self) -> &ByteRing {
        &self.inner.ring
    }

    /// Register a subscription under the device-assigned handle.
    pub fn emplace(&self, handle: u32, length: u32, sink: Arc<dyn NotificationSink>) {
        let previous = self
            .inner
            .subscriptions
            .lock()
            .insert(handle, Subscription { sink, length });
        if previous.is_some() {
            log::warn!(
                "[notify] handle {:#x} re-registered on port {}, replacing callback",
                handle,
                self.inner.local_port
            );
        }
    }

    /// Drop a subscription. Returns whether it existed.
    pub fn erase(&self, handle: u32) -> bool {
        self.inner.subscriptions.lock().remove(&handle).is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    /// Signal the worker that new ring bytes arrived.
    pub fn notify(&self) {
        let mut state = self.inner.state.lock();
        state.data_ready = true;
        self.inner.cv.notify_one();
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.terminated = true;
            self.inner.cv.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!(
                    "[notify] worker for port {} panicked",
                    self.inner.local_port
                );
            }
        }
    }
}

impl Inner {
    /// Worker body: wait for a wakeup, then drain whole frames to callbacks.
    fn run(&self) {
        let mut scratch: Vec<u8> = Vec::new();
        loop {
            {
                let mut state = self.state.lock();
                while !state.data_ready && !state.terminated {
                    self.cv.wait(&mut state);
                }
                if state.terminated {
                    return;
                }
                state.data_ready = false;
            }
            self.drain(&mut scratch);
        }
    }

    fn drain(&self, scratch: &mut Vec<u8>) {
        loop {
            let mut len_bytes = [0u8; 4];
            if !self.ring.peek(&mut len_bytes) {
                return;
            }
            let length = u32::from_le_bytes(len_bytes) as usize;

            if length + 4 > self.ring.capacity() {
                // The advertised frame can never fit; the stream position is
                // unrecoverable, so flush the ring.
                log::warn!(
                    "[notify] port {}: frame of {} bytes exceeds ring capacity {}, flushing",
                    self.local_port,
                    length,
                    self.ring.capacity()
                );
                self.ring.skip(self.ring.bytes_used());
                return;
            }

            if self.ring.bytes_used() < length + 4 {
                // Frame still streaming in; the producer notifies again
                // once the rest arrived.
                return;
            }

            self.ring.skip(4);
            scratch.resize(length, 0);
            self.ring.consume_into(scratch);

            if let Err(e) = parse_notification_stream(scratch, |sample| {
                self.deliver(sample.timestamp, sample.handle, sample.payload)
            }) {
                log::warn!("[notify] port {}: {}", self.local_port, e);
            }
        }
    }

    fn deliver(&self, timestamp: u64, handle: u32, payload: &[u8]) {
        // Clone the sink out so a callback may deregister without
        // deadlocking on the subscription map.
        let subscription = {
            let subscriptions = self.subscriptions.lock();
            subscriptions
                .get(&handle)
                .map(|s| (Arc::clone(&s.sink), s.length))
        };

        let (sink, length) = match subscription {
            Some(s) => s,
            None => {
                log::debug!(
                    "[notify] port {}: no subscription for handle {:#x}",
                    self.local_port,
                    handle
                );
                return;
            }
        };

        if payload.len() > length as usize {
            log::debug!(
                "[notify] handle {:#x}: sample of {} bytes exceeds registered length {}",
                handle,
                payload.len(),
                length
            );
        }

        let result = catch_unwind(AssertUnwindSafe(|| {
            sink.on_sample(&self.remote, timestamp, handle, payload);
        }));
        if result.is_err() {
            log::warn!(
                "[notify] callback for handle {:#x} panicked, channel continues",
                handle
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
