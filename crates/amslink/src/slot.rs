// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-local-port response slot.
//!
//! Each local AMS port owns exactly one slot. A caller reserves it with
//! the request's invoke id (a CAS from 0), sends the request, then blocks
//! on the slot until the reader thread stores the reply and wakes it.
//! `invoke_id == 0` means free; nonzero means one request is in flight and
//! at most one caller may wait.

use crate::frame::Frame;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct ResponseSlot {
    /// 0 = free; nonzero = reserved by the request with this invoke id.
    invoke_id: AtomicU32,

    /// Set when the connection tears down under a waiter; the waiter maps
    /// its wakeup to a transport error instead of an empty reply.
    aborted: AtomicBool,

    /// Reply bytes; doubles as the condvar's mutex so completion and
    /// wakeup cannot race.
    frame: Mutex<Frame>,
    cv: Condvar,
}

impl ResponseSlot {
    pub fn new(frame_capacity: usize) -> Self {
        Self {
            invoke_id: AtomicU32::new(0),
            aborted: AtomicBool::new(false),
            frame: Mutex::new(Frame::new(frame_capacity)),
            cv: Condvar::new(),
        }
    }

    /// Invoke id of the in-flight request, 0 if free.
    pub fn invoke_id(&self) -> u32 {
        self.invoke_id.load(Ordering::Acquire)
    }

    /// Try to claim the slot for `id`. Fails if another request is already
    /// in flight on this port.
    pub fn reserve(&self, id: u32) -> bool {
        debug_assert_ne!(id, 0, "invoke id 0 is the free marker");
        if self
            .invoke_id
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.aborted.store(false, Ordering::Release);
        true
    }

    /// Give up a reservation (send failure or timeout): reset the frame
    /// and free the slot.
    pub fn release(&self) {
        let mut frame = self.frame.lock();
        frame.reset();
        self.invoke_id.store(0, Ordering::Release);
    }

    /// Reader side: fill the frame with the reply, then free the slot and
    /// wake the waiter. The mutex is held across both so the waiter cannot
    /// miss the wakeup.
    pub fn complete<F>(&self, fill: F) -> io::Result<()>
    where
        F: FnOnce(&mut Frame) -> io::Result<()>,
    {
        let mut frame = self.frame.lock();
        let result = fill(&mut frame);
        self.invoke_id.store(0, Ordering::Release);
        self.cv.notify_all();
        result
    }

    /// Teardown: free the slot and wake the waiter, flagging the wakeup as
    /// an abort.
    pub fn abort(&self) {
        let _frame = self.frame.lock();
        self.aborted.store(true, Ordering::Release);
        self.invoke_id.store(0, Ordering::Release);
        self.cv.notify_all();
    }

    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Block until the reply arrives or `timeout` expires. Returns true
    /// iff notified (reply stored or aborted); false on timeout, leaving
    /// the reservation for the caller to release.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut frame = self.frame.lock();
        while self.invoke_id.load(Ordering::Acquire) != 0 {
            if self.cv.wait_until(&mut frame, deadline).timed_out() {
                // Recheck: completion may have slipped in before the lock
                // was reacquired.
                return self.invoke_id.load(Ordering::Acquire) == 0;
            }
        }
        true
    }

    /// Copy the reply payload out.
    pub fn take_data(&self) -> Vec<u8> {
        self.frame.lock().data().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_reserve_is_exclusive() {
        let slot = ResponseSlot::new(64);
        assert!(slot.reserve(1));
        assert!(!slot.reserve(2), "reserved slot must reject a second claim");
        assert_eq!(slot.invoke_id(), 1);

        slot.release();
        assert_eq!(slot.invoke_id(), 0);
        assert!(slot.reserve(2));
    }

    #[test]
    fn test_concurrent_reservation_single_winner() {
        let slot = Arc::new(ResponseSlot::new(64));
        let mut handles = Vec::new();
        for id in 1..=8u32 {
            let slot = Arc::clone(&slot);
            handles.push(thread::spawn(move || slot.reserve(id)));
        }
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_wait_times_out_and_keeps_reservation() {
        let slot = ResponseSlot::new(64);
        assert!(slot.reserve(1));

        let notified = slot.wait(Duration::from_millis(20));
        assert!(!notified);
        assert_eq!(slot.invoke_id(), 1, "timeout must not free the slot");
    }

    #[test]
    fn test_complete_wakes_waiter_with_payload() {
        let slot = Arc::new(ResponseSlot::new(64));
        assert!(slot.reserve(7));

        let waiter_slot = Arc::clone(&slot);
        let waiter = thread::spawn(move || {
            let notified = waiter_slot.wait(Duration::from_millis(500));
            (notified, waiter_slot.take_data())
        });

        thread::sleep(Duration::from_millis(20));
        slot.complete(|frame| {
            frame.window_mut(4).unwrap().copy_from_slice(&[1, 0, 0, 0]);
            Ok(())
        })
        .unwrap();

        let (notified, data) = waiter.join().unwrap();
        assert!(notified);
        assert_eq!(data, vec![1, 0, 0, 0]);
        assert_eq!(slot.invoke_id(), 0);
        assert!(!slot.was_aborted());
    }

    #[test]
    fn test_abort_wakes_waiter_flagged() {
        let slot = Arc::new(ResponseSlot::new(64));
        assert!(slot.reserve(3));

        let waiter_slot = Arc::clone(&slot);
        let waiter = thread::spawn(move || waiter_slot.wait(Duration::from_millis(500)));

        thread::sleep(Duration::from_millis(20));
        slot.abort();

        assert!(waiter.join().unwrap(), "abort counts as a notification");
        assert!(slot.was_aborted());
        assert_eq!(slot.invoke_id(), 0);
    }

    #[test]
    fn test_reserve_clears_prior_abort() {
        let slot = ResponseSlot::new(64);
        assert!(slot.reserve(1));
        slot.abort();
        assert!(slot.was_aborted());

        assert!(slot.reserve(2));
        assert!(!slot.was_aborted());
    }

    #[test]
    fn test_release_resets_frame() {
        let slot = ResponseSlot::new(64);
        assert!(slot.reserve(1));
        slot.complete(|frame| {
            frame.window_mut(2).unwrap().copy_from_slice(b"ab");
            Ok(())
        })
        .unwrap();
        assert_eq!(slot.take_data(), b"ab");

        assert!(slot.reserve(2));
        slot.release();
        assert!(slot.take_data().is_empty());
    }
}
