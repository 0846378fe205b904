// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Readiness notification shared between a listener and the threads waiting on it.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use bitflags::bitflags;

bitflags! {
    /// Readiness events a waiter may observe.
    pub struct EventSet: u8 {
        /// The object is readable (an accepted connection can be picked up, or it closed).
        const IN = 1 << 0;
        /// The object is writable.
        const OUT = 1 << 1;
    }
}

/// Accumulates readiness events and wakes up the threads waiting for them.
///
/// Events are sticky until consumed by a waiter, so a notification is never lost to a thread
/// which starts waiting slightly too late.
pub struct WaiterQueue {
    pending: Mutex<EventSet>,
    cond: Condvar,
}

impl WaiterQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        WaiterQueue {
            pending: Mutex::new(EventSet::empty()),
            cond: Condvar::new(),
        }
    }

    /// Records `events` and wakes up all current waiters.
    pub fn notify(&self, events: EventSet) {
        let mut pending = self.pending.lock().expect("Poisoned lock");
        pending.insert(events);
        self.cond.notify_all();
    }

    /// Returns the currently pending events without consuming them.
    pub fn pending(&self) -> EventSet {
        *self.pending.lock().expect("Poisoned lock")
    }

    /// Blocks until at least one event in `mask` is pending, then consumes and returns the
    /// pending subset of `mask`.
    pub fn wait(&self, mask: EventSet) -> EventSet {
        let mut pending = self.pending.lock().expect("Poisoned lock");
        loop {
            let ready = *pending & mask;
            if !ready.is_empty() {
                pending.remove(ready);
                return ready;
            }
            pending = self.cond.wait(pending).expect("Poisoned lock");
        }
    }

    /// Like [`wait`], giving up after `timeout`. Returns the empty set on timeout.
    ///
    /// [`wait`]: #method.wait
    pub fn wait_timeout(&self, mask: EventSet, timeout: Duration) -> EventSet {
        let mut pending = self.pending.lock().expect("Poisoned lock");
        loop {
            let ready = *pending & mask;
            if !ready.is_empty() {
                pending.remove(ready);
                return ready;
            }
            let (guard, res) = self
                .cond
                .wait_timeout(pending, timeout)
                .expect("Poisoned lock");
            pending = guard;
            if res.timed_out() {
                let ready = *pending & mask;
                pending.remove(ready);
                return ready;
            }
        }
    }
}

impl Default for WaiterQueue {
    fn default() -> Self {
        Self::new()
    }
}
