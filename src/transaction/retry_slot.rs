// Copyright 2018-2026 wstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// A one-shot wake slot for a thread blocked in a retry.
///
/// The blocked thread registers the slot on every variable it has read;
/// a commit to any of them signals the slot. Signals are sticky: a
/// notify before the wait makes the wait return immediately, which
/// covers the window between registration and blocking.
pub(crate) struct RetrySlot {
    /// True once a watched variable has changed.
    woken: AtomicBool,

    /// Lock for the condition variable.
    lock: Mutex<()>,

    /// Pauses and wakes the waiting thread.
    cvar: Condvar,
}

impl RetrySlot {
    pub fn new() -> RetrySlot {
        RetrySlot {
            woken: AtomicBool::new(false),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    /// Inform the slot that a variable has changed.
    ///
    /// Called by committing threads. The flag is flipped under the lock
    /// so that a waiter between its check and its wait cannot miss the
    /// signal.
    pub fn notify(&self) {
        let _guard = self.lock.lock();
        self.woken.store(true, Ordering::SeqCst);
        self.cvar.notify_one();
    }

    /// Block until the slot is signalled or `deadline` passes.
    ///
    /// Returns true when woken by a signal, false on timeout. May return
    /// immediately if the signal arrived first.
    pub fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut guard = self.lock.lock();
        while !self.woken.load(Ordering::SeqCst) {
            match deadline {
                Some(deadline) => {
                    if self.cvar.wait_until(&mut guard, deadline).timed_out() {
                        return self.woken.load(Ordering::SeqCst);
                    }
                }
                None => self.cvar.wait(&mut guard),
            }
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::{terminates, terminates_async};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wait_blocks() {
        let slot = RetrySlot::new();
        assert!(!terminates(100, move || {
            slot.wait_until(None);
        }));
    }

    /// A slot returns immediately when it was signalled before the wait.
    ///
    /// This happens when a variable changes while the transaction is
    /// still registering on other variables.
    #[test]
    fn wait_after_notify() {
        let slot = RetrySlot::new();
        slot.notify();
        assert!(terminates(50, move || {
            slot.wait_until(None);
        }));
    }

    #[test]
    fn wait_after_multiple_notifies() {
        let slot = RetrySlot::new();
        slot.notify();
        slot.notify();
        slot.notify();

        assert!(terminates(50, move || {
            slot.wait_until(None);
        }));
    }

    #[test]
    fn threaded_wakeup() {
        let slot = Arc::new(RetrySlot::new());
        let slot2 = slot.clone();
        let terminated = terminates_async(
            500,
            move || {
                assert!(slot.wait_until(None));
            },
            move || slot2.notify(),
        );

        assert!(terminated);
    }

    #[test]
    fn wait_times_out() {
        let slot = RetrySlot::new();
        let deadline = Instant::now() + Duration::from_millis(20);

        assert!(!slot.wait_until(Some(deadline)));
    }
}
