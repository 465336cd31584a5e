// Copyright 2018-2026 wstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::registry::{self, SharedGuard};
use crate::result::InAtomicError;
use crate::transaction::transaction_active;
use crate::var::{ArcAny, VarCore};

/// Handle passed to operations run by [`inconsistently`]. Its only use
/// is reading [`Var`](crate::Var)s.
pub struct Inconsistent {
    /// Shared grant pinned by `read_lock`.
    guard: Option<SharedGuard>,
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Inconsistent {
    fn new() -> Inconsistent {
        Inconsistent {
            guard: None,
            depth: 0,
            _not_send: PhantomData,
        }
    }

    /// Sample the current payload of a cell. Nothing is logged.
    pub(crate) fn read_erased(&self, core: &Arc<VarCore>) -> ArcAny {
        match &self.guard {
            Some(_) => core.current().payload.clone(),
            None => {
                let _grant = registry::shared();
                core.current().payload.clone()
            }
        }
    }

    /// Pin one shared grant across many reads, like
    /// [`Transaction::read_lock`](crate::Transaction::read_lock).
    ///
    /// Release the grant before starting a nested `atomically`: its
    /// commit needs the exclusive grant and would deadlock against a
    /// grant pinned on the same thread.
    pub fn read_lock(&mut self) {
        self.depth += 1;
        if self.depth == 1 {
            self.guard = Some(registry::shared());
        }
    }

    /// Release the grant pinned by [`read_lock`](Inconsistent::read_lock).
    ///
    /// Unbalanced calls are a usage error and panic.
    pub fn read_unlock(&mut self) {
        assert!(self.depth > 0, "read_unlock without a matching read_lock");
        self.depth -= 1;
        if self.depth == 0 {
            self.guard = None;
        }
    }

    /// True while a shared grant is pinned.
    pub fn is_read_locked(&self) -> bool {
        self.depth > 0
    }
}

/// Run `op` in an inconsistent, read-only fashion.
///
/// Reads are thread-safe but not logged: reading the same `Var` twice
/// can observe different values if other transactions commit in
/// between. The operation cannot write, cannot retry and is never
/// re-run. Use this when a bunch of variables need to be read and it
/// does not matter that they change while the reading is going on.
///
/// Calling this inside a transaction is a usage error and panics with
/// [`InAtomicError`]. The other direction works: `op` may open a
/// nested `atomically`, which commits before control returns to `op`.
pub fn inconsistently<T, F>(mut op: F) -> T
where
    F: FnMut(&mut Inconsistent) -> T,
{
    if transaction_active() {
        panic!("{}", InAtomicError);
    }
    let mut ins = Inconsistent::new();
    op(&mut ins)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{atomically, Var};

    #[test]
    fn reads_current_value() {
        let var = Var::new(7);

        let x = inconsistently(|ins| var.get_inconsistent(ins));

        assert_eq!(x, 7);
    }

    #[test]
    fn rereads_observe_commits() {
        let var = Var::new(0);

        inconsistently(|ins| {
            assert_eq!(var.get_inconsistent(ins), 0);
            // A nested transaction commits while the inconsistent
            // operation is still running.
            atomically(|tx| var.set(tx, 1));
            assert_eq!(var.get_inconsistent(ins), 1);
        });
    }

    #[test]
    fn read_lock_is_reentrant() {
        let var = Var::new(3);

        inconsistently(|ins| {
            ins.read_lock();
            ins.read_lock();
            assert!(ins.is_read_locked());
            let x = var.get_inconsistent(ins);
            ins.read_unlock();
            ins.read_unlock();
            assert!(!ins.is_read_locked());
            assert_eq!(x, 3);
        });
    }

    #[test]
    #[should_panic(expected = "read_unlock without a matching read_lock")]
    fn unbalanced_read_unlock_panics() {
        inconsistently(|ins| ins.read_unlock());
    }

    #[test]
    #[should_panic(expected = "not allowed inside a transaction")]
    fn forbidden_inside_atomically() {
        atomically(|_| {
            inconsistently(|_| ());
            Ok(())
        });
    }
}
