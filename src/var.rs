// Copyright 2018-2026 wstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::any::Any;
use std::cmp;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{self, AtomicUsize};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::atomically;
use crate::inconsistent::Inconsistent;
use crate::result::Stm;
use crate::transaction::retry_slot::RetrySlot;
use crate::transaction::Transaction;

/// Type-erased shared payload of a value record.
pub(crate) type ArcAny = Arc<dyn Any + Send + Sync>;

/// A versioned value record.
///
/// A new record is allocated on every commit of a write entry. Old
/// records stay alive as long as a transaction snapshot still holds
/// their `Arc`, so readers never observe a torn value.
#[derive(Clone)]
pub(crate) struct Value {
    /// Strictly increasing per cell; never decreases within a program's
    /// lifetime.
    pub version: u64,
    pub payload: ArcAny,
}

/// `VarCore` contains all the useful data of a `Var` while being the same
/// type for every payload.
///
/// The core is accessed from other threads directly whereas `Var` is just
/// a typesafe wrapper around it. Its address doubles as the variable's
/// identity: the transaction log and the profiler both key on it.
pub(crate) struct VarCore {
    /// The current value record.
    ///
    /// Readers clone the `Arc` under the read half; a commit swaps the
    /// record under the write half while it holds the exclusive grant of
    /// the commit registry.
    pub value: RwLock<Arc<Value>>,

    /// Wake slots of threads blocked in a retry on this variable.
    wake_slots: Mutex<Vec<Weak<RetrySlot>>>,

    /// Count of abandoned wake slots.
    ///
    /// When many waiters have left but nobody commits to this variable,
    /// the list is compacted so that old slots don't pile up on a
    /// variable that is often read but rarely written.
    dead_slots: AtomicUsize,
}

impl VarCore {
    fn new(payload: ArcAny) -> Arc<VarCore> {
        Arc::new(VarCore {
            value: RwLock::new(Arc::new(Value {
                version: 0,
                payload,
            })),
            wake_slots: Mutex::new(Vec::new()),
            dead_slots: AtomicUsize::new(0),
        })
    }

    /// Snapshot the current value record.
    pub fn current(&self) -> Arc<Value> {
        self.value.read().clone()
    }

    /// Version of the current record.
    pub fn current_version(&self) -> u64 {
        self.value.read().version
    }

    /// Install `pending` as the current record, returning the replaced
    /// one. Only called while the caller holds the exclusive grant.
    pub fn commit(&self, pending: Arc<Value>) -> Arc<Value> {
        let mut guard = self.value.write();
        debug_assert!(pending.version > guard.version);
        mem::replace(&mut *guard, pending)
    }

    /// Wake and drain all slots registered on this variable.
    pub fn wake_all(&self) {
        // Atomically take the whole list.
        let slots = {
            let mut guard = self.wake_slots.lock();
            mem::take(&mut *guard)
        };

        // Signal everyone that is still waiting.
        for slot in slots.iter().filter_map(Weak::upgrade) {
            slot.notify();
        }
    }

    /// Register a thread's wake slot for mutations of `self`.
    pub fn wait(&self, slot: &Arc<RetrySlot>) {
        self.wake_slots.lock().push(Arc::downgrade(slot));
    }

    /// Mark one registered slot as dead.
    ///
    /// The list is only compacted once enough waiters have left. There
    /// is a benign race on the counter; compacting too early or too late
    /// does not change the semantics.
    pub fn set_dead(&self) {
        let deads = self.dead_slots.fetch_add(1, atomic::Ordering::Relaxed);
        if deads >= 64 {
            let mut guard = self.wake_slots.lock();
            self.dead_slots.store(0, atomic::Ordering::SeqCst);
            guard.retain(|slot| slot.upgrade().is_some());
        }
    }

    fn address(&self) -> usize {
        self as *const VarCore as usize
    }

    /// Identity of this cell in a profiling trace.
    pub fn key(&self) -> u64 {
        self.address() as u64
    }
}

// Cores are compared and ordered by address so that they can key the
// transaction log.

impl PartialEq for VarCore {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for VarCore {}

impl Ord for VarCore {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.address().cmp(&other.address())
    }
}

impl PartialOrd for VarCore {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A transactional variable.
///
/// Access to the contents is restricted to operations run by
/// [`atomically`](crate::atomically) and friends.
///
/// A `Var` can be moved but not cloned or copied. Copying could mean
/// copying the head value, which is better done explicitly with `get`
/// and `new`, or sharing the same cell, which an `Arc<Var<T>>` expresses
/// much more clearly.
///
/// The payload type must be cheap to clone and must not itself start a
/// transaction while being cloned or dropped.
pub struct Var<T> {
    /// The core is the inner of the variable; the rest of `Var` is the
    /// typesafe interface.
    core: Arc<VarCore>,

    _marker: PhantomData<T>,
}

impl<T> Var<T>
where
    T: Any + Send + Sync + Clone,
{
    /// Create a new `Var` with version 0.
    pub fn new(value: T) -> Var<T> {
        Var {
            core: VarCore::new(Arc::new(value)),
            _marker: PhantomData,
        }
    }

    /// Get the variable's value in the given transaction.
    ///
    /// The first read records the observed value record in the
    /// transaction log; later reads return it again, and a value written
    /// earlier in the transaction (or a parent) shadows it.
    pub fn get(&self, tx: &mut Transaction) -> Stm<T> {
        let payload = tx.get_erased(&self.core)?;
        Ok(downcast(payload))
    }

    /// Set the variable's value in the given transaction.
    ///
    /// The write is not visible to other threads until the top-level
    /// transaction commits. The value is cloned into the log rather than
    /// moved: restarts re-invoke the operation, so the caller's value
    /// source must remain usable.
    pub fn set(&self, tx: &mut Transaction, value: T) -> Stm<()> {
        tx.set_erased(&self.core, Arc::new(value))
    }

    /// Apply `f` to the content of the variable.
    ///
    /// ```
    /// # use wstm::{atomically, Var};
    /// let var = Var::new(21);
    /// atomically(|tx| var.modify(tx, |x| x * 2));
    ///
    /// assert_eq!(var.get_read_only(), 42);
    /// ```
    pub fn modify<F>(&self, tx: &mut Transaction, f: F) -> Stm<()>
    where
        F: FnOnce(T) -> T,
    {
        let old = self.get(tx)?;
        self.set(tx, f(old))
    }

    /// Replace the value of the variable, returning the old one.
    pub fn replace(&self, tx: &mut Transaction, value: T) -> Stm<T> {
        let old = self.get(tx)?;
        self.set(tx, value)?;
        Ok(old)
    }

    /// Revalidate just this variable against the transaction's read
    /// entry.
    ///
    /// Useful when a long transaction needs to watch the validity of a
    /// single variable and a full [`Transaction::validate`] would be too
    /// expensive. A full validation still happens at commit whether this
    /// is called or not.
    pub fn validate(&self, tx: &mut Transaction) -> Stm<()> {
        tx.validate_var(&self.core)
    }

    /// Get the variable's value under an inconsistent read.
    ///
    /// Multiple calls for the same variable can observe different values
    /// within one `inconsistently` run.
    pub fn get_inconsistent(&self, ins: &mut Inconsistent) -> T {
        downcast(ins.read_erased(&self.core))
    }

    /// Get the variable's value outside of a transaction by wrapping the
    /// read in a tiny transaction.
    ///
    /// Slower than calling [`Var::get`] inside an existing transaction.
    pub fn get_read_only(&self) -> T {
        atomically(|tx| self.get(tx))
    }

    /// Check if two `Var`s refer to the same cell.
    pub fn ref_eq(this: &Var<T>, other: &Var<T>) -> bool {
        Arc::ptr_eq(&this.core, &other.core)
    }
}

impl<T> Var<T> {
    /// Access the core of the var. Internal use only.
    pub(crate) fn core(&self) -> &Arc<VarCore> {
        &self.core
    }
}

/// Recover the payload type from an erased value.
pub(crate) fn downcast<T: Any + Clone>(value: ArcAny) -> T {
    match value.downcast_ref::<T>() {
        Some(value) => value.clone(),
        None => unreachable!("Var payload has wrong type"),
    }
}

/// Debug output samples the cell directly.
///
/// The sample is atomic for this variable but not consistent with any
/// running transaction.
impl<T> Debug for Var<T>
where
    T: Any + Send + Sync + Clone + Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let value: T = downcast(self.core.current().payload.clone());
        f.debug_struct("Var").field("value", &value).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_only_fresh_var() {
        let var = Var::new(42);

        assert_eq!(42, var.get_read_only());
    }

    #[test]
    fn new_var_starts_at_version_zero() {
        let var = Var::new(0);

        assert_eq!(0, var.core().current_version());
    }

    #[test]
    fn commit_bumps_version() {
        let var = Var::new(1);
        atomically(|tx| var.set(tx, 2));
        atomically(|tx| var.set(tx, 3));

        assert_eq!(2, var.core().current_version());
        assert_eq!(3, var.get_read_only());
    }

    #[test]
    fn ref_eq_same_cell() {
        let a = Arc::new(Var::new(1));
        let b = a.clone();

        assert!(Var::ref_eq(&a, &b));
        assert!(!Var::ref_eq(&a, &Var::new(1)));
    }
}
