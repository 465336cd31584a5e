// Copyright 2018-2026 wstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::transaction::Transaction;

// Locals are keyed by a generated integer instead of the value's
// address. An address can be reused after the value is dropped, and a
// later local at the same address would then pick up a stale entry from
// a still-running transaction. The key space is 64 bit and never
// recycled.
static NEXT_KEY: AtomicU64 = AtomicU64::new(0);

fn next_key() -> u64 {
    NEXT_KEY.fetch_add(1, Ordering::Relaxed)
}

/// A value local to a transaction, comparable to thread-local storage
/// but scoped to a transaction instead of a thread.
///
/// The slot starts out empty in every transaction: `get` returns `None`
/// until `set` is called. A child transaction starts with its parent's
/// value and, when it commits, its value becomes the parent's; when it
/// aborts the parent keeps seeing what it saw before. Values set at the
/// top level last until the top-level commit; they are gone before the
/// after-commit handlers run but are still visible to before-commit
/// handlers.
pub struct TransactionLocalValue<T> {
    key: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TransactionLocalValue<T>
where
    T: Any + Clone,
{
    pub fn new() -> TransactionLocalValue<T> {
        TransactionLocalValue {
            key: next_key(),
            _marker: PhantomData,
        }
    }

    /// The value in the current transaction or the nearest ancestor,
    /// `None` if it was never set.
    pub fn get(&self, tx: &mut Transaction) -> Option<T> {
        tx.local_get(self.key, |value| match value.downcast_ref::<T>() {
            Some(value) => value.clone(),
            None => unreachable!("transaction local value has wrong type"),
        })
    }

    /// Set the value for the current transaction level.
    pub fn set(&self, tx: &mut Transaction, value: T) {
        tx.local_set(self.key, Box::new(value));
    }
}

impl<T: Any + Clone> Default for TransactionLocalValue<T> {
    fn default() -> Self {
        TransactionLocalValue::new()
    }
}

/// A transaction-local flag, for operations that must happen at most
/// once per transaction.
pub struct TransactionLocalFlag {
    flag: TransactionLocalValue<bool>,
}

impl TransactionLocalFlag {
    pub fn new() -> TransactionLocalFlag {
        TransactionLocalFlag {
            flag: TransactionLocalValue::new(),
        }
    }

    /// Set the flag and return its prior value, which defaults to false.
    pub fn test_and_set(&self, tx: &mut Transaction) -> bool {
        let prior = self.flag.get(tx).unwrap_or(false);
        self.flag.set(tx, true);
        prior
    }
}

impl Default for TransactionLocalFlag {
    fn default() -> Self {
        TransactionLocalFlag::new()
    }
}
