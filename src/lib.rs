// Copyright 2018-2026 wstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! This library implements
//! [software transactional memory](https://en.wikipedia.org/wiki/Software_transactional_memory),
//! often abbreviated with STM.
//!
//! With locks, the sequential composition of two threadsafe actions is
//! no longer threadsafe, because other threads may interfere between
//! the actions. Guarding both with a third lock invites deadlocks and
//! races instead. Software transactional memory composes: all reads and
//! writes of [`Var`]s go into a per-transaction log, and when the
//! operation finishes the log is validated against the variables'
//! versions and committed as one atomic step. If another thread changed
//! a variable in the meantime, the operation is simply run again on a
//! fresh snapshot.
//!
//! ```
//! # use wstm::{atomically, Var};
//! let var = Var::new(0);
//!
//! let x = atomically(|tx| {
//!     var.set(tx, 42)?; // Visible to other threads only after commit.
//!     var.get(tx) // Reads the pending value back.
//! });
//!
//! assert_eq!(x, 42);
//! ```
//!
//! Blocking on state is expressed with [`retry`]: the transaction is
//! abandoned and the thread sleeps until another commit changes one of
//! the variables the transaction had read, then the operation runs
//! again.
//!
//! ```no_run
//! # use wstm::{atomically, retry, Var};
//! # let queue_head = Var::new(None::<u32>);
//! let item = atomically(|tx| match queue_head.get(tx)? {
//!     Some(item) => Ok(item),
//!     None => retry(), // Wake up when someone fills the head.
//! });
//! ```
//!
//! # Usage
//!
//! Operations must be transaction-safe: no side effects other than
//! through `Var`s, because a conflicting transaction reruns its
//! operation. Don't do IO, don't touch mutexes, and propagate [`Stm`]
//! errors with `?` instead of handling them. Side effects that must
//! happen exactly once belong into an after-commit handler registered
//! with [`Transaction::after`].
//!
//! Compose operations by passing the `&mut Transaction` along; a helper
//! with the signature `fn(&mut Transaction) -> Stm<T>` can be called
//! from any transaction. A child transaction with its own
//! commit-or-discard scope is available as [`Transaction::nested`];
//! calling
//! `atomically` while a transaction is running is a usage error and
//! panics.
//!
//! Transactions tolerate inconsistent snapshots while they run (the
//! commit protocol rejects them), so operations should not loop forever
//! on values that could only come from a torn snapshot; call
//! [`Transaction::validate`] from long-running loops instead.
//!
//! # Limits
//!
//! [`atomically_with`] bounds a transaction: a maximum number of
//! conflicts (resolved by raising [`StmError::MaxConflicts`] or by
//! rerunning the operation under the global commit lock), a maximum
//! number of retries, and a wall-clock cap on every retry wait.
//!
//! # Panics
//!
//! Panicking inside an operation is transaction-safe: nothing commits,
//! the variables keep their old values and the on-fail handlers run.

mod inconsistent;
mod limits;
mod local;
mod registry;
mod result;
mod transaction;
mod var;

pub mod profiling;


use std::convert::Infallible;
use std::time::{Duration, Instant};

pub use inconsistent::{inconsistently, Inconsistent};
pub use limits::{ConflictResolution, Limits};
pub use local::{TransactionLocalFlag, TransactionLocalValue};
pub use result::{
    abort, AtomicError, InAtomicError, Stm, StmAbort, StmControl, StmError, StmResult,
};
pub use transaction::Transaction;
pub use var::Var;

/// Run `op` atomically: its writes become visible to other threads all
/// at once, and only if none of the variables it read were changed by
/// another thread in the meantime. On a conflict the operation is run
/// again on a fresh snapshot, as often as needed.
///
/// The operation must not start another `atomically` on the same
/// thread; compose with functions over `&mut Transaction` or use
/// [`Transaction::nested`] for a child transaction.
///
/// # Panics
///
/// Panics when called inside a running transaction, and when the
/// operation uses [`retry_timeout`] and the deadline expires — an
/// unlimited transaction has no error channel, use [`atomically_with`]
/// for timeouts.
#[track_caller]
pub fn atomically<T, F>(mut op: F) -> T
where
    F: FnMut(&mut Transaction) -> Stm<T>,
{
    let run = transaction::run_atomically::<T, Infallible, _>(&Limits::default(), |tx| {
        op(tx).map_err(StmAbort::from)
    });
    match run {
        Ok(value) => value,
        Err(AtomicError::Stm(err)) => panic!("transaction cannot continue: {}", err),
        Err(AtomicError::Abort(never)) => match never {},
    }
}

/// Like [`atomically`], but bounded by `limits`. Hitting a limit
/// surfaces as an [`StmError`] from this call.
#[track_caller]
pub fn atomically_with<T, F>(limits: Limits, mut op: F) -> Result<T, StmError>
where
    F: FnMut(&mut Transaction) -> Stm<T>,
{
    let run = transaction::run_atomically::<T, Infallible, _>(&limits, |tx| {
        op(tx).map_err(StmAbort::from)
    });
    match run {
        Ok(value) => Ok(value),
        Err(AtomicError::Stm(err)) => Err(err),
        Err(AtomicError::Abort(never)) => match never {},
    }
}

/// Like [`atomically`], but the operation may abort the transaction
/// with an error via [`abort`]. An abort discards all writes, fires the
/// on-fail handlers and returns the error; there is no restart.
///
/// # Panics
///
/// Panics in the same cases as [`atomically`].
#[track_caller]
pub fn atomically_or_err<T, E, F>(mut op: F) -> Result<T, E>
where
    F: FnMut(&mut Transaction) -> StmResult<T, E>,
{
    match transaction::run_atomically(&Limits::default(), &mut op) {
        Ok(value) => Ok(value),
        Err(AtomicError::Stm(err)) => panic!("transaction cannot continue: {}", err),
        Err(AtomicError::Abort(err)) => Err(err),
    }
}

/// The most general driver: user aborts and limits at the same time.
#[track_caller]
pub fn atomically_or_err_with<T, E, F>(limits: Limits, mut op: F) -> Result<T, AtomicError<E>>
where
    F: FnMut(&mut Transaction) -> StmResult<T, E>,
{
    transaction::run_atomically(&limits, &mut op)
}

/// Abandon the transaction and block until one of the variables it has
/// read is changed by another thread, then run the operation again.
///
/// Calling this without having read any variable is a usage error and
/// panics: nothing could ever wake the thread.
#[inline]
pub fn retry<T>() -> Stm<T> {
    Err(StmControl::Retry(None))
}

/// Like [`retry`], but give up after `timeout`: the outermost
/// transaction then raises [`StmError::RetryTimeout`].
#[inline]
pub fn retry_timeout<T>(timeout: Duration) -> Stm<T> {
    Err(StmControl::Retry(Some(Instant::now() + timeout)))
}

/// Retry until `cond` holds.
///
/// ```
/// # use wstm::{atomically, guard, Var};
/// let var = Var::new(42);
///
/// let x = atomically(|tx| {
///     let v = var.get(tx)?;
///     guard(v == 42)?;
///     // v is now always 42.
///     Ok(v)
/// });
/// assert_eq!(x, 42);
/// ```
#[inline]
pub fn guard(cond: bool) -> Stm<()> {
    if cond {
        Ok(())
    } else {
        retry()
    }
}

/// True if the current thread is running inside `atomically`.
pub fn in_atomic() -> bool {
    transaction::transaction_active()
}

/// Marker argument for functions that must not be called from inside a
/// transaction.
///
/// Give such a function a `NoAtomic` parameter and let callers pass
/// `NoAtomic::default()`: the construction panics with
/// [`InAtomicError`] when a transaction is active, so the check happens
/// in the caller, before the function body runs. [`NoAtomic::new`] is
/// the non-panicking variant.
pub struct NoAtomic {
    _private: (),
}

impl NoAtomic {
    /// Checked construction: fails instead of panicking.
    pub fn new() -> Result<NoAtomic, InAtomicError> {
        if in_atomic() {
            Err(InAtomicError)
        } else {
            Ok(NoAtomic { _private: () })
        }
    }
}

impl Default for NoAtomic {
    fn default() -> NoAtomic {
        match NoAtomic::new() {
            Ok(guard) => guard,
            Err(err) => panic!("{}", err),
        }
    }
}


#[cfg(all(test, feature = "profiling"))]
mod test_profiling {
    use super::profiling::reader::{DataProcessor, Record};
    use super::profiling::{name_thread, name_var, write_profile};
    use super::*;
    use std::collections::HashMap;
    use std::fs::File;
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;

    const WORKER: &str = "wstm-e2e-worker";

    /// End-to-end trace round-trip: a worker thread produces a known
    /// number of commits and conflicts, the trace file is written and
    /// read back, and the records cross-reference to name records.
    ///
    /// The collector is process-global, so this is the only test that
    /// calls `write_profile`; records from other tests are filtered out
    /// by thread name.
    #[test]
    fn trace_round_trip() {
        let var = Arc::new(Var::new(0));
        let var2 = var.clone();
        let (read_sender, read_receiver) = channel();
        let (go_sender, go_receiver) = channel();

        let worker = thread::spawn(move || {
            name_thread(WORKER);
            name_var(&var2, "e2e-counter");

            // Three clean commits.
            for i in 0..3 {
                atomically(|tx| var2.set(tx, i));
            }

            // One choreographed conflict, after which the transaction
            // commits on its second attempt.
            let mut synced = false;
            atomically(move |tx| {
                let x = var2.get(tx)?;
                if !synced {
                    synced = true;
                    read_sender.send(()).unwrap();
                    go_receiver.recv().unwrap();
                }
                var2.set(tx, x + 1)
            });
        });

        read_receiver.recv().unwrap();
        atomically(|tx| var.set(tx, 10));
        go_sender.send(()).unwrap();
        worker.join().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = write_profile(dir.path()).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("wstm_"));

        let records: Vec<Record> = DataProcessor::new(File::open(&path).unwrap())
            .collect::<Result<_, _>>()
            .unwrap();

        let names: HashMap<u64, &str> = records
            .iter()
            .filter_map(|record| match record {
                Record::Name { key, name } => Some((*key, name.as_str())),
                _ => None,
            })
            .collect();

        let from_worker = |thread_name_key: &u64| names.get(thread_name_key) == Some(&WORKER);

        let commits: Vec<_> = records
            .iter()
            .filter_map(|record| match record {
                Record::Commit(txn) if from_worker(&txn.thread_name_key) => Some(txn),
                _ => None,
            })
            .collect();
        let conflicts: Vec<_> = records
            .iter()
            .filter_map(|record| match record {
                Record::Conflict(txn) if from_worker(&txn.thread_name_key) => Some(txn),
                _ => None,
            })
            .collect();

        assert_eq!(commits.len(), 4);
        assert_eq!(conflicts.len(), 1);

        // The conflicted attempt had read the counter; the retried
        // commit wrote it.
        let var_name = records.iter().find_map(|record| match record {
            Record::VarName { name_key, var_key } if names.get(name_key) == Some(&"e2e-counter") => {
                Some(*var_key)
            }
            _ => None,
        });
        let var_key = var_name.expect("the named variable appears in the trace");
        assert!(conflicts[0].vars.contains(&var_key));
        assert!(commits.iter().all(|txn| txn.vars.contains(&var_key)));

        // Every non-zero name key referenced by the worker's records
        // resolves to exactly one name record.
        for txn in commits.iter().chain(conflicts.iter()) {
            for key in [txn.thread_name_key, txn.file_key] {
                if key != 0 {
                    assert!(names.contains_key(&key));
                }
            }
        }

        // Timestamps are ordered within a frame.
        assert!(commits.iter().all(|txn| txn.start_ns <= txn.end_ns));
    }
}
