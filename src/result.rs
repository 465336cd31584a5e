// Copyright 2018-2026 wstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fmt;
use std::time::Instant;

use thiserror::Error;

/// Control signals handled by the STM runtime.
///
/// Operations propagate these with `?`. Do not handle them yourself;
/// the driver in `atomically` reacts to them by restarting or blocking
/// the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmControl {
    /// A variable the transaction depends on has changed.
    ///
    /// The transaction is inconsistent and restarts from the top.
    Failure,

    /// `retry` was called, with an optional wait deadline.
    ///
    /// The transaction blocks until one of the variables it has read
    /// changes, then restarts.
    Retry(Option<Instant>),
}

/// Type returned by operations that run inside a transaction.
pub type Stm<T> = Result<T, StmControl>;

/// Error type of operations that may also abort the transaction with a
/// user error.
///
/// Keeping aborts in a separate type means `atomically` stays total:
/// only `atomically_or_err` and its variants can surface an `Abort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmAbort<E> {
    /// A signal for the runtime.
    Control(StmControl),

    /// Abort the transaction, discard its writes and return the error.
    Abort(E),
}

impl<E> From<StmControl> for StmAbort<E> {
    fn from(control: StmControl) -> Self {
        StmAbort::Control(control)
    }
}

/// Type returned by operations that can abort with an error.
///
/// Run these with [`atomically_or_err`](crate::atomically_or_err).
pub type StmResult<T, E> = Result<T, StmAbort<E>>;

/// Abort the current transaction with an error.
///
/// The transaction's writes are discarded, its on-fail handlers run and
/// the error is returned from the enclosing `atomically_or_err` (or from
/// [`Transaction::nested_or_err`](crate::Transaction::nested_or_err) if
/// the abort happens in a child transaction).
pub fn abort<T, E>(err: E) -> StmResult<T, E> {
    Err(StmAbort::Abort(err))
}

/// Errors that stop a transaction from continuing.
///
/// These surface from the outermost `atomically_with` call when one of
/// the configured [`Limits`](crate::Limits) is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StmError {
    /// The transaction called `retry` more often than allowed.
    #[error("hit maximum number of retries ({0})")]
    MaxRetries(usize),

    /// The transaction conflicted more often than allowed.
    #[error("hit maximum number of conflicts ({0})")]
    MaxConflicts(usize),

    /// A retry wait reached its deadline before a watched variable changed.
    #[error("retry timed out")]
    RetryTimeout,
}

/// Combined failure type of `atomically_or_err_with`: either the
/// transaction cannot continue or the operation aborted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicError<E> {
    /// A limit was hit, see [`StmError`].
    Stm(StmError),

    /// The operation aborted the transaction.
    Abort(E),
}

impl<E: fmt::Display> fmt::Display for AtomicError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtomicError::Stm(e) => write!(f, "{}", e),
            AtomicError::Abort(e) => write!(f, "transaction aborted: {}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for AtomicError<E> {}

/// Error raised by [`NoAtomic`](crate::NoAtomic) and `inconsistently`
/// when they run into an active transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation is not allowed inside a transaction")]
pub struct InAtomicError;
