// Copyright 2018-2026 wstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Transaction records, the `atomically` driver and the commit protocol.

pub(crate) mod log_entry;
pub(crate) mod retry_slot;

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::marker::PhantomData;
use std::mem;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, error, trace};

use self::log_entry::LogEntry;
use self::retry_slot::RetrySlot;
use crate::limits::{ConflictResolution, Limits};
use crate::profiling;
use crate::registry::{self, ExclusiveGuard, SharedGuard};
use crate::result::{AtomicError, Stm, StmAbort, StmControl, StmError, StmResult};
use crate::var::{ArcAny, Value, VarCore};

/// Cap on before-commit passes; more passes than this means a handler
/// keeps registering new handlers and will never converge.
const MAX_BEFORE_COMMIT_PASSES: usize = 64;

type BeforeCommitFn = Box<dyn FnMut(&mut Transaction)>;
type HookFn = Box<dyn FnOnce()>;

/// One level of the per-thread transaction stack.
#[derive(Default)]
struct Record {
    /// Log of all variables touched at this level, keyed by cell
    /// identity. The map is ordered by core address so iteration is
    /// deterministic.
    log: BTreeMap<Arc<VarCore>, LogEntry>,

    /// Handlers to run just before the top-level commit starts.
    before_commit: Vec<BeforeCommitFn>,

    /// Handlers to run after the top-level commit succeeded.
    after_commit: Vec<HookFn>,

    /// Handlers to run when the transaction fails to commit.
    on_fail: Vec<HookFn>,

    /// Transaction-local values, keyed by their generator key.
    locals: HashMap<u64, Box<dyn Any>>,

    /// Shared grant pinned by `read_lock`, plus its depth.
    read_guard: Option<SharedGuard>,
    read_lock_depth: usize,

    /// Set while the operation runs holding the exclusive grant after
    /// the conflict limit was resolved with `RunLocked`. Reads and
    /// writes must not take another grant then.
    run_locked: bool,
}

thread_local! {
    static STACK: RefCell<Vec<Record>> = const { RefCell::new(Vec::new()) };
}

/// True if a transaction is active on the current thread.
pub(crate) fn transaction_active() -> bool {
    STACK.with(|stack| !stack.borrow().is_empty())
}

fn push_record() -> usize {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        stack.push(Record::default());
        stack.len() - 1
    })
}

/// Pops the topmost record when the scope ends, even on a panic. A
/// panic aborts the transaction, so the record's on-fail handlers still
/// run.
struct PopGuard;

impl Drop for PopGuard {
    fn drop(&mut self) {
        let record = STACK.with(|stack| stack.borrow_mut().pop());
        let Some(record) = record else { return };
        if thread::panicking() {
            run_hooks_caught(record.on_fail, "on-fail");
        }
    }
}

/// Handle on one level of the thread's transaction stack.
///
/// Operations receive a `&mut Transaction` and use it for every read
/// and write of a [`Var`](crate::Var). The handle is bound to its
/// thread; the records themselves live in thread-local storage so that
/// child transactions can see their ancestors.
pub struct Transaction {
    level: usize,
    _not_send: PhantomData<*const ()>,
}

impl Transaction {
    fn at(level: usize) -> Transaction {
        Transaction {
            level,
            _not_send: PhantomData,
        }
    }

    fn with_record<R>(&self, f: impl FnOnce(&mut Record) -> R) -> R {
        STACK.with(|stack| f(&mut stack.borrow_mut()[self.level]))
    }

    /// True if some level of the stack pins a shared grant or runs under
    /// the commit lock. Sampling a cell must not take another grant then.
    fn grant_held(&self) -> bool {
        STACK.with(|stack| {
            stack.borrow()[..=self.level]
                .iter()
                .any(|record| record.read_guard.is_some() || record.run_locked)
        })
    }

    fn sampling_grant(&self) -> Option<SharedGuard> {
        if self.grant_held() {
            None
        } else {
            Some(registry::shared())
        }
    }

    /// Read a variable through the log.
    ///
    /// A pending write at this level or any ancestor shadows everything;
    /// otherwise the first recorded read is returned; otherwise the cell
    /// is sampled under a shared grant and a read entry is recorded at
    /// this level.
    pub(crate) fn get_erased(&mut self, core: &Arc<VarCore>) -> Stm<ArcAny> {
        let logged = STACK.with(|stack| {
            let stack = stack.borrow();
            let levels = &stack[..=self.level];
            for record in levels.iter().rev() {
                if let Some(entry) = record.log.get(core) {
                    if let Some(write) = &entry.write {
                        return Some(write.payload.clone());
                    }
                }
            }
            for record in levels.iter().rev() {
                if let Some(entry) = record.log.get(core) {
                    if let Some(read) = &entry.read {
                        return Some(read.payload.clone());
                    }
                }
            }
            None
        });
        if let Some(payload) = logged {
            return Ok(payload);
        }

        let value = {
            let _grant = self.sampling_grant();
            core.current()
        };
        let payload = value.payload.clone();
        self.with_record(|record| {
            record.log.entry(core.clone()).or_default().read = Some(value);
        });
        Ok(payload)
    }

    /// Write a variable through the log.
    ///
    /// The first set at this level samples the cell's version and builds
    /// a pending record one version ahead; later sets replace the
    /// pending payload in place.
    pub(crate) fn set_erased(&mut self, core: &Arc<VarCore>, payload: ArcAny) -> Stm<()> {
        let payload = match self.with_record(|record| {
            if let Some(entry) = record.log.get_mut(core) {
                if let Some(write) = &mut entry.write {
                    write.payload = payload;
                    return None;
                }
            }
            Some(payload)
        }) {
            Some(payload) => payload,
            None => return Ok(()),
        };

        let observed = {
            let _grant = self.sampling_grant();
            core.current_version()
        };
        self.with_record(|record| {
            let entry = record.log.entry(core.clone()).or_default();
            entry.write = Some(Value {
                version: observed + 1,
                payload,
            });
        });
        Ok(())
    }

    /// Check the transaction for consistency.
    ///
    /// If any variable read so far has been committed to by another
    /// thread the transaction restarts. Calling this is never required;
    /// commit validates implicitly. Long operations should call it
    /// periodically to avoid doing work a stale snapshot has already
    /// doomed.
    pub fn validate(&mut self) -> Stm<()> {
        let entries = self.all_entries();
        let _grant = self.sampling_grant();
        for (core, entry) in &entries {
            if !entry.validates_against(core.current_version()) {
                return Err(StmControl::Failure);
            }
        }
        Ok(())
    }

    /// Revalidate a single variable's read entry.
    pub(crate) fn validate_var(&mut self, core: &Arc<VarCore>) -> Stm<()> {
        let observed = STACK.with(|stack| {
            let stack = stack.borrow();
            stack[..=self.level]
                .iter()
                .rev()
                .filter_map(|record| record.log.get(core))
                .find_map(|entry| entry.read.as_ref().map(|read| read.version))
        });
        if let Some(observed) = observed {
            let _grant = self.sampling_grant();
            if core.current_version() != observed {
                return Err(StmControl::Failure);
            }
        }
        Ok(())
    }

    fn all_entries(&self) -> Vec<(Arc<VarCore>, LogEntry)> {
        STACK.with(|stack| {
            let stack = stack.borrow();
            stack[..=self.level]
                .iter()
                .flat_map(|record| {
                    record
                        .log
                        .iter()
                        .map(|(core, entry)| (core.clone(), entry.clone()))
                })
                .collect()
        })
    }

    /// Pin one shared grant across many reads.
    ///
    /// Reading a variable normally takes and drops a shared grant. When
    /// a lot of variables are read in a row this churns the registry;
    /// pinning holds a single grant until [`read_unlock`] has been
    /// called as often as `read_lock`, or until the transaction ends.
    ///
    /// [`read_unlock`]: Transaction::read_unlock
    pub fn read_lock(&mut self) {
        let depth = self.with_record(|record| {
            record.read_lock_depth += 1;
            record.read_lock_depth
        });
        if depth == 1 {
            let guard = registry::shared();
            self.with_record(|record| record.read_guard = Some(guard));
        }
    }

    /// Release the grant pinned by [`read_lock`](Transaction::read_lock).
    ///
    /// Unbalanced calls are a usage error and panic.
    pub fn read_unlock(&mut self) {
        self.with_record(|record| {
            assert!(
                record.read_lock_depth > 0,
                "read_unlock without a matching read_lock"
            );
            record.read_lock_depth -= 1;
            if record.read_lock_depth == 0 {
                record.read_guard = None;
            }
        });
    }

    /// True if the transaction currently pins a shared grant.
    pub fn is_read_locked(&self) -> bool {
        self.with_record(|record| record.read_lock_depth > 0)
    }

    /// Add a handler to run just before the top-level transaction
    /// commits.
    ///
    /// The handler receives the transaction and may read and write more
    /// variables; handlers registered by a handler run as well. Note
    /// that the top-level commit may be much later than the call site
    /// expects, so the handler should own the data it touches.
    pub fn before_commit<F>(&mut self, f: F)
    where
        F: FnMut(&mut Transaction) + 'static,
    {
        self.with_record(|record| record.before_commit.push(Box::new(f)));
    }

    /// Add a handler to run after the top-level transaction committed.
    ///
    /// The writes are visible to other threads by the time the handler
    /// runs. Every handler is attempted even if an earlier one panics;
    /// the first panic resurfaces afterwards.
    pub fn after<F>(&mut self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.with_record(|record| record.after_commit.push(Box::new(f)));
    }

    /// Add a handler to run if this transaction fails to commit, due to
    /// a conflict, an abort, a panic or a retry.
    ///
    /// Useful for cleaning up resources allocated inside the
    /// transaction. A successful top-level commit drops the handlers
    /// without running them.
    pub fn on_fail<F>(&mut self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.with_record(|record| record.on_fail.push(Box::new(f)));
    }

    /// Look up a transaction-local value at this level or an ancestor.
    pub(crate) fn local_get<R>(&self, key: u64, f: impl FnOnce(&dyn Any) -> R) -> Option<R> {
        STACK.with(|stack| {
            let stack = stack.borrow();
            stack[..=self.level]
                .iter()
                .rev()
                .find_map(|record| record.locals.get(&key))
                .map(|value| f(value.as_ref()))
        })
    }

    /// Insert a transaction-local value at this level.
    pub(crate) fn local_set(&mut self, key: u64, value: Box<dyn Any>) {
        self.with_record(|record| {
            record.locals.insert(key, value);
        });
    }

    /// Run `op` in a child transaction.
    ///
    /// On success the child's log, handlers and locals merge into this
    /// transaction; nothing becomes visible and no handler fires until
    /// the top level commits. A control signal discards the child and
    /// must be propagated with `?` so the outermost `atomically` can
    /// restart or block.
    pub fn nested<T, F>(&mut self, mut op: F) -> Stm<T>
    where
        F: FnMut(&mut Transaction) -> Stm<T>,
    {
        match self.nested_or_err::<T, Infallible, _>(|tx| op(tx).map_err(StmAbort::from)) {
            Ok(value) => Ok(value),
            Err(StmAbort::Control(control)) => Err(control),
            Err(StmAbort::Abort(never)) => match never {},
        }
    }

    /// Run `op` in a child transaction that may abort with an error.
    ///
    /// An abort tears the child down, fires the child's on-fail handlers
    /// and leaves this transaction untouched, so the caller can recover
    /// from the error and still commit.
    pub fn nested_or_err<T, E, F>(&mut self, mut op: F) -> StmResult<T, E>
    where
        F: FnMut(&mut Transaction) -> StmResult<T, E>,
    {
        let level = push_record();
        debug_assert_eq!(level, self.level + 1);
        let _pop = PopGuard;
        let _scope = profiling::enter_child();
        let mut child = Transaction::at(level);

        let result = op(&mut child);
        match &result {
            Ok(_) => merge_child(self.level),
            Err(StmAbort::Control(StmControl::Retry(_))) => {
                // The outermost wait must watch the child's reads too.
                merge_child_reads(self.level);
                fire_on_fail(&child);
            }
            Err(_) => fire_on_fail(&child),
        }
        result
    }
}

/// Merge a finished child record into its parent: reads keep the
/// parent's (older) entry, writes and locals overwrite, handlers append
/// in their local order.
fn merge_child(parent: usize) {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let child = &mut stack[parent + 1];
        let log = mem::take(&mut child.log);
        let before_commit = mem::take(&mut child.before_commit);
        let after_commit = mem::take(&mut child.after_commit);
        let on_fail = mem::take(&mut child.on_fail);
        let locals = mem::take(&mut child.locals);

        let parent = &mut stack[parent];
        for (core, entry) in log {
            let slot = parent.log.entry(core).or_default();
            if slot.read.is_none() {
                slot.read = entry.read;
            }
            if entry.write.is_some() {
                slot.write = entry.write;
            }
        }
        parent.before_commit.extend(before_commit);
        parent.after_commit.extend(after_commit);
        parent.on_fail.extend(on_fail);
        parent.locals.extend(locals);
    });
}

/// Merge only the child's read entries into the parent. Used when a
/// child retries: its writes are abandoned but its reads must still be
/// watched.
fn merge_child_reads(parent: usize) {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let log = mem::take(&mut stack[parent + 1].log);
        let parent = &mut stack[parent];
        for (core, entry) in log {
            if entry.read.is_some() {
                let slot = parent.log.entry(core).or_default();
                if slot.read.is_none() {
                    slot.read = entry.read;
                }
            }
        }
    });
}

enum Attempt<T> {
    Done(T, Vec<HookFn>),
    Conflict,
    Retry(Option<Instant>),
}

/// The top-level transaction loop.
#[track_caller]
pub(crate) fn run_atomically<T, E, F>(limits: &Limits, mut op: F) -> Result<T, AtomicError<E>>
where
    F: FnMut(&mut Transaction) -> StmResult<T, E>,
{
    assert!(
        !transaction_active(),
        "nested atomically: use Transaction::nested or compose operations over &mut Transaction"
    );

    let caller = Location::caller();

    // The record is popped before the after-commit handlers run, so a
    // handler may open a fresh top-level transaction.
    let (value, after_hooks) = {
        let _scope = profiling::enter_transaction(caller.file(), caller.line());

        push_record();
        let _pop = PopGuard;
        let mut tx = Transaction::at(0);

        let mut conflicts: usize = 0;
        let mut retries: usize = 0;
        let mut locked = false;

        loop {
            profiling::attempt_start();

            let mut guard = if locked {
                tx.with_record(|record| record.run_locked = true);
                Some(registry::exclusive())
            } else {
                None
            };

            let attempt = match op(&mut tx) {
                Ok(value) => match commit_top(&mut tx, guard.take()) {
                    Some(after_hooks) => Attempt::Done(value, after_hooks),
                    None => Attempt::Conflict,
                },
                Err(StmAbort::Control(StmControl::Failure)) => Attempt::Conflict,
                Err(StmAbort::Control(StmControl::Retry(deadline))) => Attempt::Retry(deadline),
                Err(StmAbort::Abort(err)) => {
                    drop(guard);
                    fire_on_fail(&tx);
                    return Err(AtomicError::Abort(err));
                }
            };
            drop(guard);

            match attempt {
                Attempt::Done(value, after_hooks) => break (value, after_hooks),
                Attempt::Conflict => {
                    #[cfg(feature = "profiling")]
                    profiling::record_conflict(&read_var_keys(&tx));
                    fire_on_fail(&tx);
                    conflicts += 1;
                    trace!(conflicts, "transaction conflict");
                    if limits.max_conflicts.is_some_and(|max| conflicts > max) {
                        match limits.conflict_resolution {
                            ConflictResolution::Raise => {
                                return Err(AtomicError::Stm(StmError::MaxConflicts(conflicts)));
                            }
                            ConflictResolution::RunLocked => {
                                debug!("conflict limit hit, rerunning under the commit lock");
                                locked = true;
                            }
                        }
                    }
                    reset_record(&tx);
                }
                Attempt::Retry(deadline) => {
                    // A pinned shared grant would deadlock against the
                    // exclusive grant the wait registration takes.
                    tx.with_record(|record| {
                        record.read_lock_depth = 0;
                        record.read_guard = None;
                    });
                    fire_on_fail(&tx);
                    retries += 1;
                    if limits.max_retries.is_some_and(|max| retries > max) {
                        return Err(AtomicError::Stm(StmError::MaxRetries(retries)));
                    }
                    let limit = limits.max_retry_wait.map(|wait| Instant::now() + wait);
                    if !wait_for_change(&tx, earliest(deadline, limit)) {
                        return Err(AtomicError::Stm(StmError::RetryTimeout));
                    }
                    reset_record(&tx);
                }
            }
        }
    };

    run_after_hooks(after_hooks);
    Ok(value)
}

/// Commit the top-level record. Returns the drained after-commit
/// handlers on success and `None` on a validation conflict.
///
/// `held` carries the exclusive grant when the operation already ran
/// under the commit lock.
fn commit_top(tx: &mut Transaction, held: Option<ExclusiveGuard>) -> Option<Vec<HookFn>> {
    run_before_commit(tx);

    // A pinned shared grant would deadlock against the exclusive grant.
    tx.with_record(|record| {
        record.read_lock_depth = 0;
        record.read_guard = None;
    });

    let guard = match held {
        Some(guard) => guard,
        None => registry::exclusive(),
    };

    let written = tx.with_record(|record| {
        for (core, entry) in &record.log {
            if !entry.validates_against(core.current_version()) {
                return None;
            }
        }

        let mut written = Vec::new();
        for (core, entry) in record.log.iter_mut() {
            if let Some(pending) = entry.write.take() {
                core.commit(Arc::new(pending));
                written.push(core.clone());
            }
        }
        Some(written)
    });

    let Some(written) = written else {
        drop(guard);
        return None;
    };

    // The writes become visible when the grant drops; only wake after.
    drop(guard);
    for core in &written {
        core.wake_all();
    }

    #[cfg(feature = "profiling")]
    profiling::record_commit(&written.iter().map(|core| core.key()).collect::<Vec<_>>());

    // Locals die before the after-commit handlers can observe them, and
    // a successful commit frees the on-fail handlers without firing.
    Some(tx.with_record(|record| {
        record.locals.clear();
        record.on_fail.clear();
        mem::take(&mut record.after_commit)
    }))
}

/// Run before-commit handlers until a pass registers nothing new.
fn run_before_commit(tx: &mut Transaction) {
    let mut passes = 0;
    loop {
        let hooks = tx.with_record(|record| mem::take(&mut record.before_commit));
        if hooks.is_empty() {
            break;
        }
        passes += 1;
        assert!(
            passes <= MAX_BEFORE_COMMIT_PASSES,
            "before-commit handlers keep registering new handlers"
        );
        for mut hook in hooks {
            hook(tx);
        }
    }
}

/// Run the after-commit handlers. All of them are attempted; the first
/// panic resurfaces once the rest had their chance.
fn run_after_hooks(hooks: Vec<HookFn>) {
    let mut first_panic = None;
    for hook in hooks {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(hook)) {
            if first_panic.is_none() {
                first_panic = Some(payload);
            } else {
                error!("additional panic in after-commit handler ignored");
            }
        }
    }
    if let Some(payload) = first_panic {
        panic::resume_unwind(payload);
    }
}

fn fire_on_fail(tx: &Transaction) {
    let hooks = tx.with_record(|record| mem::take(&mut record.on_fail));
    run_hooks_caught(hooks, "on-fail");
}

fn run_hooks_caught(hooks: Vec<HookFn>, what: &str) {
    for hook in hooks {
        if panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
            error!("panic in {} handler ignored", what);
        }
    }
}

fn reset_record(tx: &Transaction) {
    tx.with_record(|record| {
        record.log.clear();
        record.before_commit.clear();
        record.after_commit.clear();
        record.on_fail.clear();
        record.locals.clear();
        record.read_guard = None;
        record.read_lock_depth = 0;
        record.run_locked = false;
    });
}

#[cfg(feature = "profiling")]
fn read_var_keys(tx: &Transaction) -> Vec<u64> {
    tx.with_record(|record| {
        record
            .log
            .iter()
            .filter(|(_, entry)| entry.read.is_some())
            .map(|(core, _)| core.key())
            .collect()
    })
}

/// Block until a variable the transaction has read changes or the
/// deadline passes. Returns false on timeout.
fn wait_for_change(tx: &Transaction, deadline: Option<Instant>) -> bool {
    let reads: Vec<(Arc<VarCore>, u64)> = tx.with_record(|record| {
        record
            .log
            .iter()
            .filter_map(|(core, entry)| {
                entry.read.as_ref().map(|read| (core.clone(), read.version))
            })
            .collect()
    });
    assert!(
        !reads.is_empty(),
        "retry with an empty read set would block forever"
    );

    if let Some(deadline) = deadline {
        if Instant::now() >= deadline {
            return false;
        }
    }

    let slot = Arc::new(RetrySlot::new());
    {
        let _grant = registry::exclusive();
        let changed = reads
            .iter()
            .any(|(core, version)| core.current_version() != *version);
        if changed {
            trace!("watched variable already changed, restarting without blocking");
            return true;
        }
        for (core, _) in &reads {
            core.wait(&slot);
        }
    }

    debug!(vars = reads.len(), "blocking until a watched variable changes");
    let woken = slot.wait_until(deadline);

    // Leave a dead-slot marker behind; the lists compact lazily.
    for (core, _) in &reads {
        core.set_dead();
    }
    woken
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
