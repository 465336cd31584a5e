// Copyright 2018-2026 wstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The global commit registry.
//!
//! A single process-wide reader/writer lock separates readers, which
//! sample variable state for their snapshot, from committers, which
//! install their write set. Many transactions hold the shared side at
//! once; a commit holds the exclusive side across validation and the
//! value swap. The lock is deliberately coarse: per-variable contention
//! is handled by read-set validation, not by lock granularity.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

static REGISTRY: RwLock<()> = RwLock::new(());

pub(crate) type SharedGuard = RwLockReadGuard<'static, ()>;
pub(crate) type ExclusiveGuard = RwLockWriteGuard<'static, ()>;

/// Take a shared grant.
///
/// Recursive acquisition must not block behind a parked committer: a
/// thread holding a pinned grant still samples variables through here.
pub(crate) fn shared() -> SharedGuard {
    REGISTRY.read_recursive()
}

/// Take the exclusive grant. One commit at a time; a committer drops
/// any shared grant it pins before calling this.
pub(crate) fn exclusive() -> ExclusiveGuard {
    REGISTRY.write()
}
