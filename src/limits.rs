// Copyright 2018-2026 wstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::time::Duration;

/// How `atomically_with` reacts when a transaction reaches its conflict
/// limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictResolution {
    /// Return [`StmError::MaxConflicts`](crate::StmError::MaxConflicts).
    #[default]
    Raise,

    /// Run the operation once more while holding the commit lock,
    /// locking out all other commits. The run cannot conflict and is
    /// guaranteed to complete.
    RunLocked,
}

/// Limits for a transaction run with `atomically_with`.
///
/// Everything defaults to unlimited:
///
/// ```
/// # use wstm::{ConflictResolution, Limits};
/// # use std::time::Duration;
/// let limits = Limits::default()
///     .max_conflicts(3, ConflictResolution::RunLocked)
///     .max_retries(10)
///     .max_retry_wait(Duration::from_millis(500));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Limits {
    pub(crate) max_conflicts: Option<usize>,
    pub(crate) conflict_resolution: ConflictResolution,
    pub(crate) max_retries: Option<usize>,
    pub(crate) max_retry_wait: Option<Duration>,
}

impl Limits {
    /// Restart the operation at most `max` times due to conflicts, then
    /// apply `resolution`. `max_conflicts(0, Raise)` raises on the very
    /// first conflict.
    pub fn max_conflicts(mut self, max: usize, resolution: ConflictResolution) -> Limits {
        self.max_conflicts = Some(max);
        self.conflict_resolution = resolution;
        self
    }

    /// Allow at most `max` calls to `retry`. `max_retries(0)` raises on
    /// the first retry without blocking.
    pub fn max_retries(mut self, max: usize) -> Limits {
        self.max_retries = Some(max);
        self
    }

    /// Bound every retry wait by `wait` of wall-clock time. An explicit
    /// deadline passed to [`retry_timeout`](crate::retry_timeout) is
    /// intersected with this bound.
    pub fn max_retry_wait(mut self, wait: Duration) -> Limits {
        self.max_retry_wait = Some(wait);
        self
    }
}
