//! Cooperative cancellation for long factorizations.
//!
//! Engines count elimination work in flop-equivalents and poll a
//! [`CancelToken`] whenever the count since the last poll passes
//! [`CHECK_INTERVAL`]. Polls happen only between columns, so a column that
//! has started is always finished first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Flop-equivalents between two cancellation polls.
pub const CHECK_INTERVAL: u64 = 128 * 1024;

/// Shared cancellation flag plus an optional total work budget.
///
/// Clones share the flag, so one clone can be handed to another thread and
/// cancelled from there.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    budget: Option<u64>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel once more than `flops` elimination work has been spent.
    pub fn with_work_budget(flops: u64) -> Self {
        Self {
            flag: Arc::default(),
            budget: Some(flops),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn work_budget(&self) -> Option<u64> {
        self.budget
    }
}

/// Outcome of [`WorkMeter::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Checkpoint {
    /// Not enough work since the last poll.
    Idle,
    /// Polled and still running; a good moment to report progress.
    Report,
    Cancel,
}

#[derive(Debug)]
pub(crate) struct WorkMeter<'a> {
    token: Option<&'a CancelToken>,
    since_poll: u64,
    total: u64,
}

impl<'a> WorkMeter<'a> {
    pub(crate) fn new(token: Option<&'a CancelToken>) -> Self {
        Self {
            token,
            since_poll: 0,
            total: 0,
        }
    }

    #[inline]
    pub(crate) fn add(&mut self, flops: usize) {
        self.since_poll += flops as u64;
        self.total += flops as u64;
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    pub(crate) fn checkpoint(&mut self) -> Checkpoint {
        if self.since_poll <= CHECK_INTERVAL {
            return Checkpoint::Idle;
        }
        self.since_poll = 0;
        match self.token {
            Some(token) if token.is_cancelled() => Checkpoint::Cancel,
            Some(token) if token.budget.is_some_and(|b| self.total > b) => Checkpoint::Cancel,
            _ => Checkpoint::Report,
        }
    }
}
