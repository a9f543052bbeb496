//! Shared run counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by every stage; read by the progress reporter and the
/// final result.
#[derive(Debug, Default)]
pub struct Stats {
    pub records_read: AtomicU64,
    pub rows_written: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub conversion_errors: AtomicU64,
    pub missing_required: AtomicU64,
    pub batches_flushed: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub records_read: u64,
    pub rows_written: u64,
    pub duplicates_skipped: u64,
    pub conversion_errors: u64,
    pub missing_required: u64,
    pub batches_flushed: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records_read: self.records_read.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            conversion_errors: self.conversion_errors.load(Ordering::Relaxed),
            missing_required: self.missing_required.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
        }
    }
}
