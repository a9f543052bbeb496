//! In-memory duplicate suppression.
//!
//! Fingerprints are SHA-256 over the destination table name and the values
//! of its dedup-key columns, so re-delivered records collapse regardless of
//! which processor sees them. The set is lock-striped: the shard count is
//! the processor count rounded up to a power of two, and one insert-or-check
//! is a single critical section on one shard.
//!
//! Fingerprints live for the duration of the run only; duplicates across a
//! resume boundary are absorbed by the destination upsert instead.

use std::collections::HashSet;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::value::SqlValue;

type Fingerprint = [u8; 32];

pub struct DedupSet {
    shards: Vec<Mutex<HashSet<Fingerprint>>>,
    mask: usize,
}

impl DedupSet {
    /// Create a set striped for roughly `num_processors` concurrent users.
    pub fn new(num_processors: usize) -> Self {
        let shard_count = num_processors.max(1).next_power_of_two();
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(HashSet::new())).collect(),
            mask: shard_count - 1,
        }
    }

    /// Compute the fingerprint of a row's dedup-key values for `table`.
    pub fn fingerprint(table: &str, keys: &[&SqlValue]) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(table.as_bytes());
        hasher.update([0u8]);
        for key in keys {
            match key {
                SqlValue::Null => hasher.update(b"\x00null"),
                SqlValue::Bool(b) => {
                    hasher.update(b"\x01");
                    hasher.update([*b as u8]);
                }
                SqlValue::Int(i) => {
                    hasher.update(b"\x02");
                    hasher.update(i.to_le_bytes());
                }
                SqlValue::Float(f) => {
                    hasher.update(b"\x03");
                    hasher.update(f.to_le_bytes());
                }
                SqlValue::Text(s) => {
                    hasher.update(b"\x04");
                    hasher.update(s.as_bytes());
                }
                SqlValue::Bytes(b) => {
                    hasher.update(b"\x05");
                    hasher.update(b);
                }
                SqlValue::Date(d) => {
                    hasher.update(b"\x06");
                    hasher.update(d.to_string().as_bytes());
                }
                SqlValue::DateTime(dt) => {
                    hasher.update(b"\x07");
                    hasher.update(dt.timestamp_micros().to_le_bytes());
                }
                SqlValue::Json(v) => {
                    hasher.update(b"\x08");
                    hasher.update(v.to_string().as_bytes());
                }
            }
            hasher.update([0xFFu8]);
        }
        hasher.finalize().into()
    }

    /// Record the fingerprint; returns true if it was already present.
    pub fn check_and_insert(&self, fp: Fingerprint) -> bool {
        let shard = usize::from_le_bytes(fp[..8].try_into().unwrap()) & self.mask;
        let mut set = self.shards[shard].lock().unwrap_or_else(|e| e.into_inner());
        !set.insert(fp)
    }

    #[cfg(test)]
    fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_count_is_power_of_two() {
        assert_eq!(DedupSet::new(1).shard_count(), 1);
        assert_eq!(DedupSet::new(3).shard_count(), 4);
        assert_eq!(DedupSet::new(8).shard_count(), 8);
        assert_eq!(DedupSet::new(9).shard_count(), 16);
    }

    #[test]
    fn test_check_and_insert() {
        let set = DedupSet::new(4);
        let fp = DedupSet::fingerprint("t", &[&SqlValue::Int(1)]);
        assert!(!set.check_and_insert(fp));
        assert!(set.check_and_insert(fp));
    }

    #[test]
    fn test_fingerprint_stability() {
        let a = DedupSet::fingerprint("t", &[&SqlValue::Int(1), &SqlValue::Text("x".into())]);
        let b = DedupSet::fingerprint("t", &[&SqlValue::Int(1), &SqlValue::Text("x".into())]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_differs_by_table_and_value() {
        let base = DedupSet::fingerprint("t", &[&SqlValue::Int(1)]);
        assert_ne!(base, DedupSet::fingerprint("u", &[&SqlValue::Int(1)]));
        assert_ne!(base, DedupSet::fingerprint("t", &[&SqlValue::Int(2)]));
        // Same bytes through different types must not collide.
        assert_ne!(
            DedupSet::fingerprint("t", &[&SqlValue::Text("1".into())]),
            DedupSet::fingerprint("t", &[&SqlValue::Int(0x31)])
        );
    }

    #[test]
    fn test_concurrent_inserts() {
        use std::sync::Arc;
        let set = Arc::new(DedupSet::new(8));
        let mut handles = Vec::new();
        for worker in 0..8u64 {
            let set = Arc::clone(&set);
            handles.push(std::thread::spawn(move || {
                let mut dupes = 0;
                for i in 0..1000u64 {
                    // Every worker inserts the same keys; exactly one insert
                    // per key can win.
                    let fp = DedupSet::fingerprint("t", &[&SqlValue::Int(i as i64)]);
                    if set.check_and_insert(fp) {
                        dupes += 1;
                    }
                }
                let _ = worker;
                dupes
            }));
        }
        let total_dupes: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total_dupes, 7 * 1000);
    }
}
