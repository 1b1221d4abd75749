//! # Core Token Bucket Implementation
//!
//! One [`Bucket`] holds the per-key counters of a single configured bucket.
//! All three client operations (take, give, query) go through one signed
//! [`Bucket::adjust`] so the conformance and clamping rules live in a single
//! place.
//!
//! ## Record Lifecycle
//!
//! ```text
//!     first access / access after expiry
//!              │
//!              ▼
//!     ┌──────────────────────────┐
//!     │ remaining = size         │
//!     │ expires_at = now + ttl   │
//!     └────────────┬─────────────┘
//!                  │  adjust(count): remaining -= count
//!                  ▼
//!     ┌──────────────────────────┐     reset / sweep
//!     │ mutated in place         │ ──────────────────► removed
//!     │ expires_at never touched │
//!     └──────────────────────────┘
//! ```
//!
//! ## Sign-Dependent Conformance
//!
//! ```text
//!     count > 0  (take)        conformant ⇔ remaining >= 0   no clamp
//!     count <= 0 (give/query)  conformant ⇔ remaining > 0    clamp to size
//! ```
//!
//! A take may drive `remaining` below zero. That debt is kept and must be
//! repaid by give-backs before the key conforms again; callers only ever see
//! `remaining: 0` on a non-conformant result.
//!
//! ## Concurrency
//!
//! The key map is a sharded [`DashMap`]. Each adjust runs under the write
//! lock of the shard owning its key, so two operations on the same key never
//! interleave while operations on other shards proceed in parallel.

use super::config::BucketConfig;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Mutable per-key counter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    /// Tokens left. Negative while the key is in debt.
    pub remaining: i64,

    /// Absolute expiry in epoch milliseconds, fixed when the record is created.
    pub expires_at: u64,
}

impl Record {
    /// Creates a full record for a bucket at time `now_ms`.
    #[inline]
    pub fn fresh(size: u64, ttl_ms: u64, now_ms: u64) -> Self {
        Self {
            remaining: size_as_i64(size),
            expires_at: now_ms.saturating_add(ttl_ms),
        }
    }

    /// A record is expired once `now` has strictly passed its expiry.
    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at
    }
}

/// Outcome of an adjust, serialized as-is over the wire.
///
/// ```json
/// { "conformant": true, "size": 10, "remaining": 9, "ttl": 1700000000000 }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitResult {
    /// Whether the operation stayed within the limit.
    pub conformant: bool,

    /// Bucket capacity.
    pub size: u64,

    /// Tokens left; always 0 when `conformant` is false.
    pub remaining: i64,

    /// Absolute expiry of the key's window in epoch milliseconds.
    pub ttl: u64,
}

impl LimitResult {
    /// The expiry rounded up to whole seconds, for display.
    ///
    /// ```rust
    /// use ratekeeper::LimitResult;
    ///
    /// let res = LimitResult { conformant: true, size: 1, remaining: 0, ttl: 1_001 };
    /// assert_eq!(res.ttl_secs(), 2);
    /// ```
    pub fn ttl_secs(&self) -> u64 {
        self.ttl.div_ceil(1000)
    }
}

/// Counters for a single configured bucket.
pub struct Bucket {
    config: BucketConfig,
    records: DashMap<String, Record, ahash::RandomState>,
    total_created: AtomicU64,
    total_removed: AtomicU64,
}

impl Bucket {
    /// Creates an empty bucket.
    pub fn new(config: BucketConfig) -> Self {
        let num_shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8)
            .saturating_mul(4)
            .next_power_of_two()
            .min(256);

        Self {
            config,
            records: DashMap::with_hasher_and_shard_amount(ahash::RandomState::new(), num_shards),
            total_created: AtomicU64::new(0),
            total_removed: AtomicU64::new(0),
        }
    }

    /// Static definition of this bucket.
    #[inline]
    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Applies a signed token adjustment to `key` at time `now_ms`.
    ///
    /// A positive `count` takes tokens, a negative one gives them back and
    /// zero only reads the current state. Missing or expired records are
    /// replaced with a full one first.
    pub fn adjust(&self, key: &str, count: i64, now_ms: u64) -> LimitResult {
        let size = size_as_i64(self.config.size);

        let (conformant, snapshot) = match self.records.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.is_expired(now_ms) {
                    debug!(bucket = %self.config.name, key, "expired record, renewing");
                    *record = Record::fresh(self.config.size, self.config.ttl_ms, now_ms);
                }
                apply(record, count, size)
            }
            Entry::Vacant(vacant) => {
                debug!(bucket = %self.config.name, key, "new record");
                self.total_created.fetch_add(1, Ordering::Relaxed);
                let mut record =
                    vacant.insert(Record::fresh(self.config.size, self.config.ttl_ms, now_ms));
                apply(record.value_mut(), count, size)
            }
        };

        LimitResult {
            conformant,
            size: self.config.size,
            remaining: if conformant { snapshot.remaining } else { 0 },
            ttl: snapshot.expires_at,
        }
    }

    /// Removes the record for `key`, returning whether one existed.
    pub fn reset(&self, key: &str) -> bool {
        let existed = self.records.remove(key).is_some();
        if existed {
            self.total_removed.fetch_add(1, Ordering::Relaxed);
        }
        existed
    }

    /// Removes `key` only if its record is still expired at `now_ms`.
    ///
    /// The check runs under the shard lock, so a record renewed by a
    /// concurrent adjust survives.
    pub fn remove_if_expired(&self, key: &str, now_ms: u64) -> bool {
        let removed = self
            .records
            .remove_if(key, |_, record| record.is_expired(now_ms))
            .is_some();
        if removed {
            debug!(bucket = %self.config.name, key, "cleaning key");
            self.total_removed.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Number of independently locked shards in the key map.
    #[inline]
    pub fn shard_count(&self) -> usize {
        self.records.shards().len()
    }

    /// Collects the keys of one shard whose records are expired at `now_ms`.
    ///
    /// Only that shard is read-locked, and only for the scan. Out-of-range
    /// shard indexes yield nothing.
    pub fn expired_keys_in_shard(&self, shard: usize, now_ms: u64) -> Vec<String> {
        self.records
            .shards()
            .get(shard)
            .map(|lock| {
                lock.read()
                    .iter()
                    .filter(|(_, record)| record.get().is_expired(now_ms))
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Removes every expired record in one blocking pass.
    pub fn retain_live(&self, now_ms: u64) -> usize {
        let mut removed = 0u64;
        self.records.retain(|_, record| {
            let keep = !record.is_expired(now_ms);
            if !keep {
                removed += 1;
            }
            keep
        });
        self.total_removed.fetch_add(removed, Ordering::Relaxed);
        removed as usize
    }

    /// Current record for `key`, without renewing or creating it.
    pub fn peek(&self, key: &str) -> Option<Record> {
        self.records.get(key).map(|r| *r)
    }

    /// Number of stored records, including expired ones not yet swept.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no record is stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records created since startup.
    pub fn total_created(&self) -> u64 {
        self.total_created.load(Ordering::Relaxed)
    }

    /// Records removed by reset or sweep since startup.
    pub fn total_removed(&self) -> u64 {
        self.total_removed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.config.name)
            .field("size", &self.config.size)
            .field("ttl_ms", &self.config.ttl_ms)
            .field("keys", &self.records.len())
            .finish()
    }
}

/// Conformance and clamping rules, keyed on the sign of `count`.
#[inline]
fn apply(record: &mut Record, count: i64, size: i64) -> (bool, Record) {
    record.remaining = record.remaining.saturating_sub(count);

    let conformant = if count > 0 {
        record.remaining >= 0
    } else {
        if record.remaining > size {
            record.remaining = size;
        }
        record.remaining > 0
    };

    (conformant, *record)
}

#[inline]
fn size_as_i64(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(size: u64, ttl_ms: u64) -> Bucket {
        Bucket::new(BucketConfig::new("test", size, ttl_ms).unwrap())
    }

    #[test]
    fn test_take_reaches_zero_conformant() {
        let b = bucket(2, 1000);

        let first = b.adjust("k", 1, 0);
        assert_eq!(first, LimitResult { conformant: true, size: 2, remaining: 1, ttl: 1000 });

        let second = b.adjust("k", 1, 1);
        assert!(second.conformant);
        assert_eq!(second.remaining, 0);

        let third = b.adjust("k", 1, 2);
        assert!(!third.conformant);
        assert_eq!(third.remaining, 0);
        assert_eq!(third.ttl, 1000);
    }

    #[test]
    fn test_debt_is_kept_internally() {
        let b = bucket(1, 1000);
        b.adjust("k", 1, 0);
        b.adjust("k", 1, 0);
        b.adjust("k", 1, 0);

        assert_eq!(b.peek("k").unwrap().remaining, -2);

        // Two give-backs only bring the balance back to zero.
        assert!(!b.adjust("k", -1, 0).conformant);
        let repaid = b.adjust("k", -1, 0);
        assert!(!repaid.conformant);
        assert_eq!(repaid.remaining, 0);

        let restored = b.adjust("k", -1, 0);
        assert!(restored.conformant);
        assert_eq!(restored.remaining, 1);
    }

    #[test]
    fn test_give_back_clamps_to_size() {
        let b = bucket(10, 1000);
        for _ in 0..3 {
            let res = b.adjust("k", -1, 0);
            assert!(res.conformant);
            assert_eq!(res.remaining, 10);
        }
        assert_eq!(b.peek("k").unwrap().remaining, 10);
    }

    #[test]
    fn test_query_does_not_consume() {
        let b = bucket(3, 1000);
        let q1 = b.adjust("k", 0, 0);
        let q2 = b.adjust("k", 0, 5);
        assert_eq!(q1, q2);
        assert_eq!(q1.remaining, 3);
    }

    #[test]
    fn test_query_on_exhausted_key_is_not_conformant() {
        let b = bucket(1, 1000);
        assert!(b.adjust("k", 1, 0).conformant);

        let q = b.adjust("k", 0, 0);
        assert!(!q.conformant);
        assert_eq!(q.remaining, 0);
    }

    #[test]
    fn test_expired_record_is_renewed() {
        let b = bucket(1, 10);
        let first = b.adjust("k", 1, 100);
        assert_eq!(first.ttl, 110);
        assert!(!b.adjust("k", 1, 105).conformant);

        // Exactly at expiry the record still counts.
        assert!(!b.adjust("k", 1, 110).conformant);

        let renewed = b.adjust("k", 1, 111);
        assert!(renewed.conformant);
        assert_eq!(renewed.ttl, 121);
        assert_eq!(b.total_created(), 1);
    }

    #[test]
    fn test_reset() {
        let b = bucket(5, 1000);
        assert!(!b.reset("k"));

        b.adjust("k", 1, 0);
        assert!(b.reset("k"));
        assert!(b.peek("k").is_none());
        assert_eq!(b.total_removed(), 1);
    }

    #[test]
    fn test_remove_if_expired_respects_renewal() {
        let b = bucket(5, 10);
        b.adjust("old", 1, 0);
        b.adjust("new", 1, 50);

        let expired: Vec<String> = (0..b.shard_count())
            .flat_map(|shard| b.expired_keys_in_shard(shard, 20))
            .collect();
        assert_eq!(expired, vec!["old".to_string()]);
        assert!(b.remove_if_expired("old", 20));
        assert!(!b.remove_if_expired("new", 20));
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_expired_keys_by_shard() {
        let b = bucket(5, 10);
        for i in 0..500 {
            b.adjust(&format!("k{i}"), 1, i % 2 * 100);
        }
        assert!(b.shard_count() >= 4);

        // Keys created at 0 expire at 10; keys created at 100 are live at 50.
        let mut expired: Vec<String> = (0..b.shard_count())
            .flat_map(|shard| b.expired_keys_in_shard(shard, 50))
            .collect();
        expired.sort();
        let mut expected: Vec<String> = (0..500).step_by(2).map(|i| format!("k{i}")).collect();
        expected.sort();
        assert_eq!(expired, expected);

        assert!(b.expired_keys_in_shard(b.shard_count(), 50).is_empty());
    }

    #[test]
    fn test_retain_live() {
        let b = bucket(5, 10);
        for i in 0..10 {
            b.adjust(&format!("k{i}"), 1, i);
        }
        // expires_at = i + 10; at now = 15 keys 0..=4 are expired
        assert_eq!(b.retain_live(15), 5);
        assert_eq!(b.len(), 5);
    }

    #[test]
    fn test_concurrent_takes_never_exceed_size() {
        use std::sync::Arc;
        use std::thread;

        let b = Arc::new(bucket(100, 60_000));
        let mut handles = vec![];

        for _ in 0..8 {
            let b = b.clone();
            handles.push(thread::spawn(move || {
                (0..50).filter(|_| b.adjust("shared", 1, 0).conformant).count()
            }));
        }

        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 100);
        assert_eq!(b.peek("shared").unwrap().remaining, -300);
    }

    #[test]
    fn test_ttl_secs_rounds_up() {
        let res = LimitResult { conformant: true, size: 1, remaining: 1, ttl: 2000 };
        assert_eq!(res.ttl_secs(), 2);
    }
}
