//! # Token Store
//!
//! The store owns one [`Bucket`] per configured bucket name and routes every
//! operation to it. The bucket table itself is built once and never mutated,
//! so looking a bucket up needs no lock; all synchronization happens inside
//! each bucket's sharded key map.
//!
//! ## Architecture
//!
//! ```text
//!     take/give/query/reset(bucket, key)
//!                    │
//!                    ▼
//!            ┌──────────────┐
//!            │  TokenStore  │  name → Bucket (read-only after startup)
//!            └──────┬───────┘
//!          ┌────────┼─────────┐
//!          ▼        ▼         ▼
//!      ┌───────┐┌───────┐┌───────┐
//!      │ login ││search ││ fast1 │  DashMap<key, Record>, one per bucket
//!      └───────┘└───────┘└───────┘
//! ```
//!
//! ## Cleanup
//!
//! [`TokenStore::clean`] sweeps all requested buckets concurrently. Inside a
//! bucket it walks the key map one shard at a time: the shard is scanned
//! under its read lock, then its expired keys are removed in chunks of
//! [`SWEEP_CHUNK`]. The sweep yields to the runtime and checks for
//! cancellation after every shard scan and every chunk, so no single poll
//! touches more than one shard.
//!
//! ```text
//!     shard 0: scan ─ yield ─ remove 256 ─ yield ─ remove 31 ─ yield
//!     shard 1: scan ─ yield
//!     shard 2: scan ─ yield ─ remove 12 ─ yield
//!     ...
//! ```
//!
//! [`TokenStore::clean_sync`] is the blocking variant.

use super::{
    config::BucketSet,
    core::{Bucket, LimitResult},
    metrics::{BucketStats, StoreStats},
    utils::{Clock, SystemClock},
};
use crate::error::{Error, Result};
use futures::future::try_join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Keys removed between two yields of a cooperative sweep.
pub const SWEEP_CHUNK: usize = 256;

/// In-memory token buckets for every configured bucket.
///
/// ## Usage
///
/// ```rust
/// use ratekeeper::{BucketConfig, BucketSet, TokenStore};
///
/// let buckets = BucketSet::from_configs(vec![
///     BucketConfig::new("login", 2, 60_000).unwrap(),
/// ]).unwrap();
/// let store = TokenStore::new(buckets);
///
/// assert!(store.take("login", "10.0.0.1").unwrap().conformant);
/// assert!(store.take("login", "10.0.0.1").unwrap().conformant);
/// assert!(!store.take("login", "10.0.0.1").unwrap().conformant);
///
/// assert!(store.take("unknown", "10.0.0.1").is_err());
/// ```
pub struct TokenStore {
    buckets: HashMap<String, Bucket>,
    clock: Arc<dyn Clock>,
}

impl TokenStore {
    /// Creates a store driven by the system clock.
    pub fn new(buckets: BucketSet) -> Self {
        Self::with_clock(buckets, Arc::new(SystemClock))
    }

    /// Creates a store that reads time from `clock`.
    pub fn with_clock(buckets: BucketSet, clock: Arc<dyn Clock>) -> Self {
        let buckets = buckets
            .into_iter()
            .map(|config| (config.name.clone(), Bucket::new(config)))
            .collect();
        Self { buckets, clock }
    }

    /// Looks up a bucket by name.
    #[inline]
    pub fn bucket(&self, name: &str) -> Result<&Bucket> {
        self.buckets
            .get(name)
            .ok_or_else(|| Error::UnknownBucket(name.to_owned()))
    }

    /// Whether `name` is a configured bucket.
    #[inline]
    pub fn has_bucket(&self, name: &str) -> bool {
        self.buckets.contains_key(name)
    }

    /// Configured bucket names in name order.
    pub fn bucket_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.buckets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Current time as seen by the store.
    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Applies a signed adjustment to `key` in `bucket`.
    ///
    /// `count > 0` takes tokens, `count < 0` gives them back, `0` queries.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownBucket`] if `bucket` is not configured.
    pub fn adjust(&self, bucket: &str, key: &str, count: i64) -> Result<LimitResult> {
        debug!(bucket, key, count, "adjust");
        let b = self.bucket(bucket)?;
        Ok(b.adjust(key, count, self.clock.now_ms()))
    }

    /// Takes one token.
    #[inline]
    pub fn take(&self, bucket: &str, key: &str) -> Result<LimitResult> {
        self.adjust(bucket, key, 1)
    }

    /// Gives one token back.
    #[inline]
    pub fn give(&self, bucket: &str, key: &str) -> Result<LimitResult> {
        self.adjust(bucket, key, -1)
    }

    /// Reports the key's state without consuming anything.
    #[inline]
    pub fn query(&self, bucket: &str, key: &str) -> Result<LimitResult> {
        self.adjust(bucket, key, 0)
    }

    /// Deletes the record for `key`, returning whether it existed.
    pub fn reset(&self, bucket: &str, key: &str) -> Result<bool> {
        debug!(bucket, key, "reset");
        Ok(self.bucket(bucket)?.reset(key))
    }

    /// Removes expired records without blocking request handling.
    ///
    /// `names` selects buckets (all of them when `None`). Every name is
    /// checked before anything is swept. Returns the number of keys left in
    /// each swept bucket.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownBucket`] for an unconfigured name
    /// - [`Error::SweepCancelled`] if `cancel` fires mid-sweep
    pub async fn clean(
        &self,
        names: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, usize>> {
        let targets = self.resolve(names)?;
        let now_ms = self.clock.now_ms();

        let sweeps = targets
            .into_iter()
            .map(|bucket| sweep_bucket(bucket, now_ms, cancel));
        let remaining = try_join_all(sweeps).await?;

        Ok(remaining.into_iter().collect())
    }

    /// Blocking variant of [`clean`](Self::clean) for offline use.
    ///
    /// Each bucket is swept with a single `retain` pass that write-locks its
    /// shards in turn.
    pub fn clean_sync(&self, names: Option<&[String]>) -> Result<BTreeMap<String, usize>> {
        let targets = self.resolve(names)?;
        let now_ms = self.clock.now_ms();

        Ok(targets
            .into_iter()
            .map(|bucket| {
                let name = bucket.config().name.clone();
                debug!(bucket = %name, "cleaning bucket");
                let removed = bucket.retain_live(now_ms);
                debug!(bucket = %name, removed, "bucket cleaned");
                (name, bucket.len())
            })
            .collect())
    }

    /// Snapshot of every bucket.
    pub fn stats(&self) -> StoreStats {
        let buckets = self
            .bucket_names()
            .into_iter()
            .filter_map(|name| self.buckets.get(name))
            .map(|b| BucketStats {
                name: b.config().name.clone(),
                size: b.config().size,
                ttl_ms: b.config().ttl_ms,
                keys: b.len(),
                total_created: b.total_created(),
                total_removed: b.total_removed(),
            })
            .collect();
        StoreStats { buckets }
    }

    fn resolve(&self, names: Option<&[String]>) -> Result<Vec<&Bucket>> {
        match names {
            None => Ok(self
                .bucket_names()
                .into_iter()
                .filter_map(|name| self.buckets.get(name))
                .collect()),
            Some(names) => names.iter().map(|name| self.bucket(name)).collect(),
        }
    }
}

async fn sweep_bucket(
    bucket: &Bucket,
    now_ms: u64,
    cancel: &CancellationToken,
) -> Result<(String, usize)> {
    let name = &bucket.config().name;
    debug!(bucket = %name, shards = bucket.shard_count(), "cleaning bucket");

    let cancelled = || Error::SweepCancelled {
        bucket: name.clone(),
    };
    let mut removed = 0usize;

    for shard in 0..bucket.shard_count() {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let expired = bucket.expired_keys_in_shard(shard, now_ms);
        tokio::task::yield_now().await;

        for chunk in expired.chunks(SWEEP_CHUNK) {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            removed += chunk
                .iter()
                .filter(|key| bucket.remove_if_expired(key, now_ms))
                .count();
            tokio::task::yield_now().await;
        }
    }

    debug!(bucket = %name, removed, "bucket cleaned");
    Ok((name.clone(), bucket.len()))
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("buckets", &self.bucket_names())
            .field("clock", &self.clock)
            .finish()
    }
}
