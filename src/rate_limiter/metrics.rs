//! # Store Statistics
//!
//! Point-in-time view of what the token store is holding, used for
//! startup and sweep logging.
//!
//! ```text
//!     Token Store Stats:
//!     ├─ login: 1204 keys (size 5, ttl 900000ms)
//!     │  └─ created 5310 / removed 4106
//!     └─ search: 87 keys (size 100, ttl 1000ms)
//!        └─ created 912 / removed 825
//! ```

use std::fmt;

/// Snapshot for one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketStats {
    /// Bucket name.
    pub name: String,

    /// Configured capacity.
    pub size: u64,

    /// Configured window in milliseconds.
    pub ttl_ms: u64,

    /// Records currently stored, including expired ones not yet swept.
    pub keys: usize,

    /// Records created since startup.
    pub total_created: u64,

    /// Records removed by reset or sweep since startup.
    pub total_removed: u64,
}

/// Snapshot of every bucket in a store, in name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Per-bucket figures.
    pub buckets: Vec<BucketStats>,
}

impl StoreStats {
    /// Total records across all buckets.
    pub fn total_keys(&self) -> usize {
        self.buckets.iter().map(|b| b.keys).sum()
    }

    /// Figures for one bucket.
    pub fn bucket(&self, name: &str) -> Option<&BucketStats> {
        self.buckets.iter().find(|b| b.name == name)
    }

    /// Human-readable tree summary.
    pub fn summary(&self) -> String {
        let mut out = String::from("Token Store Stats:");
        let last = self.buckets.len().saturating_sub(1);
        for (i, b) in self.buckets.iter().enumerate() {
            let (branch, stem) = if i == last { ("└─", "   ") } else { ("├─", "│  ") };
            out.push_str(&format!(
                "\n{branch} {}: {} keys (size {}, ttl {}ms)\n{stem}└─ created {} / removed {}",
                b.name, b.keys, b.size, b.ttl_ms, b.total_created, b.total_removed
            ));
        }
        out
    }
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}
