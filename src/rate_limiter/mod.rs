//! # Rate Limiter Module
//!
//! Internal implementation of the token store and its cleanup scheduler.
//!
//! ## Module Structure
//!
//! ```text
//!     rate_limiter/
//!     ├── mod.rs          (You are here - Module organization)
//!     ├── config.rs       (Bucket definitions, TTL parsing, validation)
//!     ├── core.rs         (Per-key records and the signed adjust rule)
//!     ├── store.rs        (Bucket table, reset, cooperative cleanup)
//!     ├── cleaner.rs      (Non-overlapping periodic sweeps)
//!     ├── metrics.rs      (Store statistics)
//!     └── utils.rs        (Clock sources)
//! ```
//!
//! ## Architecture Flow
//!
//! ```text
//!     HTTP handler            CleanRunner (timer)
//!          │                        │
//!          ▼                        ▼
//!     ┌─────────┐  clean()   ┌───────────┐
//!     │  Store  │ ◄───────── │  Cleaner  │
//!     └────┬────┘            └───────────┘
//!          │
//!          ▼
//!     ┌─────────┐
//!     │  Core   │ ◄── Bucket: key → Record
//!     └────┬────┘
//!          │
//!          ▼
//!     ┌─────────┐
//!     │ Config  │ ◄── BucketConfig / BucketSet
//!     └─────────┘
//! ```

mod cleaner;
mod config;
mod core;
mod metrics;
mod store;
mod utils;

/// Bucket definitions and parsing helpers
pub use config::{parse_ttl, validate_name, BucketConfig, BucketEntry, BucketSet, TtlValue};

/// Per-key state and operation results
pub use core::{Bucket, LimitResult, Record};

/// The token store
pub use store::{TokenStore, SWEEP_CHUNK};

/// Periodic cleanup
pub use cleaner::{
    CleanRunner, CleanRunnerHandle, CleanRunnerStats, Sweep, SweepState, MAX_CLEAN_INTERVAL,
};

/// Statistics snapshots
pub use metrics::{BucketStats, StoreStats};

/// Time sources
pub use utils::{current_time_ms, Clock, ManualClock, SystemClock};
