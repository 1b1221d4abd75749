//! # Ratekeeper - Standalone Token-Bucket Rate Limiting Service
//!
//! Ratekeeper keeps per-key token counts for a fixed set of named buckets
//! and answers "may this caller proceed?" over a small HTTP API. Other
//! services call it instead of carrying their own counters.
//!
//! ## How a Bucket Works
//!
//! Every bucket has a capacity (`size`) and a window (`ttl`). The first
//! request for a key opens a window with a full bucket; tokens are spent
//! by takes and returned by gives until the window ends, after which the
//! key starts over.
//!
//! ```text
//!     bucket "login": size 3, ttl 1m
//!
//!     t=0s    take  ──►  remaining 2   ✅
//!     t=5s    take  ──►  remaining 1   ✅
//!     t=9s    take  ──►  remaining 0   ✅
//!     t=12s   take  ──►  remaining 0   ⛔  (internally -1: debt)
//!     t=20s   give  ──►  remaining 0   ⛔  (debt paid back to 0)
//!     t=61s   take  ──►  remaining 2   ✅  (new window)
//! ```
//!
//! Takes past zero keep counting down, so a caller that keeps hammering an
//! exhausted key has to give back more than it took before it is allowed
//! through again in the same window.
//!
//! ## Quick Start
//!
//! ```rust
//! use ratekeeper::{BucketConfig, BucketSet, TokenStore};
//!
//! let buckets = BucketSet::from_configs(vec![
//!     BucketConfig::parse_spec("login,3,1m").unwrap(),
//! ]).unwrap();
//! let store = TokenStore::new(buckets);
//!
//! let res = store.take("login", "alice").unwrap();
//! assert!(res.conformant);
//! assert_eq!(res.remaining, 2);
//! assert_eq!(res.ttl, 60_000);
//!
//! assert!(store.take("nope", "alice").is_err());
//! ```
//!
//! ## Architecture Overview
//!
//! ```text
//!                    ┌─────────────────────────┐
//!                    │   ratekeeper (binary)   │
//!                    │   cli: Args → Config    │
//!                    └──────────┬──────────────┘
//!                               │
//!                ┌──────────────┴───────────────┐
//!                │                              │
//!     ┌──────────▼──────────┐       ┌───────────▼──────────┐
//!     │   server (axum)     │       │   CleanRunner        │
//!     ├─────────────────────┤       ├──────────────────────┤
//!     │ GET/POST/DELETE     │       │ • fixed interval     │
//!     │   /:bucket/:key     │       │ • never overlaps     │
//!     │ DELETE /clean       │       │ • skip + warn        │
//!     └──────────┬──────────┘       └───────────┬──────────┘
//!                │                              │
//!                └──────────────┬───────────────┘
//!                               │
//!                    ┌──────────▼──────────────┐
//!                    │       TokenStore        │
//!                    ├─────────────────────────┤
//!                    │ bucket → DashMap<key,   │
//!                    │          Record>        │
//!                    └─────────────────────────┘
//! ```
//!
//! ## Thread Safety
//!
//! `TokenStore` is shared as `Arc<TokenStore>`. Each key lives in one
//! shard of its bucket's `DashMap`, so an update only locks that shard and
//! concurrent updates to the same key are applied one after another.
//! Sweeps remove expired records in small chunks and yield in between, so
//! requests keep being served while a sweep runs.

#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    missing_debug_implementations
)]

mod rate_limiter;

pub mod cli;
pub mod error;
pub mod server;

pub use error::{Error, Result};
pub use rate_limiter::*;

/// Shared handle to a token store.
pub type SharedTokenStore = std::sync::Arc<TokenStore>;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly used items.
///
/// ```rust
/// use ratekeeper::prelude::*;
///
/// let store = TokenStore::new(
///     BucketSet::from_configs(vec![BucketConfig::new("api", 10, 1_000).unwrap()]).unwrap(),
/// );
/// assert_eq!(store.query("api", "k").unwrap().remaining, 10);
/// ```
pub mod prelude {
    pub use crate::cli::{Args, ServerConfig};
    pub use crate::error::{Error, Result};
    pub use crate::{
        BucketConfig, BucketSet, CleanRunner, LimitResult, SharedTokenStore, Sweep, TokenStore,
    };
}
