//! # Bucket Configuration
//!
//! Buckets are declared once at startup and never change afterwards.
//! This module turns user input (command-line specs, config-file entries)
//! into validated [`BucketConfig`] values collected in a [`BucketSet`].
//!
//! ## Bucket Parameters
//!
//! ```text
//!     "login,5,15m"
//!       │    │  │
//!       │    │  └─► window (ttl): 15 minutes = 900_000 ms
//!       │    └────► capacity (size): 5 tokens per key
//!       └─────────► name: alphanumeric, unique
//! ```
//!
//! ## TTL Grammar
//!
//! ```text
//!     <digits>[ms|s|m|h]      unit defaults to seconds
//!
//!     "250ms" ──►       250 ms
//!     "30"    ──►    30_000 ms
//!     "2m"    ──►   120_000 ms
//!     "1h"    ──► 3_600_000 ms
//! ```

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Static definition of one bucket.
///
/// # Example
///
/// ```rust
/// use ratekeeper::BucketConfig;
///
/// let bucket = BucketConfig::parse_spec("login, 5, 15m").unwrap();
/// assert_eq!(bucket.name, "login");
/// assert_eq!(bucket.size, 5);
/// assert_eq!(bucket.ttl_ms, 900_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfig {
    /// Unique alphanumeric bucket name, used as the first path segment.
    pub name: String,

    /// Maximum number of tokens a single key can hold.
    pub size: u64,

    /// How long a record stays valid after it is created, in milliseconds.
    pub ttl_ms: u64,
}

impl BucketConfig {
    /// Creates a validated bucket definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the name is not alphanumeric,
    /// or if `size` or `ttl_ms` is zero.
    pub fn new(name: impl Into<String>, size: u64, ttl_ms: u64) -> Result<Self> {
        let config = Self {
            name: name.into(),
            size,
            ttl_ms,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parses a `name,size,ttl` command-line bucket definition.
    ///
    /// Whitespace around each part is ignored. Missing parts, a zero size
    /// and a zero ttl are all rejected with a message naming the input.
    pub fn parse_spec(spec: &str) -> Result<Self> {
        let mut parts = spec.split(',').map(str::trim);
        let name = parts.next().unwrap_or_default();
        let size = parts.next().unwrap_or_default();
        let ttl = parts.next().unwrap_or_default();

        let ttl_ms = if ttl.is_empty() {
            None
        } else {
            Some(parse_ttl(ttl).map_err(|e| Error::config(format!("{e} for bucket {spec}")))?)
        };
        let size_value = size.parse::<u64>().ok().filter(|s| *s > 0);

        match (name.is_empty(), size_value, ttl_ms) {
            (false, Some(size), Some(ttl_ms)) => Self::new(name, size, ttl_ms),
            _ => Err(Error::config(format!(
                "Could not parse bucket {spec} name:{name} size:{size} ttl:{}",
                ttl_ms.map(|t| t.to_string()).unwrap_or_default()
            ))),
        }
    }

    /// Checks the invariants every bucket must hold.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.size == 0 {
            return Err(Error::config(format!(
                "bucket size must be a positive integer for bucket {}",
                self.name
            )));
        }
        if self.ttl_ms == 0 {
            return Err(Error::config(format!(
                "ttl must be a positive integer for bucket {}",
                self.name
            )));
        }
        Ok(())
    }
}

/// Checks that a bucket name is a non-empty ASCII alphanumeric string.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::config(format!(
            "bucket name must be alphanumeric ({name:?})"
        )));
    }
    Ok(())
}

/// Parses a TTL string into milliseconds.
///
/// # Example
///
/// ```rust
/// use ratekeeper::parse_ttl;
///
/// assert_eq!(parse_ttl("250ms").unwrap(), 250);
/// assert_eq!(parse_ttl("30").unwrap(), 30_000);
/// assert!(parse_ttl("0").is_err());
/// assert!(parse_ttl("5d").is_err());
/// ```
pub fn parse_ttl(input: &str) -> Result<u64> {
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);

    let value = digits
        .parse::<u64>()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| Error::config("ttl must be a positive integer"))?;

    let multiplier: u64 = match unit {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => return Err(Error::config(format!("Unknown ttl unit {other}"))),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::config(format!("ttl {input} is too large")))
}

/// TTL as written in a config file: a bare number of seconds or a unit string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TtlValue {
    /// Whole seconds.
    Seconds(u64),
    /// Anything accepted by [`parse_ttl`].
    Text(String),
}

impl TtlValue {
    /// Converts to milliseconds.
    pub fn to_ms(&self) -> Result<u64> {
        match self {
            Self::Seconds(secs) => parse_ttl(&secs.to_string()),
            Self::Text(text) => parse_ttl(text),
        }
    }
}

/// Bucket entry as it appears under `buckets.<name>` in a config file.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketEntry {
    /// Capacity.
    pub size: u64,
    /// Window.
    pub ttl: TtlValue,
}

impl BucketEntry {
    /// Resolves this entry into a validated [`BucketConfig`].
    pub fn into_config(self, name: &str) -> Result<BucketConfig> {
        let ttl_ms = self
            .ttl
            .to_ms()
            .map_err(|e| Error::config(format!("{e} for bucket {name}")))?;
        BucketConfig::new(name, self.size, ttl_ms)
    }
}

/// The full, named set of configured buckets.
///
/// Names are unique; iteration is in name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketSet {
    buckets: BTreeMap<String, BucketConfig>,
}

impl BucketSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from definitions, rejecting duplicates and an empty list.
    ///
    /// ```rust
    /// use ratekeeper::{BucketConfig, BucketSet};
    ///
    /// let set = BucketSet::from_configs(vec![
    ///     BucketConfig::new("login", 5, 60_000).unwrap(),
    ///     BucketConfig::new("search", 100, 1_000).unwrap(),
    /// ]).unwrap();
    /// assert_eq!(set.len(), 2);
    /// ```
    pub fn from_configs(configs: impl IntoIterator<Item = BucketConfig>) -> Result<Self> {
        let mut set = Self::new();
        for config in configs {
            set.insert_unique(config)?;
        }
        set.validate()?;
        Ok(set)
    }

    /// Adds a bucket, failing if the name is already taken.
    pub fn insert_unique(&mut self, config: BucketConfig) -> Result<()> {
        config.validate()?;
        if self.buckets.contains_key(&config.name) {
            return Err(Error::config(format!(
                "Bucket {} was already defined",
                config.name
            )));
        }
        self.buckets.insert(config.name.clone(), config);
        Ok(())
    }

    /// Adds a bucket, replacing any existing definition with the same name.
    pub fn upsert(&mut self, config: BucketConfig) -> Result<()> {
        config.validate()?;
        self.buckets.insert(config.name.clone(), config);
        Ok(())
    }

    /// Fails if the set is empty.
    pub fn validate(&self) -> Result<()> {
        if self.buckets.is_empty() {
            return Err(Error::config("Bucket list is empty"));
        }
        Ok(())
    }

    /// Looks up a bucket by name.
    pub fn get(&self, name: &str) -> Option<&BucketConfig> {
        self.buckets.get(name)
    }

    /// Whether a bucket with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.buckets.contains_key(name)
    }

    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no bucket has been added.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Iterates bucket definitions in name order.
    pub fn iter(&self) -> impl Iterator<Item = &BucketConfig> {
        self.buckets.values()
    }
}

impl IntoIterator for BucketSet {
    type Item = BucketConfig;
    type IntoIter = std::collections::btree_map::IntoValues<String, BucketConfig>;

    fn into_iter(self) -> Self::IntoIter {
        self.buckets.into_values()
    }
}
