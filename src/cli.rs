//! # Command Line and Config File
//!
//! Startup options come from two places and are merged into one
//! [`ServerConfig`]:
//!
//! ```text
//!     ratekeeper -p 9000 -i 60 login,5,15m search,100,1s -c limits.toml
//!          │                        │                      │
//!          ▼                        ▼                      ▼
//!     ┌──────────┐           ┌────────────┐         ┌─────────────┐
//!     │  flags   │           │ bucket     │         │ config file │
//!     │ (clap)   │           │ specs      │         │ (json/toml) │
//!     └────┬─────┘           └─────┬──────┘         └──────┬──────┘
//!          │                       │                       │
//!          └───────────────┬───────┘                       │
//!                          ▼                               │
//!                   ┌─────────────┐   file values win      │
//!                   │ ServerConfig│ ◄──────────────────────┘
//!                   └─────────────┘
//! ```
//!
//! ## Config File Shape
//!
//! ```json
//! {
//!   "buckets": {
//!     "login":  { "size": 5,   "ttl": "15m" },
//!     "search": { "size": 100, "ttl": 1 }
//!   },
//!   "port": 9000,
//!   "host": "0.0.0.0",
//!   "cleanInterval": 60
//! }
//! ```
//!
//! Numeric TTLs are seconds. The same keys work in TOML, where
//! `clean_interval` reads more naturally and is accepted too.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{CommandFactory, Parser, ValueEnum};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::{BucketConfig, BucketEntry, BucketSet, MAX_CLEAN_INTERVAL};

/// Port used when neither the command line nor the config file sets one.
pub const DEFAULT_PORT: u16 = 8910;

/// Host used when neither the command line nor the config file sets one.
pub const DEFAULT_HOST: &str = "localhost";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Standalone token-bucket rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "ratekeeper", version, about)]
pub struct Args {
    /// Bucket definitions, each as `name,size,ttl` (ttl like 500ms, 30, 2m, 1h)
    #[arg(value_name = "BUCKETS")]
    pub buckets: Vec<String>,

    /// JSON or TOML file with buckets and options; its values take precedence
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Seconds between background sweeps of expired records (1 to 31536000)
    #[arg(short = 'i', long, value_name = "SECS")]
    pub clean_interval: Option<u64>,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Host or address to bind
    #[arg(short = 'H', long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Log level: trace, debug, info, warn, error or silent
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl Args {
    /// Rendered `--help` text, printed after a startup error.
    pub fn usage() -> String {
        Self::command().render_help().to_string()
    }

    /// Merges flags, bucket specs and the optional config file, then
    /// validates the result.
    pub fn resolve(self) -> Result<ServerConfig> {
        let log_filter = log_filter(&self.log_level)?.to_owned();

        let mut buckets = BucketSet::new();
        for spec in &self.buckets {
            buckets.insert_unique(BucketConfig::parse_spec(spec)?)?;
        }

        let mut port = self.port;
        let mut host = self.host;
        let mut clean_interval = self.clean_interval;

        if let Some(path) = &self.config {
            let file = FileConfig::load(path)?;
            for (name, entry) in file.buckets {
                buckets.upsert(entry.into_config(&name)?)?;
            }
            port = file.port.unwrap_or(port);
            host = file.host.unwrap_or(host);
            clean_interval = file.clean_interval.or(clean_interval);
        }

        buckets.validate()?;
        if port == 0 {
            return Err(Error::config("port must be a positive integer"));
        }
        if host.trim().is_empty() {
            return Err(Error::config("host must not be empty"));
        }
        let clean_interval = match clean_interval {
            Some(0) => {
                return Err(Error::config("clean-interval must be a positive integer"));
            }
            Some(secs) if Duration::from_secs(secs) > MAX_CLEAN_INTERVAL => {
                return Err(Error::config(format!(
                    "clean-interval must be at most {} seconds",
                    MAX_CLEAN_INTERVAL.as_secs()
                )));
            }
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        Ok(ServerConfig {
            host,
            port,
            clean_interval,
            buckets,
            log_filter,
            log_format: self.log_format,
        })
    }
}

/// Maps a CLI log level onto an `EnvFilter` directive.
pub fn log_filter(level: &str) -> Result<&'static str> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" => Ok("warn"),
        "error" => Ok("error"),
        "silent" | "off" => Ok("off"),
        other => Err(Error::config(format!("Unknown log level {other}"))),
    }
}

/// Fully resolved startup configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Sweep period; `None` disables the background sweeper.
    pub clean_interval: Option<Duration>,
    /// Configured buckets, never empty.
    pub buckets: BucketSet,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Log output format.
    pub log_format: LogFormat,
}

impl ServerConfig {
    /// Defaults for everything but the bucket set.
    pub fn new(buckets: BucketSet) -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            clean_interval: None,
            buckets,
            log_filter: "info".to_owned(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Config file contents.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Bucket entries keyed by name.
    #[serde(default)]
    pub buckets: BTreeMap<String, BucketEntry>,
    /// Overrides `--port`.
    pub port: Option<u16>,
    /// Overrides `--host`.
    pub host: Option<String>,
    /// Overrides `--clean-interval`, in seconds.
    #[serde(rename = "cleanInterval", alias = "clean_interval")]
    pub clean_interval: Option<u64>,
}

impl FileConfig {
    /// Reads a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let parse: fn(&str) -> Result<Self> = match ext.as_deref() {
            Some("json") => Self::from_json,
            Some("toml") => Self::from_toml,
            _ => {
                return Err(Error::config(format!(
                    "Unsupported config file {}, expected .json or .toml",
                    path.display()
                )));
            }
        };

        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Could not read config file {}: {e}", path.display()))
        })?;
        parse(&text)
    }

    /// Parses JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::ConfigFormat(e.to_string()))
    }

    /// Parses TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::ConfigFormat(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(argv: &[&str]) -> Args {
        let mut full = vec!["ratekeeper"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).unwrap()
    }

    fn config_file(suffix: &str, body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = args(&["login,5,15m"]).resolve().unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, "localhost");
        assert_eq!(config.clean_interval, None);
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.buckets.get("login").unwrap().ttl_ms, 900_000);
    }

    #[test]
    fn test_flags() {
        let config = args(&[
            "-p", "9000", "-H", "0.0.0.0", "-i", "30", "-l", "silent", "--log-format", "json",
            "a,1,1", "b,2,500ms",
        ])
        .resolve()
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.clean_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.log_filter, "off");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.buckets.len(), 2);
    }

    #[test]
    fn test_duplicate_cli_bucket() {
        let err = args(&["a,1,1", "a,2,2"]).resolve().unwrap_err();
        assert_eq!(err.to_string(), "Bucket a was already defined");
    }

    #[test]
    fn test_empty_bucket_list() {
        let err = args(&[]).resolve().unwrap_err();
        assert_eq!(err.to_string(), "Bucket list is empty");
    }

    #[test]
    fn test_invalid_values() {
        assert!(args(&["-i", "0", "a,1,1"]).resolve().is_err());
        assert!(args(&["-p", "0", "a,1,1"]).resolve().is_err());
        assert!(args(&["-l", "loud", "a,1,1"]).resolve().is_err());
        assert!(args(&["a,0,1"]).resolve().is_err());
        assert!(args(&["a,1,0"]).resolve().is_err());
        assert!(Args::try_parse_from(["ratekeeper", "-p", "-1", "a,1,1"]).is_err());
    }

    #[test]
    fn test_json_file_overrides_cli() {
        let file = config_file(
            ".json",
            r#"{
                "buckets": { "a": { "size": 10, "ttl": 2 }, "c": { "size": 3, "ttl": "1m" } },
                "port": 7000,
                "host": "127.0.0.1",
                "cleanInterval": 5
            }"#,
        );
        let path = file.path().to_str().unwrap();
        let config = args(&["-p", "9000", "-i", "60", "a,1,1", "b,2,2", "-c", path])
            .resolve()
            .unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.clean_interval, Some(Duration::from_secs(5)));
        assert_eq!(config.buckets.len(), 3);

        let a = config.buckets.get("a").unwrap();
        assert_eq!((a.size, a.ttl_ms), (10, 2_000));
        assert_eq!(config.buckets.get("b").unwrap().size, 2);
        assert_eq!(config.buckets.get("c").unwrap().ttl_ms, 60_000);
    }

    #[test]
    fn test_toml_file_only() {
        let file = config_file(
            ".TOML",
            r#"
                clean_interval = 10

                [buckets.login]
                size = 5
                ttl = "15m"
            "#,
        );
        let config = args(&["-c", file.path().to_str().unwrap()]).resolve().unwrap();
        assert_eq!(config.clean_interval, Some(Duration::from_secs(10)));
        assert_eq!(config.buckets.get("login").unwrap().size, 5);
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_file_errors() {
        let yaml = config_file(".yaml", "buckets: {}");
        let err = args(&["-c", yaml.path().to_str().unwrap()]).resolve().unwrap_err();
        assert!(err.to_string().starts_with("Unsupported config file"));

        let err = args(&["-c", "/nonexistent/limits.json"]).resolve().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let broken = config_file(".json", "{ not json");
        let err = args(&["-c", broken.path().to_str().unwrap()]).resolve().unwrap_err();
        assert!(matches!(err, Error::ConfigFormat(_)));

        let bad_ttl = config_file(".json", r#"{ "buckets": { "a": { "size": 1, "ttl": "5d" } } }"#);
        let err = args(&["-c", bad_ttl.path().to_str().unwrap()]).resolve().unwrap_err();
        assert_eq!(err.to_string(), "Unknown ttl unit d for bucket a");
    }

    #[test]
    fn test_clean_interval_bounds() {
        let max = MAX_CLEAN_INTERVAL.as_secs().to_string();
        let config = args(&["-i", max.as_str(), "a,1,1"]).resolve().unwrap();
        assert_eq!(config.clean_interval, Some(MAX_CLEAN_INTERVAL));

        let over = (MAX_CLEAN_INTERVAL.as_secs() + 1).to_string();
        let err = args(&["-i", over.as_str(), "a,1,1"]).resolve().unwrap_err();
        assert_eq!(err.to_string(), "clean-interval must be at most 31536000 seconds");

        let huge = config_file(
            ".json",
            r#"{ "buckets": { "a": { "size": 1, "ttl": 1 } }, "cleanInterval": 18446744073709551615 }"#,
        );
        let err = args(&["-c", huge.path().to_str().unwrap()]).resolve().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_log_filter() {
        assert_eq!(log_filter("DEBUG").unwrap(), "debug");
        assert_eq!(log_filter("silent").unwrap(), "off");
        assert!(log_filter("verbose").is_err());
    }

    #[test]
    fn test_usage_mentions_options() {
        let usage = Args::usage();
        assert!(usage.contains("--clean-interval"));
        assert!(usage.contains("--config"));
    }
}
