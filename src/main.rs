use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use ratekeeper::cli::{Args, LogFormat, ServerConfig};
use ratekeeper::{server, CleanRunner, TokenStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match Args::parse().resolve() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}\n");
            eprintln!("{}", Args::usage());
            std::process::exit(1);
        }
    };

    setup_logging(&config);
    debug!(?config, "resolved configuration");

    let store = Arc::new(TokenStore::new(config.buckets.clone()));
    info!(buckets = ?store.bucket_names(), "{}", store.stats());

    let cleaner = config
        .clean_interval
        .map(|interval| CleanRunner::new(store.clone(), interval).spawn());

    server::serve(&config, store, shutdown_signal())
        .await
        .with_context(|| format!("could not serve on {}:{}", config.host, config.port))?;

    if let Some(cleaner) = cleaner {
        cleaner.shutdown().await;
    }
    info!("shut down");
    Ok(())
}

/// `RUST_LOG` wins over `--log-level`.
fn setup_logging(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl-C, shutting down"),
        Err(e) => {
            error!(error = %e, "could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}
