//! BACmon API server.
//!
//! Serves the versioned REST/SSE API over the shared KV store. Runs as a
//! separate process from the monitor daemon; the two coordinate only
//! through the store.
//!
//! Exit codes: 0 clean shutdown, 1 invalid configuration, 2 KV store
//! unreachable, 3 fatal runtime error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::error;

use bacmon::alert::{channels_from_config, AlertManager};
use bacmon::api::{serve, ApiState};
use bacmon::config::BacmonConfig;
use bacmon::kv::{KvStore, RedisKv};

#[derive(Debug, Parser)]
#[command(name = "bacmon-api", version, about = "BACmon REST/SSE API server")]
struct Args {
    /// Configuration file
    #[arg(long, short, default_value = "BACmon.toml")]
    config: PathBuf,

    /// Raise a named logger to debug level (repeatable)
    #[arg(long = "debug", value_name = "LOGGER")]
    debug: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match BacmonConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("bacmon-api: {}", err);
            return ExitCode::from(1);
        }
    };

    let _log_guard = bacmon::logging::init(&config.logging, &args.debug);

    let kv: Arc<dyn KvStore> =
        match RedisKv::connect(&config.redis.url(), config.redis.retry_policy()).await {
            Ok(kv) => Arc::new(kv),
            Err(err) => {
                error!(error = %err, "cannot connect to the KV store");
                return ExitCode::from(2);
            }
        };
    if let Err(err) = kv.ping().await {
        error!(error = %err, "KV store is not responding");
        return ExitCode::from(2);
    }

    // The API keeps its own manager instance, rehydrated from the store;
    // resolve/acknowledge write back through the same keys the monitor
    // reads.
    let alerts = Arc::new(AlertManager::new(
        Arc::clone(&kv),
        channels_from_config(&config.alerts),
        config.alerts.rate_limit(),
    ));
    if let Err(err) = alerts.load().await {
        error!(error = %err, "failed to load alert state");
        return ExitCode::from(2);
    }

    let bind = config.api.bind.clone();
    let state = ApiState::new(kv, alerts, config);

    match serve(state, &bind).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "API server failed");
            ExitCode::from(3)
        }
    }
}
