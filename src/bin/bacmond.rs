//! BACmon monitor daemon.
//!
//! Binds the BACnet/IP port, classifies and counts traffic, runs the
//! configured rate tasks and dispatches alerts until interrupted.
//!
//! Exit codes: 0 clean shutdown, 1 invalid configuration, 2 KV store
//! unreachable, 3 fatal runtime error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use bacmon::alert::{channels_from_config, AlertManager};
use bacmon::config::BacmonConfig;
use bacmon::kv::{KvStore, RedisKv};
use bacmon::monitor::{Monitor, MonitorContext};
use bacmon::unix_now;

#[derive(Debug, Parser)]
#[command(name = "bacmond", version, about = "Passive BACnet/IP network monitor")]
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
            eprintln!("bacmond: {}", err);
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

    let alerts = Arc::new(AlertManager::new(
        Arc::clone(&kv),
        channels_from_config(&config.alerts),
        config.alerts.rate_limit(),
    ));
    if let Err(err) = alerts.load().await {
        error!(error = %err, "failed to load alert state");
        return ExitCode::from(2);
    }

    let context = match MonitorContext::new(kv, config) {
        Ok(context) => context,
        Err(err) => {
            eprintln!("bacmond: {}", err);
            return ExitCode::from(1);
        }
    };

    let monitor = match Monitor::new(context, alerts, unix_now()).await {
        Ok(monitor) => monitor,
        Err(err) => {
            error!(error = %err, "monitor initialization failed");
            return ExitCode::from(3);
        }
    };

    match monitor.run().await {
        Ok(()) => {
            info!("monitor stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "monitor failed");
            ExitCode::from(3)
        }
    }
}
