use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};
use cronsaga_broker::{
    BrokerSettings, durable::SqliteBroker, http::server::run_server, in_memory::InMemoryBroker,
};
use cronsaga_models::errors::SendableError;
use cronsaga_utilities::{
    logger::{LoggerSettings, parse_level},
    startup,
};
use log::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    InMemory,
    Sqlite,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Durable message channel for cronsaga", long_about = None)]
struct Config {
    #[arg(long, env = "CRONSAGA_BROKER_ADDR", default_value = "127.0.0.1:7070")]
    addr: SocketAddr,

    #[arg(long, env = "CRONSAGA_BROKER_BACKEND", value_enum, default_value = "sqlite")]
    backend: Backend,

    #[arg(long, env = "CRONSAGA_BROKER_DB", default_value = "cronsaga-broker.db")]
    sqlite_path: String,

    #[arg(long, env = "CRONSAGA_BROKER_PREFETCH", default_value_t = 10)]
    prefetch: usize,

    #[arg(long, env = "CRONSAGA_BROKER_VISIBILITY_TIMEOUT_SECONDS", default_value_t = 300)]
    visibility_timeout_seconds: u64,

    #[arg(long, env = "CRONSAGA_BROKER_MAX_DELIVERIES", default_value_t = 5)]
    max_deliveries: u32,

    /// Base delay before a nacked message is redelivered; doubles per attempt.
    #[arg(long, env = "CRONSAGA_BROKER_REDELIVERY_DELAY_MS", default_value_t = 1000)]
    redelivery_delay_ms: u64,

    #[arg(long, env = "CRONSAGA_BROKER_ACKED_RETENTION_SECONDS", default_value_t = 3600)]
    acked_retention_seconds: u64,

    #[arg(long, env = "CRONSAGA_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "CRONSAGA_LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl Config {
    fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            prefetch: self.prefetch.max(1),
            visibility_timeout: Duration::from_secs(self.visibility_timeout_seconds.max(1)),
            max_deliveries: self.max_deliveries.max(1),
            redelivery_delay: Duration::from_millis(self.redelivery_delay_ms),
            acked_retention: Duration::from_secs(self.acked_retention_seconds),
            ..BrokerSettings::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let config = Config::try_parse()?;
    let logger_settings = LoggerSettings {
        level: parse_level(&config.log_level)?,
        file: config.log_file.clone(),
    };
    startup::startup("Cronsaga Broker", &logger_settings)?;

    let settings = config.broker_settings();
    info!(
        "Backend {:?}, prefetch {}, visibility timeout {:?}, max deliveries {}",
        config.backend, settings.prefetch, settings.visibility_timeout, settings.max_deliveries
    );

    let served = match config.backend {
        Backend::InMemory => {
            let broker = InMemoryBroker::with_settings(settings);
            run_server(config.addr, broker, shutdown_signal()).await
        }
        Backend::Sqlite => {
            let broker = SqliteBroker::open(&config.sqlite_path, settings).await?;
            info!("Persisting messages to {}", config.sqlite_path);
            run_server(config.addr, broker, shutdown_signal()).await
        }
    };

    if let Err(err) = served {
        error!("Broker server failed: {}", err);
        return Err(Box::new(err) as SendableError);
    }

    info!("Broker shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down...");
}
