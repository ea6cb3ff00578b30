use std::{collections::HashMap, path::PathBuf, time::Duration};

use clap::Parser;
use cronsaga_broker::ConnectionSettings;
use cronsaga_models::errors::{RuntimeError, SendableError};
use cronsaga_utilities::logger::{LoggerSettings, parse_level};
use reqwest::Url;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Config {
    pub broker_endpoint: Url,
    pub broker_poll_timeout: Duration,
    pub task_queue: String,
    pub saga_queue: String,
    pub consumer_id: String,
    pub prefetch: usize,
    pub idle_backoff: Duration,
    pub handler_timeout: Duration,
    /// Delivery attempt on which a saga step stops being retried.
    pub max_deliveries: u32,
    pub publish_timeout: Duration,
    pub connection: ConnectionSettings,
    pub task_webhook: Option<Url>,
    pub service_endpoints: HashMap<String, Url>,
    pub logger: LoggerSettings,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    #[arg(long, env = "CRONSAGA_BROKER_ENDPOINT", default_value = "http://127.0.0.1:7070/")]
    broker_endpoint: String,

    #[arg(long, env = "CRONSAGA_BROKER_POLL_TIMEOUT_SECONDS", default_value_t = 5)]
    broker_poll_timeout_seconds: u64,

    #[arg(long, env = "CRONSAGA_TASK_QUEUE", default_value = "tasks")]
    task_queue: String,

    #[arg(long, env = "CRONSAGA_SAGA_QUEUE", default_value = "saga-steps")]
    saga_queue: String,

    #[arg(long, env = "CRONSAGA_CONSUMER_ID")]
    consumer_id: Option<String>,

    #[arg(long, env = "CRONSAGA_PREFETCH", default_value_t = 10)]
    prefetch: usize,

    #[arg(long, env = "CRONSAGA_IDLE_BACKOFF_MS", default_value_t = 500)]
    idle_backoff_ms: u64,

    #[arg(long, env = "CRONSAGA_HANDLER_TIMEOUT_SECONDS", default_value_t = 60)]
    handler_timeout_seconds: u64,

    /// Keep in line with the broker's --max-deliveries.
    #[arg(long, env = "CRONSAGA_MAX_DELIVERIES", default_value_t = 5)]
    max_deliveries: u32,

    #[arg(long, env = "CRONSAGA_PUBLISH_TIMEOUT_SECONDS", default_value_t = 5)]
    publish_timeout_seconds: u64,

    #[arg(long, env = "CRONSAGA_HEARTBEAT_SECONDS", default_value_t = 10)]
    heartbeat_interval_seconds: u64,

    #[arg(long, env = "CRONSAGA_RECONNECT_SECONDS", default_value_t = 2)]
    reconnect_interval_seconds: u64,

    #[arg(long, env = "CRONSAGA_MAX_RECONNECT_ATTEMPTS", default_value_t = 30)]
    max_reconnect_attempts: u32,

    #[arg(long, env = "CRONSAGA_TASK_WEBHOOK")]
    task_webhook: Option<String>,

    /// `service=url` pairs, comma separated.
    #[arg(long, env = "CRONSAGA_SERVICE_ENDPOINTS", value_delimiter = ',', default_value = "")]
    service_endpoints: Vec<String>,

    #[arg(long, env = "CRONSAGA_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "CRONSAGA_LOG_FILE")]
    log_file: Option<PathBuf>,
}

pub fn parse_config() -> Result<Config, SendableError> {
    let args = CliArgs::try_parse()?;

    let consumer_id = match args.consumer_id {
        Some(ref value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => format!("worker-{}", Uuid::new_v4()),
    };

    let task_webhook = match args.task_webhook {
        Some(ref value) if !value.trim().is_empty() => Some(parse_url("task_webhook", value)?),
        _ => None,
    };

    let service_endpoints = parse_service_endpoints(&args.service_endpoints)?;

    Ok(Config {
        broker_endpoint: parse_url("broker_endpoint", &args.broker_endpoint)?,
        broker_poll_timeout: Duration::from_secs(args.broker_poll_timeout_seconds.max(1)),
        task_queue: args.task_queue,
        saga_queue: args.saga_queue,
        consumer_id,
        prefetch: args.prefetch.max(1),
        idle_backoff: Duration::from_millis(args.idle_backoff_ms),
        handler_timeout: Duration::from_secs(args.handler_timeout_seconds.max(1)),
        max_deliveries: args.max_deliveries.max(1),
        publish_timeout: Duration::from_secs(args.publish_timeout_seconds.max(1)),
        connection: ConnectionSettings {
            heartbeat_interval: Duration::from_secs(args.heartbeat_interval_seconds.max(1)),
            reconnect_interval: Duration::from_secs(args.reconnect_interval_seconds.max(1)),
            max_reconnect_attempts: args.max_reconnect_attempts,
            ..ConnectionSettings::default()
        },
        task_webhook,
        service_endpoints,
        logger: LoggerSettings {
            level: parse_level(&args.log_level)?,
            file: args.log_file,
        },
    })
}

fn parse_url(field: &str, value: &str) -> Result<Url, SendableError> {
    Url::parse(value.trim()).map_err(|err| -> SendableError {
        Box::new(RuntimeError::new(
            format!("worker.config.{field}"),
            format!("'{value}' is not a valid URL: {err}"),
        ))
    })
}

pub fn parse_service_endpoints(values: &[String]) -> Result<HashMap<String, Url>, SendableError> {
    let mut endpoints = HashMap::new();
    for entry in values.iter().map(|value| value.trim()).filter(|value| !value.is_empty()) {
        let Some((service, url)) = entry.split_once('=') else {
            return Err(Box::new(RuntimeError::new(
                "worker.config.service_endpoints".into(),
                format!("expected service=url, got '{entry}'"),
            )));
        };
        endpoints.insert(service.trim().to_string(), parse_url("service_endpoints", url)?);
    }
    Ok(endpoints)
}
