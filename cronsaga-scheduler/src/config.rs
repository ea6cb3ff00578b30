use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use cronsaga_broker::ConnectionSettings;
use cronsaga_models::errors::{RuntimeError, SendableError};
use cronsaga_utilities::logger::{parse_level, LoggerSettings};
use reqwest::Url;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "cronsaga-scheduler",
    version,
    about = "Cron task scheduler and saga coordinator"
)]
pub struct Cli {
    #[arg(long, global = true, env = "CRONSAGA_DB", default_value = "cronsaga.db")]
    pub database_path: String,

    #[arg(
        long,
        global = true,
        env = "CRONSAGA_BROKER_ENDPOINT",
        default_value = "http://127.0.0.1:7070/"
    )]
    pub broker_endpoint: String,

    #[arg(long, global = true, env = "CRONSAGA_BROKER_POLL_TIMEOUT_SECONDS", default_value_t = 5)]
    pub broker_poll_timeout_seconds: u64,

    #[arg(long, global = true, env = "CRONSAGA_TASK_QUEUE", default_value = "tasks")]
    pub task_queue: String,

    #[arg(long, global = true, env = "CRONSAGA_SAGA_QUEUE", default_value = "saga-steps")]
    pub saga_queue: String,

    #[arg(long, global = true, env = "CRONSAGA_OUTCOME_QUEUE", default_value = "saga-outcomes")]
    pub outcome_queue: String,

    #[arg(long, global = true, env = "CRONSAGA_CONSUMER_ID")]
    pub consumer_id: Option<String>,

    #[arg(long, global = true, env = "CRONSAGA_PREFETCH", default_value_t = 10)]
    pub prefetch: usize,

    #[arg(long, global = true, env = "CRONSAGA_TICK_SECONDS", default_value_t = 60)]
    pub tick_interval_seconds: u64,

    #[arg(long, global = true, env = "CRONSAGA_BATCH_SIZE", default_value_t = 100)]
    pub batch_size: usize,

    #[arg(long, global = true, env = "CRONSAGA_SAGA_SWEEP_SECONDS", default_value_t = 30)]
    pub saga_sweep_seconds: u64,

    /// Seconds a saga action may go without an outcome before it is failed.
    #[arg(long, global = true, env = "CRONSAGA_STEP_TIMEOUT_SECONDS", default_value_t = 900)]
    pub step_timeout_seconds: u64,

    #[arg(long, global = true, env = "CRONSAGA_PUBLISH_TIMEOUT_SECONDS", default_value_t = 5)]
    pub publish_timeout_seconds: u64,

    #[arg(long, global = true, env = "CRONSAGA_HEARTBEAT_SECONDS", default_value_t = 10)]
    pub heartbeat_interval_seconds: u64,

    #[arg(long, global = true, env = "CRONSAGA_RECONNECT_SECONDS", default_value_t = 2)]
    pub reconnect_interval_seconds: u64,

    #[arg(long, global = true, env = "CRONSAGA_MAX_RECONNECT_ATTEMPTS", default_value_t = 30)]
    pub max_reconnect_attempts: u32,

    #[arg(long, global = true, env = "CRONSAGA_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, global = true, env = "CRONSAGA_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Run the scheduler loop and the saga coordinator (default).
    Run,
    /// Register a new task.
    Register {
        name: String,
        cron_expression: String,
        /// JSON payload handed to workers on every fire.
        #[arg(long, default_value = "null")]
        payload: String,
    },
    /// Change a task's name, schedule, payload or active flag.
    Update {
        id: Uuid,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        cron_expression: Option<String>,
        #[arg(long)]
        payload: Option<String>,
        #[arg(long)]
        active: Option<bool>,
    },
    /// Soft-delete a task.
    Deactivate {
        id: Uuid,
        #[arg(long, default_value = "deactivated by operator")]
        reason: String,
    },
    /// Show active tasks.
    List,
    /// Start a saga from a JSON definition file.
    StartSaga { definition: PathBuf },
    /// Show sagas halted by a failed compensation.
    StuckSagas,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub broker_endpoint: Url,
    pub broker_poll_timeout: Duration,
    pub task_queue: String,
    pub saga_queue: String,
    pub outcome_queue: String,
    pub consumer_id: String,
    pub prefetch: usize,
    pub tick_interval: Duration,
    pub batch_size: usize,
    pub saga_sweep_interval: Duration,
    pub step_timeout: Duration,
    pub publish_timeout: Duration,
    pub connection: ConnectionSettings,
    pub logger: LoggerSettings,
}

pub fn parse_config() -> Result<(Config, Commands), SendableError> {
    let cli = Cli::try_parse()?;
    let command = cli.command.clone().unwrap_or(Commands::Run);
    Ok((Config::from_cli(cli)?, command))
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, SendableError> {
        let broker_endpoint = Url::parse(cli.broker_endpoint.trim()).map_err(|err| -> SendableError {
            Box::new(RuntimeError::new(
                "scheduler.broker.invalid_endpoint".into(),
                format!("'{}' is not a valid URL: {}", cli.broker_endpoint, err),
            ))
        })?;

        let consumer_id = match cli.consumer_id {
            Some(ref value) if !value.trim().is_empty() => value.trim().to_string(),
            _ => format!("scheduler-{}", Uuid::new_v4()),
        };

        Ok(Config {
            database_path: cli.database_path,
            broker_endpoint,
            broker_poll_timeout: Duration::from_secs(cli.broker_poll_timeout_seconds.max(1)),
            task_queue: cli.task_queue,
            saga_queue: cli.saga_queue,
            outcome_queue: cli.outcome_queue,
            consumer_id,
            prefetch: cli.prefetch.max(1),
            tick_interval: Duration::from_secs(cli.tick_interval_seconds.max(1)),
            batch_size: cli.batch_size.max(1),
            saga_sweep_interval: Duration::from_secs(cli.saga_sweep_seconds.max(1)),
            step_timeout: Duration::from_secs(cli.step_timeout_seconds.max(1)),
            publish_timeout: Duration::from_secs(cli.publish_timeout_seconds.max(1)),
            connection: ConnectionSettings {
                heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_seconds.max(1)),
                reconnect_interval: Duration::from_secs(cli.reconnect_interval_seconds.max(1)),
                max_reconnect_attempts: cli.max_reconnect_attempts,
                ..ConnectionSettings::default()
            },
            logger: LoggerSettings {
                level: parse_level(&cli.log_level)?,
                file: cli.log_file,
            },
        })
    }
}

/// Parses a JSON document given on the command line.
pub fn parse_payload(field: &str, value: &str) -> Result<serde_json::Value, SendableError> {
    serde_json::from_str(value).map_err(|err| -> SendableError {
        Box::new(RuntimeError::new(
            format!("scheduler.config.{field}"),
            format!("'{value}' is not valid JSON: {err}"),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_run_with_sane_settings() {
        let cli = Cli::try_parse_from(["cronsaga-scheduler"]).unwrap();
        assert!(cli.command.is_none());

        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert_eq!(config.outcome_queue, "saga-outcomes");
        assert_eq!(config.saga_sweep_interval, Duration::from_secs(30));
        assert_eq!(config.step_timeout, Duration::from_secs(900));
        assert!(config.consumer_id.starts_with("scheduler-"));
    }

    #[test]
    fn register_takes_positional_name_and_expression() {
        let cli = Cli::try_parse_from([
            "cronsaga-scheduler",
            "register",
            "nightly-report",
            "0 2 * * *",
            "--payload",
            r#"{"report":"daily"}"#,
        ])
        .unwrap();

        match cli.command {
            Some(Commands::Register {
                name,
                cron_expression,
                payload,
            }) => {
                assert_eq!(name, "nightly-report");
                assert_eq!(cron_expression, "0 2 * * *");
                assert_eq!(parse_payload("payload", &payload).unwrap()["report"], "daily");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        let cli = Cli::try_parse_from(["cronsaga-scheduler", "--broker-endpoint", "not a url"]).unwrap();
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn bad_payload_is_rejected() {
        assert!(parse_payload("payload", "{nope").is_err());
    }
}
