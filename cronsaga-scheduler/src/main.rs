use std::sync::Arc;

use chrono::Utc;
use cronsaga_broker::{
    http::client::HttpBroker, Broker, ConnectionHandle, ConnectionMonitor, ConnectionStatus,
    DispatchSettings, Dispatcher,
};
use cronsaga_comm::MessageKind;
use cronsaga_database::sqlite::SqliteDb;
use cronsaga_models::{
    core::{NewTask, TaskUpdate},
    errors::{RuntimeError, SendableError},
};
use cronsaga_saga::{CoordinatorSettings, SagaCoordinator, SagaDefinition, SagaOutcomeHandler};
use cronsaga_scheduler::{
    config::{parse_config, parse_payload, Commands, Config},
    CronCalculator, Scheduler, SchedulerSettings, TaskRegistry,
};
use cronsaga_utilities::{startup, ComponentLogger};
use cronsaga_worker::{
    Consumer, ConsumerSettings, HandlerRegistry, IdempotencyStore, InMemoryIdempotencyStore,
};
use log::{error, info};
use tokio::sync::Notify;

const SERVICE: &str = "cronsaga-scheduler";

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let (config, command) = parse_config()?;
    startup::startup("Cronsaga Scheduler", &config.logger)?;

    info!("Opening task database {}", config.database_path);
    let db = Arc::new(SqliteDb::new(&config.database_path).await?);
    let logger = ComponentLogger::new(SERVICE, "scheduler");

    match command {
        Commands::Run => run(&config, db, logger).await?,
        Commands::Register {
            name,
            cron_expression,
            payload,
        } => {
            let registry = TaskRegistry::new(db, CronCalculator::new(), logger.child("registry"));
            let task = registry
                .register(
                    NewTask {
                        name,
                        cron_expression,
                        payload: parse_payload("payload", &payload)?,
                    },
                    Utc::now(),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        Commands::Update {
            id,
            name,
            cron_expression,
            payload,
            active,
        } => {
            let payload = match payload {
                Some(value) => Some(parse_payload("payload", &value)?),
                None => None,
            };
            let registry = TaskRegistry::new(db, CronCalculator::new(), logger.child("registry"));
            let task = registry
                .update(
                    id,
                    TaskUpdate {
                        name,
                        cron_expression,
                        payload,
                        is_active: active,
                    },
                    Utc::now(),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        Commands::Deactivate { id, reason } => {
            let registry = TaskRegistry::new(db, CronCalculator::new(), logger.child("registry"));
            let task = registry.deactivate(id, &reason, Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        Commands::List => {
            let registry = TaskRegistry::new(db, CronCalculator::new(), logger.child("registry"));
            for task in registry.list_active().await? {
                println!(
                    "{}  {:<24} {:<16} next {}",
                    task.id, task.name, task.cron_expression, task.next_run_at
                );
            }
        }
        Commands::StartSaga { definition } => {
            let raw = tokio::fs::read_to_string(&definition).await?;
            let definition: SagaDefinition = serde_json::from_str(&raw)?;
            let broker = build_broker(&config)?;
            let coordinator = coordinator(
                &config,
                db,
                dispatcher(&config, broker, ConnectionMonitor::always_connected(), &logger),
                &logger,
            );
            let saga = coordinator.start(definition).await?;
            println!("{}", serde_json::to_string_pretty(&saga)?);
        }
        Commands::StuckSagas => {
            let broker = build_broker(&config)?;
            let coordinator = coordinator(
                &config,
                db,
                dispatcher(&config, broker, ConnectionMonitor::always_connected(), &logger),
                &logger,
            );
            for saga in coordinator.requiring_intervention().await? {
                println!("{}  {}  created {}", saga.saga_id, saga.transaction_type, saga.created_at);
            }
        }
    }

    Ok(())
}

async fn run(config: &Config, db: Arc<SqliteDb>, logger: ComponentLogger) -> Result<(), SendableError> {
    let broker = build_broker(config)?;
    let shutdown = Arc::new(Notify::new());

    let (connection, mut monitor) = ConnectionMonitor::spawn(
        broker.clone(),
        config.connection.clone(),
        logger.child("connection-monitor"),
        shutdown.clone(),
    );
    let dispatcher = dispatcher(config, broker.clone(), connection, &logger);

    let coordinator = Arc::new(coordinator(config, db.clone(), dispatcher.clone(), &logger));
    match coordinator.resume_all().await {
        Ok(count) => info!("Checked {} unfinished saga(s) for undispatched steps", count),
        Err(err) => error!("Unable to resume sagas: {}", err),
    }

    let mut handlers = HandlerRegistry::new();
    handlers.register(
        MessageKind::SagaOutcome,
        Arc::new(SagaOutcomeHandler::new(coordinator.clone())),
    );
    let idempotency: Arc<dyn IdempotencyStore> = Arc::new(InMemoryIdempotencyStore::default());
    let consumer = Consumer::new(
        broker,
        handlers,
        idempotency,
        ConsumerSettings {
            queue: config.outcome_queue.clone(),
            consumer_id: format!("{}:{}", config.consumer_id, config.outcome_queue),
            prefetch: config.prefetch,
            ..ConsumerSettings::default()
        },
        logger.child("outcome-consumer"),
    );

    let scheduler = Scheduler::new(
        db,
        dispatcher,
        CronCalculator::new(),
        SchedulerSettings {
            tick_interval: config.tick_interval,
            batch_size: config.batch_size,
        },
        logger.child("scheduler-loop"),
    );

    info!("Starting scheduler loop, saga sweep and saga outcome consumer");
    let scheduler_shutdown = shutdown.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });
    let consumer_shutdown = shutdown.clone();
    let consumer_task = tokio::spawn(async move { consumer.run(consumer_shutdown).await });
    let sweep_shutdown = shutdown.clone();
    let sweep_interval = config.saga_sweep_interval;
    let sweep_task =
        tokio::spawn(async move { coordinator.run(sweep_shutdown, sweep_interval).await });

    let monitor_status = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.expect("Failed to listen for Ctrl+C");
            info!("Received shutdown signal. Shutting down...");
            shutdown.notify_waiters();
            monitor.await
        }
        status = &mut monitor => {
            error!("Connection monitor stopped. Shutting down...");
            shutdown.notify_waiters();
            status
        }
    };

    if let Err(e) = tokio::try_join!(scheduler_task, consumer_task, sweep_task) {
        error!("Error while shutting down scheduler: {:?}", e);
    }
    match monitor_status {
        Ok(ConnectionStatus::Exhausted) => {
            return Err(Box::new(RuntimeError::new(
                "scheduler.broker.exhausted".into(),
                format!(
                    "broker unreachable after {} reconnect attempt(s)",
                    config.connection.max_reconnect_attempts
                ),
            )));
        }
        Ok(status) => info!("Connection monitor finished as {:?}", status),
        Err(err) => error!("Connection monitor join error: {}", err),
    }

    info!("Scheduler shutdown complete.");
    Ok(())
}

fn build_broker(config: &Config) -> Result<Arc<dyn Broker>, SendableError> {
    let client = reqwest::Client::builder()
        .build()
        .map_err(|err| -> SendableError {
            Box::new(RuntimeError::new(
                "scheduler.broker.client".into(),
                err.to_string(),
            ))
        })?;
    Ok(Arc::new(HttpBroker::new(
        config.broker_endpoint.clone(),
        client,
        config.broker_poll_timeout,
    )))
}

fn dispatcher(
    config: &Config,
    broker: Arc<dyn Broker>,
    connection: ConnectionHandle,
    logger: &ComponentLogger,
) -> Dispatcher {
    Dispatcher::new(
        broker,
        connection,
        DispatchSettings {
            task_queue: config.task_queue.clone(),
            saga_queue: config.saga_queue.clone(),
            publish_timeout: config.publish_timeout,
        },
        logger.child("dispatcher"),
    )
}

fn coordinator(
    config: &Config,
    db: Arc<SqliteDb>,
    dispatcher: Dispatcher,
    logger: &ComponentLogger,
) -> SagaCoordinator<SqliteDb> {
    SagaCoordinator::new(
        db,
        dispatcher,
        CoordinatorSettings {
            reply_to: config.outcome_queue.clone(),
            step_timeout: config.step_timeout,
            ..CoordinatorSettings::default()
        },
        logger.child("saga-coordinator"),
    )
}
