mod config;

use std::sync::Arc;

use config::{Config, parse_config};
use cronsaga_broker::{
    Broker, ConnectionMonitor, ConnectionStatus, DispatchSettings, Dispatcher,
    http::client::HttpBroker,
};
use cronsaga_comm::MessageKind;
use cronsaga_models::errors::{RuntimeError, SendableError};
use cronsaga_utilities::{ComponentLogger, startup};
use cronsaga_worker::{
    Consumer, ConsumerSettings, HandlerRegistry, HttpTaskHandler, IdempotencyStore,
    InMemoryIdempotencyStore, SagaStepHandler,
};
use log::{error, info};
use tokio::sync::Notify;

const SERVICE: &str = "cronsaga-worker";

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let config = parse_config()?;
    startup::startup("Cronsaga Worker", &config.logger)?;
    info!("Consumer ID: {}", config.consumer_id);

    let logger = ComponentLogger::new(SERVICE, "worker");
    let http = reqwest::Client::builder()
        .build()
        .map_err(|err| -> SendableError {
            Box::new(RuntimeError::new("worker.http.client".into(), err.to_string()))
        })?;
    let broker: Arc<dyn Broker> = Arc::new(HttpBroker::new(
        config.broker_endpoint.clone(),
        http.clone(),
        config.broker_poll_timeout,
    ));

    let shutdown = Arc::new(Notify::new());
    let (connection, mut monitor) = ConnectionMonitor::spawn(
        broker.clone(),
        config.connection.clone(),
        logger.child("connection-monitor"),
        shutdown.clone(),
    );
    let dispatcher = Dispatcher::new(
        broker.clone(),
        connection,
        DispatchSettings {
            task_queue: config.task_queue.clone(),
            saga_queue: config.saga_queue.clone(),
            publish_timeout: config.publish_timeout,
        },
        logger.child("dispatcher"),
    );

    if config.task_webhook.is_none() {
        info!("No task webhook configured; fired tasks are only logged");
    }
    for (service, url) in &config.service_endpoints {
        info!("Saga service {} -> {}", service, url);
    }

    let mut registry = HandlerRegistry::new();
    registry
        .register(
            MessageKind::TaskDispatch,
            Arc::new(HttpTaskHandler::new(
                http.clone(),
                config.task_webhook.clone(),
                logger.child("task-handler"),
            )),
        )
        .register(
            MessageKind::SagaStep,
            Arc::new(SagaStepHandler::new(
                http.clone(),
                config.service_endpoints.clone(),
                dispatcher,
                logger.child("saga-step-handler"),
            )
            .with_max_attempts(config.max_deliveries)),
        );

    let idempotency: Arc<dyn IdempotencyStore> = Arc::new(InMemoryIdempotencyStore::default());
    let consumers = [config.task_queue.clone(), config.saga_queue.clone()]
        .into_iter()
        .map(|queue| {
            let consumer = Consumer::new(
                broker.clone(),
                registry.clone(),
                idempotency.clone(),
                consumer_settings(&config, queue),
                logger.child("consumer"),
            );
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run(shutdown).await })
        })
        .collect::<Vec<_>>();

    let monitor_status = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.expect("Failed to listen for Ctrl+C");
            info!("Shutdown signal received. Draining in-flight deliveries...");
            shutdown.notify_waiters();
            monitor.await
        }
        status = &mut monitor => {
            error!("Connection monitor stopped. Draining in-flight deliveries...");
            shutdown.notify_waiters();
            status
        }
    };

    for consumer in consumers {
        if let Err(err) = consumer.await {
            error!("Consumer task join error: {}", err);
        }
    }
    match monitor_status {
        Ok(ConnectionStatus::Exhausted) => {
            return Err(Box::new(RuntimeError::new(
                "worker.broker.exhausted".into(),
                format!(
                    "broker unreachable after {} reconnect attempt(s)",
                    config.connection.max_reconnect_attempts
                ),
            )) as SendableError);
        }
        Ok(status) => info!("Connection monitor finished as {:?}", status),
        Err(err) => error!("Connection monitor join error: {}", err),
    }

    info!("Worker shutdown complete.");
    Ok(())
}

fn consumer_settings(config: &Config, queue: String) -> ConsumerSettings {
    ConsumerSettings {
        consumer_id: format!("{}:{}", config.consumer_id, queue),
        queue,
        prefetch: config.prefetch,
        idle_backoff: config.idle_backoff,
        handler_timeout: config.handler_timeout,
    }
}
