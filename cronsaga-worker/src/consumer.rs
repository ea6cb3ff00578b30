use std::{sync::Arc, time::Duration};

use cronsaga_broker::{Broker, BrokerDelivery, BrokerError};
use cronsaga_utilities::ComponentLogger;
use thiserror::Error;
use tokio::{
    sync::{Notify, Semaphore},
    task::JoinSet,
    time,
};

use crate::{
    handler::{DeliveryContext, HandlerError, HandlerRegistry},
    idempotency::IdempotencyStore,
};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("broker {operation} failed: {source}")]
    Broker {
        operation: &'static str,
        #[source]
        source: BrokerError,
    },
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue: String,
    pub consumer_id: String,
    /// Deliveries processed concurrently by this consumer.
    pub prefetch: usize,
    /// Pause after an empty or failed poll.
    pub idle_backoff: Duration,
    pub handler_timeout: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            queue: "tasks".into(),
            consumer_id: "worker".into(),
            prefetch: 10,
            idle_backoff: Duration::from_millis(500),
            handler_timeout: Duration::from_secs(60),
        }
    }
}

/// How a delivery was settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    /// Already processed under this dedupe key; acked without running the handler.
    Duplicate,
    Requeued,
    DeadLettered,
}

/// Pulls deliveries off one queue and routes them to registered handlers.
#[derive(Clone)]
pub struct Consumer {
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    idempotency: Arc<dyn IdempotencyStore>,
    settings: ConsumerSettings,
    logger: ComponentLogger,
}

impl Consumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: HandlerRegistry,
        idempotency: Arc<dyn IdempotencyStore>,
        settings: ConsumerSettings,
        logger: ComponentLogger,
    ) -> Self {
        Self {
            broker,
            registry: Arc::new(registry),
            idempotency,
            settings,
            logger,
        }
    }

    /// Polls until `shutdown` is notified, then waits for every in-flight
    /// delivery to be acked or nacked before returning. A poll already in
    /// progress is allowed to finish and its delivery is processed.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        let shutdown = shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();

        let permits = Arc::new(Semaphore::new(self.settings.prefetch.max(1)));
        let mut inflight = JoinSet::new();
        self.logger.info(
            None,
            format_args!(
                "Consuming {} as {} (prefetch {})",
                self.settings.queue, self.settings.consumer_id, self.settings.prefetch
            ),
        );

        loop {
            while let Some(joined) = inflight.try_join_next() {
                if let Err(err) = joined {
                    self.logger
                        .error(None, format_args!("Delivery task join error: {}", err));
                }
            }

            let permit = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // not raced against shutdown: a lease granted mid-poll must be settled
            let polled = self
                .broker
                .poll(&self.settings.queue, &self.settings.consumer_id)
                .await;

            match polled {
                Ok(Some(delivery)) => {
                    let consumer = self.clone();
                    inflight.spawn(async move {
                        let _permit = permit;
                        let delivery_id = delivery.delivery_id;
                        let correlation = delivery.body.correlation_id();
                        if let Err(err) = consumer.process_delivery(delivery).await {
                            consumer.logger.error(
                                Some(&correlation),
                                format_args!("Delivery {} not settled: {}", delivery_id, err),
                            );
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = time::sleep(self.settings.idle_backoff) => {}
                    }
                }
                Err(err) => {
                    drop(permit);
                    self.logger.warn(
                        None,
                        format_args!("Polling {} failed: {}", self.settings.queue, err),
                    );
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = time::sleep(self.settings.idle_backoff) => {}
                    }
                }
            }
        }

        self.logger.info(
            None,
            format_args!("Draining {} in-flight delivery(ies)", inflight.len()),
        );
        while let Some(joined) = inflight.join_next().await {
            if let Err(err) = joined {
                self.logger
                    .error(None, format_args!("Delivery task join error: {}", err));
            }
        }
        self.logger
            .info(None, format_args!("Consumer {} stopped", self.settings.consumer_id));
    }

    /// Runs the handler for one delivery and settles it with the broker.
    pub async fn process_delivery(&self, delivery: BrokerDelivery) -> Result<Disposition, ConsumerError> {
        let context = DeliveryContext::from_delivery(&delivery);
        let correlation = context.correlation_id;
        let kind = delivery.body.kind();

        if self.idempotency.contains(&delivery.dedupe_key).await {
            self.logger.info(
                Some(&correlation),
                format_args!(
                    "Skipping duplicate {} (key {}, attempt {})",
                    kind, delivery.dedupe_key, delivery.attempt
                ),
            );
            self.ack(&delivery).await?;
            return Ok(Disposition::Duplicate);
        }

        let Some(handler) = self.registry.resolve(kind) else {
            let reason = format!("no handler registered for {kind}");
            self.logger.error(Some(&correlation), format_args!("{}", reason));
            self.reject(&delivery, &reason).await?;
            return Ok(Disposition::DeadLettered);
        };

        let outcome = time::timeout(
            self.settings.handler_timeout,
            handler.handle(&delivery.body, &context),
        )
        .await
        .unwrap_or_else(|_| {
            Err(HandlerError::Transient(format!(
                "handler timed out after {:?}",
                self.settings.handler_timeout
            )))
        });

        match outcome {
            Ok(()) => {
                self.idempotency.remember(&delivery.dedupe_key).await;
                self.ack(&delivery).await?;
                self.logger.debug(
                    Some(&correlation),
                    format_args!("Processed {} (attempt {})", kind, delivery.attempt),
                );
                Ok(Disposition::Acked)
            }
            Err(HandlerError::Transient(reason)) => {
                self.logger.warn(
                    Some(&correlation),
                    format_args!(
                        "{} failed on attempt {}, requeueing: {}",
                        kind, delivery.attempt, reason
                    ),
                );
                self.broker
                    .nack(&self.settings.consumer_id, delivery.delivery_id)
                    .await
                    .map_err(|source| ConsumerError::Broker {
                        operation: "nack",
                        source,
                    })?;
                Ok(Disposition::Requeued)
            }
            Err(HandlerError::Permanent(reason)) => {
                self.logger.error(
                    Some(&correlation),
                    format_args!("{} rejected, dead-lettering: {}", kind, reason),
                );
                self.reject(&delivery, &reason).await?;
                Ok(Disposition::DeadLettered)
            }
        }
    }

    async fn ack(&self, delivery: &BrokerDelivery) -> Result<(), ConsumerError> {
        self.broker
            .ack(&self.settings.consumer_id, delivery.delivery_id)
            .await
            .map_err(|source| ConsumerError::Broker {
                operation: "ack",
                source,
            })
    }

    async fn reject(&self, delivery: &BrokerDelivery, reason: &str) -> Result<(), ConsumerError> {
        self.broker
            .reject(&self.settings.consumer_id, delivery.delivery_id, reason)
            .await
            .map_err(|source| ConsumerError::Broker {
                operation: "reject",
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use cronsaga_broker::{BrokerMessage, BrokerSettings, DeadLetter, in_memory::InMemoryBroker};
    use cronsaga_comm::{ChannelMessage, MessageKind, TaskDispatch};
    use cronsaga_models::core::CorrelationId;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::{handler::MessageHandler, idempotency::InMemoryIdempotencyStore};

    /// Counts effects and fails according to `mode`.
    struct RecordingHandler {
        effects: AtomicUsize,
        mode: Option<HandlerError>,
        delay: Duration,
    }

    impl RecordingHandler {
        fn new(mode: Option<HandlerError>) -> Arc<Self> {
            Arc::new(Self {
                effects: AtomicUsize::new(0),
                mode,
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                effects: AtomicUsize::new(0),
                mode: None,
                delay,
            })
        }

        fn effects(&self) -> usize {
            self.effects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, _message: &ChannelMessage, _context: &DeliveryContext) -> Result<(), HandlerError> {
            if !self.delay.is_zero() {
                time::sleep(self.delay).await;
            }
            match &self.mode {
                Some(err) => Err(err.clone()),
                None => {
                    self.effects.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        }
    }

    /// Hands out deliveries only after a fixed delay, like a long poll.
    struct SlowPollBroker {
        inner: InMemoryBroker,
        delay: Duration,
    }

    #[async_trait]
    impl Broker for SlowPollBroker {
        async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError> {
            self.inner.publish(message).await
        }

        async fn poll(&self, queue: &str, consumer: &str) -> Result<Option<BrokerDelivery>, BrokerError> {
            let delivery = self.inner.poll(queue, consumer).await;
            time::sleep(self.delay).await;
            delivery
        }

        async fn ack(&self, consumer: &str, delivery_id: Uuid) -> Result<(), BrokerError> {
            self.inner.ack(consumer, delivery_id).await
        }

        async fn nack(&self, consumer: &str, delivery_id: Uuid) -> Result<(), BrokerError> {
            self.inner.nack(consumer, delivery_id).await
        }

        async fn reject(&self, consumer: &str, delivery_id: Uuid, reason: &str) -> Result<(), BrokerError> {
            self.inner.reject(consumer, delivery_id, reason).await
        }

        async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, BrokerError> {
            self.inner.dead_letters(queue).await
        }

        async fn heartbeat(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn broker() -> InMemoryBroker {
        InMemoryBroker::with_settings(BrokerSettings {
            poll_wait: Duration::from_millis(20),
            redelivery_delay: Duration::ZERO,
            ..BrokerSettings::default()
        })
    }

    fn consumer(broker: &InMemoryBroker, handler: Option<Arc<RecordingHandler>>) -> Consumer {
        let mut registry = HandlerRegistry::new();
        if let Some(handler) = handler {
            registry.register(MessageKind::TaskDispatch, handler);
        }
        Consumer::new(
            Arc::new(broker.clone()),
            registry,
            Arc::new(InMemoryIdempotencyStore::default()),
            ConsumerSettings {
                idle_backoff: Duration::from_millis(10),
                handler_timeout: Duration::from_secs(5),
                ..ConsumerSettings::default()
            },
            ComponentLogger::new("cronsaga-worker", "consumer"),
        )
    }

    fn dispatch_message() -> BrokerMessage {
        BrokerMessage::new(
            "tasks",
            ChannelMessage::TaskDispatch(TaskDispatch {
                task_id: Uuid::new_v4(),
                payload: json!({"send": "digest"}),
                fired_at: Utc::now(),
                correlation_id: CorrelationId::new(),
            }),
        )
    }

    async fn next_delivery(broker: &InMemoryBroker) -> BrokerDelivery {
        broker.poll("tasks", "worker").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn redelivered_message_has_one_effect() {
        let broker = broker();
        let handler = RecordingHandler::new(None);
        let consumer = consumer(&broker, Some(handler.clone()));
        broker.publish(dispatch_message()).await.unwrap();

        let first = next_delivery(&broker).await;
        let body = first.body.clone();
        assert_eq!(consumer.process_delivery(first).await.unwrap(), Disposition::Acked);

        // the same logical message handed out again after a lost ack
        broker.publish(BrokerMessage::new("tasks", body)).await.unwrap();
        let second = next_delivery(&broker).await;

        assert_eq!(consumer.process_delivery(second).await.unwrap(), Disposition::Duplicate);
        assert_eq!(handler.effects(), 1);
        assert_eq!(broker.depth("tasks"), 0);
    }

    #[tokio::test]
    async fn permanent_failure_is_dead_lettered() {
        let broker = broker();
        let handler = RecordingHandler::new(Some(HandlerError::Permanent("unknown customer".into())));
        let consumer = consumer(&broker, Some(handler));
        broker.publish(dispatch_message()).await.unwrap();

        let delivery = next_delivery(&broker).await;
        assert_eq!(consumer.process_delivery(delivery).await.unwrap(), Disposition::DeadLettered);

        let dead = broker.dead_letters("tasks").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "unknown customer");
        assert_eq!(broker.depth("tasks"), 0);
    }

    #[tokio::test]
    async fn transient_failure_is_requeued() {
        let broker = broker();
        let handler = RecordingHandler::new(Some(HandlerError::Transient("503".into())));
        let consumer = consumer(&broker, Some(handler));
        broker.publish(dispatch_message()).await.unwrap();

        let delivery = next_delivery(&broker).await;
        assert_eq!(consumer.process_delivery(delivery).await.unwrap(), Disposition::Requeued);

        let again = next_delivery(&broker).await;
        assert_eq!(again.attempt, 2);
        assert!(broker.dead_letters("tasks").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn message_without_handler_is_dead_lettered() {
        let broker = broker();
        let consumer = consumer(&broker, None);
        broker.publish(dispatch_message()).await.unwrap();

        let delivery = next_delivery(&broker).await;
        assert_eq!(consumer.process_delivery(delivery).await.unwrap(), Disposition::DeadLettered);
        assert_eq!(broker.dead_letters("tasks").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_deliveries() {
        let broker = broker();
        let handler = RecordingHandler::slow(Duration::from_millis(200));
        let consumer = consumer(&broker, Some(handler.clone()));
        for _ in 0..3 {
            broker.publish(dispatch_message()).await.unwrap();
        }
        let shutdown = Arc::new(Notify::new());

        let running = {
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run(shutdown).await })
        };

        time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_waiters();
        running.await.unwrap();

        assert_eq!(handler.effects(), 3);
        assert_eq!(broker.depth("tasks"), 0);
    }

    #[tokio::test]
    async fn delivery_leased_during_shutdown_is_still_processed() {
        let inner = broker();
        let handler = RecordingHandler::new(None);
        let mut registry = HandlerRegistry::new();
        registry.register(MessageKind::TaskDispatch, handler.clone());
        let consumer = Consumer::new(
            Arc::new(SlowPollBroker {
                inner: inner.clone(),
                delay: Duration::from_millis(100),
            }),
            registry,
            Arc::new(InMemoryIdempotencyStore::default()),
            ConsumerSettings {
                idle_backoff: Duration::from_millis(10),
                ..ConsumerSettings::default()
            },
            ComponentLogger::new("cronsaga-worker", "consumer"),
        );
        inner.publish(dispatch_message()).await.unwrap();
        let shutdown = Arc::new(Notify::new());

        let running = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run(shutdown).await })
        };

        // the lease is already granted, the poll has not returned yet
        time::sleep(Duration::from_millis(30)).await;
        shutdown.notify_waiters();
        running.await.unwrap();

        assert_eq!(handler.effects(), 1);
        assert_eq!(inner.depth("tasks"), 0);
        assert!(inner.dead_letters("tasks").await.unwrap().is_empty());
    }
}
