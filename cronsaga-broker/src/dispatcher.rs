use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use cronsaga_comm::{ChannelMessage, SagaStepMessage, SagaStepOutcome, TaskDispatch};
use cronsaga_models::core::CorrelationId;
use cronsaga_utilities::ComponentLogger;
use serde_json::Value;
use thiserror::Error;
use tokio::time;
use uuid::Uuid;

use crate::{Broker, BrokerError, BrokerMessage, ConnectionHandle};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Result of a publish the broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    Published { dedupe_key: String },
    /// A message with the same dedupe key is already queued or in flight.
    AlreadyQueued { dedupe_key: String },
}

impl Acknowledgement {
    pub fn dedupe_key(&self) -> &str {
        match self {
            Acknowledgement::Published { dedupe_key }
            | Acknowledgement::AlreadyQueued { dedupe_key } => dedupe_key,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub task_queue: String,
    pub saga_queue: String,
    pub publish_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            task_queue: "tasks".into(),
            saga_queue: "saga-steps".into(),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

/// Publishes work onto the durable channel.
///
/// A publish only returns `Ok` once the broker has accepted the message.
/// Publishing while the connection monitor reports the broker as down fails
/// immediately instead of waiting.
#[derive(Clone)]
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    connection: ConnectionHandle,
    settings: DispatchSettings,
    logger: ComponentLogger,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        connection: ConnectionHandle,
        settings: DispatchSettings,
        logger: ComponentLogger,
    ) -> Self {
        Self {
            broker,
            connection,
            settings,
            logger,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub async fn dispatch(
        &self,
        task_id: Uuid,
        payload: Value,
        fired_at: DateTime<Utc>,
        correlation_id: CorrelationId,
    ) -> Result<Acknowledgement, DispatchError> {
        let body = ChannelMessage::TaskDispatch(TaskDispatch {
            task_id,
            payload,
            fired_at,
            correlation_id,
        });
        let queue = self.settings.task_queue.clone();
        self.publish(queue, body).await
    }

    pub async fn dispatch_saga_step(
        &self,
        step: SagaStepMessage,
    ) -> Result<Acknowledgement, DispatchError> {
        let queue = self.settings.saga_queue.clone();
        self.publish(queue, ChannelMessage::SagaStep(step)).await
    }

    pub async fn publish_outcome(
        &self,
        reply_to: &str,
        outcome: SagaStepOutcome,
    ) -> Result<Acknowledgement, DispatchError> {
        self.publish(reply_to.to_string(), ChannelMessage::SagaOutcome(outcome))
            .await
    }

    async fn publish(
        &self,
        queue: String,
        body: ChannelMessage,
    ) -> Result<Acknowledgement, DispatchError> {
        let correlation = body.correlation_id();
        let kind = body.kind();

        if !self.connection.is_available() {
            let status = self.connection.status();
            self.logger.warn(
                Some(&correlation),
                format_args!("Not publishing {} to {}: broker is {:?}", kind, queue, status),
            );
            return Err(DispatchError::Unavailable(format!("{status:?}")));
        }

        let message = BrokerMessage::new(queue.clone(), body);
        let dedupe_key = message.dedupe_key_or_derived();
        let timeout = self.settings.publish_timeout;

        match time::timeout(timeout, self.broker.publish(message)).await {
            Ok(Ok(())) => {
                self.logger.debug(
                    Some(&correlation),
                    format_args!("Published {} to {} (key {})", kind, queue, dedupe_key),
                );
                Ok(Acknowledgement::Published { dedupe_key })
            }
            Ok(Err(BrokerError::Duplicate(_))) => {
                self.logger.info(
                    Some(&correlation),
                    format_args!("{} already queued on {} (key {})", kind, queue, dedupe_key),
                );
                Ok(Acknowledgement::AlreadyQueued { dedupe_key })
            }
            Ok(Err(err)) => {
                self.logger.error(
                    Some(&correlation),
                    format_args!("Failed to publish {} to {}: {}", kind, queue, err),
                );
                Err(err.into())
            }
            Err(_) => {
                self.logger.error(
                    Some(&correlation),
                    format_args!("Publishing {} to {} timed out after {:?}", kind, queue, timeout),
                );
                Err(DispatchError::Timeout(timeout))
            }
        }
    }
}
