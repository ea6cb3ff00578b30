use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use cronsaga_broker::BrokerDelivery;
use cronsaga_comm::{ChannelMessage, MessageKind};
use cronsaga_models::core::CorrelationId;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Worth another attempt: the message goes back on the queue.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Business-level failure: the message is dead-lettered.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

/// Broker metadata handed to a handler alongside the message body.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub delivery_id: Uuid,
    pub queue: String,
    pub dedupe_key: String,
    pub attempt: u32,
    pub correlation_id: CorrelationId,
}

impl DeliveryContext {
    pub fn from_delivery(delivery: &BrokerDelivery) -> Self {
        Self {
            delivery_id: delivery.delivery_id,
            queue: delivery.queue.clone(),
            dedupe_key: delivery.dedupe_key.clone(),
            attempt: delivery.attempt,
            correlation_id: delivery.body.correlation_id(),
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &ChannelMessage, context: &DeliveryContext) -> Result<(), HandlerError>;
}

/// Message kind to handler mapping, fixed before the consumer starts.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageKind, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any handler previously registered for `kind`.
    pub fn register(&mut self, kind: MessageKind, handler: Arc<dyn MessageHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn resolve(&self, kind: MessageKind) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<MessageKind> {
        self.handlers.keys().copied().collect()
    }
}
