pub mod connection;
pub mod dispatcher;
pub mod durable;
mod errors;
pub mod http;
pub mod in_memory;
mod types;

pub use connection::{ConnectionHandle, ConnectionMonitor, ConnectionSettings, ConnectionStatus};
pub use dispatcher::{Acknowledgement, DispatchError, DispatchSettings, Dispatcher};
pub use errors::BrokerError;
pub use types::{BrokerDelivery, BrokerMessage, BrokerSettings, DeadLetter, MAX_DELIVERIES_REASON};

use async_trait::async_trait;

/// Trait implemented by queue backends capable of delivering channel messages.
///
/// Delivery is at-least-once: a delivery that is neither acked, nacked nor
/// rejected before its lease expires is handed to another consumer.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Persist a message. Fails with [`BrokerError::Duplicate`] while another
    /// message with the same dedupe key is still queued or in flight.
    async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError>;

    /// Lease the next message on `queue` for `consumer`. Returns `None` when
    /// the queue stays empty or the consumer already holds its prefetch limit.
    async fn poll(&self, queue: &str, consumer: &str) -> Result<Option<BrokerDelivery>, BrokerError>;

    /// Acknowledge successful processing of a delivery.
    async fn ack(&self, consumer: &str, delivery_id: uuid::Uuid) -> Result<(), BrokerError>;

    /// Return the delivery to the queue for another attempt.
    async fn nack(&self, consumer: &str, delivery_id: uuid::Uuid) -> Result<(), BrokerError>;

    /// Route the delivery to the dead-letter path; it is never redelivered.
    async fn reject(
        &self,
        consumer: &str,
        delivery_id: uuid::Uuid,
        reason: &str,
    ) -> Result<(), BrokerError>;

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, BrokerError>;

    /// Cheap liveness check used by the connection monitor.
    async fn heartbeat(&self) -> Result<(), BrokerError>;
}
