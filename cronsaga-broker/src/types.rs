use chrono::{DateTime, Utc};
use cronsaga_comm::ChannelMessage;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Payload delivered through the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub queue: String,
    pub body: ChannelMessage,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    #[serde(default = "utc_now")]
    pub enqueued_at: DateTime<Utc>,
}

/// Message returned when polling the broker. Every lease gets a fresh
/// `delivery_id`, so an ack from a consumer whose lease expired is refused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerDelivery {
    pub delivery_id: Uuid,
    pub queue: String,
    pub body: ChannelMessage,
    pub dedupe_key: String,
    pub enqueued_at: DateTime<Utc>,
    /// 1 on first delivery.
    pub attempt: u32,
}

/// A message routed off the live queue instead of being redelivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub delivery: BrokerDelivery,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Delivery discipline shared by the broker backends.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Unacknowledged deliveries a single consumer may hold.
    pub prefetch: usize,
    /// Lease length; an unacknowledged delivery is redelivered after this.
    pub visibility_timeout: Duration,
    /// Deliveries after which a message is dead-lettered instead of requeued.
    pub max_deliveries: u32,
    /// How long `poll` waits for work before returning `None`.
    pub poll_wait: Duration,
    /// Wait before a nacked delivery is offered again; doubles per attempt.
    pub redelivery_delay: Duration,
    pub max_redelivery_delay: Duration,
    /// Acked messages older than this are pruned by the durable backend.
    pub acked_retention: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            prefetch: 10,
            visibility_timeout: Duration::from_secs(300),
            max_deliveries: 5,
            poll_wait: Duration::from_secs(1),
            redelivery_delay: Duration::from_secs(1),
            max_redelivery_delay: Duration::from_secs(60),
            acked_retention: Duration::from_secs(3600),
        }
    }
}

impl BrokerSettings {
    /// Delay before redelivering a message nacked on its `attempt`-th delivery.
    pub fn redelivery_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.redelivery_delay
            .saturating_mul(factor)
            .min(self.max_redelivery_delay)
    }
}

pub const MAX_DELIVERIES_REASON: &str = "max deliveries exceeded";

impl BrokerMessage {
    pub fn new(queue: impl Into<String>, body: ChannelMessage) -> Self {
        Self {
            queue: queue.into(),
            body,
            dedupe_key: None,
            enqueued_at: utc_now(),
        }
    }

    pub fn dedupe_key_or_derived(&self) -> String {
        self.dedupe_key
            .clone()
            .unwrap_or_else(|| self.body.dedupe_key())
    }
}

impl BrokerDelivery {
    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

impl From<BrokerMessage> for BrokerDelivery {
    fn from(message: BrokerMessage) -> Self {
        let dedupe = message.dedupe_key_or_derived();
        Self {
            delivery_id: Uuid::new_v4(),
            queue: message.queue,
            dedupe_key: dedupe,
            enqueued_at: message.enqueued_at,
            body: message.body,
            attempt: 0,
        }
    }
}

fn utc_now() -> DateTime<Utc> {
    Utc::now()
}
