use crate::{
    Broker, BrokerDelivery, BrokerError, BrokerMessage, BrokerSettings, DeadLetter,
    MAX_DELIVERIES_REASON,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

struct Lease {
    delivery: BrokerDelivery,
    consumer: String,
    expires_at: Instant,
}

/// A queued delivery and the instant it may be leased again.
struct Ready {
    delivery: BrokerDelivery,
    available_at: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Ready>,
    dead: Vec<DeadLetter>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    inflight: HashMap<Uuid, Lease>,
    live_keys: HashSet<String>,
}

impl BrokerState {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    fn dead_letter(&mut self, delivery: BrokerDelivery, reason: &str) {
        self.live_keys.remove(&delivery.dedupe_key);
        let queue = delivery.queue.clone();
        self.queue(&queue).dead.push(DeadLetter {
            delivery,
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        });
    }

    /// Expired leases go back to the head of the queue; nacked deliveries
    /// wait at the tail until `available_at`.
    fn requeue(
        &mut self,
        delivery: BrokerDelivery,
        max_deliveries: u32,
        available_at: Instant,
        now: Instant,
    ) {
        if delivery.attempt >= max_deliveries {
            self.dead_letter(delivery, MAX_DELIVERIES_REASON);
            return;
        }
        let queue = delivery.queue.clone();
        let ready = Ready {
            delivery,
            available_at,
        };
        if available_at <= now {
            self.queue(&queue).ready.push_front(ready);
        } else {
            self.queue(&queue).ready.push_back(ready);
        }
    }

    fn next_available(&self, queue: &str) -> Option<Instant> {
        self.queues
            .get(queue)?
            .ready
            .iter()
            .map(|ready| ready.available_at)
            .min()
    }

    fn reclaim_expired(&mut self, now: Instant, max_deliveries: u32) {
        let expired: Vec<Uuid> = self
            .inflight
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(lease) = self.inflight.remove(&id) {
                self.requeue(lease.delivery, max_deliveries, now, now);
            }
        }
    }

    fn held_by(&self, consumer: &str) -> usize {
        self.inflight
            .values()
            .filter(|lease| lease.consumer == consumer)
            .count()
    }

    fn take_lease(&mut self, consumer: &str, delivery_id: Uuid) -> Result<Lease, BrokerError> {
        let held = self
            .inflight
            .get(&delivery_id)
            .is_some_and(|lease| lease.consumer == consumer);
        if !held {
            return Err(BrokerError::UnknownDelivery(delivery_id));
        }
        self.inflight
            .remove(&delivery_id)
            .ok_or(BrokerError::UnknownDelivery(delivery_id))
    }
}

/// Non-durable broker for single-process deployments and tests.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    settings: BrokerSettings,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: BrokerSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Ready plus in-flight messages on `queue`.
    pub fn depth(&self, queue: &str) -> usize {
        let guard = self.state.lock();
        let ready = guard.queues.get(queue).map_or(0, |q| q.ready.len());
        let inflight = guard
            .inflight
            .values()
            .filter(|lease| lease.delivery.queue == queue)
            .count();
        ready + inflight
    }

    fn try_lease(&self, queue: &str, consumer: &str) -> Option<BrokerDelivery> {
        let mut guard = self.state.lock();
        let now = Instant::now();
        guard.reclaim_expired(now, self.settings.max_deliveries);

        if guard.held_by(consumer) >= self.settings.prefetch {
            return None;
        }

        let ready = &mut guard.queue(queue).ready;
        let position = ready.iter().position(|entry| entry.available_at <= now)?;
        let mut delivery = ready.remove(position)?.delivery;
        delivery.delivery_id = Uuid::new_v4();
        delivery.attempt += 1;
        guard.inflight.insert(
            delivery.delivery_id,
            Lease {
                delivery: delivery.clone(),
                consumer: consumer.to_string(),
                expires_at: now + self.settings.visibility_timeout,
            },
        );
        Some(delivery)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        let mut guard = self.state.lock();
        let dedupe = message.dedupe_key_or_derived();
        if !guard.live_keys.insert(dedupe.clone()) {
            return Err(BrokerError::Duplicate(dedupe));
        }

        let delivery: BrokerDelivery = message.into();
        let queue = delivery.queue.clone();
        guard.queue(&queue).ready.push_back(Ready {
            delivery,
            available_at: Instant::now(),
        });
        drop(guard);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn poll(&self, queue: &str, consumer: &str) -> Result<Option<BrokerDelivery>, BrokerError> {
        let deadline = Instant::now() + self.settings.poll_wait;
        loop {
            // registered before the check so a publish in between is not missed
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_lease(queue, consumer) {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // wake early when a backed-off delivery becomes available
            let wake = self
                .state
                .lock()
                .next_available(queue)
                .filter(|at| *at > now)
                .map_or(deadline, |at| at.min(deadline));
            let _ = tokio::time::timeout_at(wake, notified).await;
        }
    }

    async fn ack(&self, consumer: &str, delivery_id: Uuid) -> Result<(), BrokerError> {
        let mut guard = self.state.lock();
        let lease = guard.take_lease(consumer, delivery_id)?;
        guard.live_keys.remove(&lease.delivery.dedupe_key);
        drop(guard);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, consumer: &str, delivery_id: Uuid) -> Result<(), BrokerError> {
        let mut guard = self.state.lock();
        let lease = guard.take_lease(consumer, delivery_id)?;
        let now = Instant::now();
        let available_at = now + self.settings.redelivery_backoff(lease.delivery.attempt);
        guard.requeue(lease.delivery, self.settings.max_deliveries, available_at, now);
        drop(guard);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn reject(
        &self,
        consumer: &str,
        delivery_id: Uuid,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let mut guard = self.state.lock();
        let lease = guard.take_lease(consumer, delivery_id)?;
        guard.dead_letter(lease.delivery, reason);
        drop(guard);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, BrokerError> {
        let guard = self.state.lock();
        Ok(guard
            .queues
            .get(queue)
            .map(|q| q.dead.clone())
            .unwrap_or_default())
    }

    async fn heartbeat(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
