use crate::{
    Broker, BrokerDelivery, BrokerError, BrokerMessage, BrokerSettings, DeadLetter,
    MAX_DELIVERIES_REASON,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronsaga_comm::ChannelMessage;
use log::{debug, info};
use parking_lot::Mutex;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Executor, Row, SqlitePool,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const TABLE_INIT_SQL: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS broker_messages (
        message_id TEXT PRIMARY KEY,
        queue TEXT NOT NULL,
        body TEXT NOT NULL,
        dedupe_key TEXT NOT NULL,
        state TEXT NOT NULL,
        consumer TEXT,
        delivery_id TEXT,
        attempt INTEGER NOT NULL,
        enqueued_at INTEGER NOT NULL,
        available_at INTEGER NOT NULL DEFAULT 0,
        lease_expires_at INTEGER,
        dead_reason TEXT,
        dead_at INTEGER,
        settled_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_broker_ready ON broker_messages (queue, state, enqueued_at)",
    // at most one live (ready or in-flight) message per dedupe key
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_broker_live_dedupe ON broker_messages (dedupe_key)
        WHERE state IN ('ready', 'inflight')",
];

const DELIVERY_COLUMNS: &str =
    "message_id, queue, body, dedupe_key, delivery_id, attempt, enqueued_at, dead_reason, dead_at";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

// Claim races with other consumers on the same queue are retried this often
// before poll gives up for the current round.
const CLAIM_ATTEMPTS: usize = 5;

/// Broker that persists every message in SQLite, so queued and in-flight
/// work survives a broker restart.
#[derive(Clone)]
pub struct SqliteBroker {
    pool: SqlitePool,
    settings: BrokerSettings,
    last_prune: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl SqliteBroker {
    pub async fn open(path: &str, settings: BrokerSettings) -> Result<Self, BrokerError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let broker = Self {
            pool,
            settings,
            last_prune: Arc::default(),
        };
        broker.create_tables().await?;
        info!("Opened durable broker store {}", path);
        Ok(broker)
    }

    pub async fn in_memory(settings: BrokerSettings) -> Result<Self, BrokerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let broker = Self {
            pool,
            settings,
            last_prune: Arc::default(),
        };
        broker.create_tables().await?;
        Ok(broker)
    }

    async fn create_tables(&self) -> Result<(), BrokerError> {
        for statement in TABLE_INIT_SQL {
            self.pool.execute(statement).await?;
        }
        Ok(())
    }

    /// Deletes acked messages settled longer than `acked_retention` before `now`.
    pub async fn prune_acked(&self, now: DateTime<Utc>) -> Result<u64, BrokerError> {
        let cutoff = now - to_chrono(self.settings.acked_retention)?;
        let pruned = sqlx::query(
            "DELETE FROM broker_messages WHERE state = 'acked' AND settled_at <= ?",
        )
        .bind(cutoff.timestamp_millis())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if pruned > 0 {
            debug!("Pruned {} acked message(s)", pruned);
        }
        Ok(pruned)
    }

    async fn prune_if_due(&self, now: DateTime<Utc>) -> Result<(), BrokerError> {
        {
            let mut last = self.last_prune.lock();
            let interval = to_chrono(PRUNE_INTERVAL)?;
            if matches!(*last, Some(at) if now - at < interval) {
                return Ok(());
            }
            *last = Some(now);
        }
        self.prune_acked(now).await.map(|_| ())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<(), BrokerError> {
        self.prune_if_due(now).await?;

        let now_ms = now.timestamp_millis();
        sqlx::query(
            "UPDATE broker_messages
             SET state = 'dead', dead_reason = ?, dead_at = ?
             WHERE state = 'inflight' AND lease_expires_at <= ? AND attempt >= ?",
        )
        .bind(MAX_DELIVERIES_REASON)
        .bind(now_ms)
        .bind(now_ms)
        .bind(self.settings.max_deliveries as i64)
        .execute(&self.pool)
        .await?;

        let reclaimed = sqlx::query(
            "UPDATE broker_messages
             SET state = 'ready', consumer = NULL, lease_expires_at = NULL, available_at = ?
             WHERE state = 'inflight' AND lease_expires_at <= ?",
        )
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        if reclaimed.rows_affected() > 0 {
            debug!("Reclaimed {} expired lease(s)", reclaimed.rows_affected());
        }
        Ok(())
    }

    async fn try_lease(
        &self,
        queue: &str,
        consumer: &str,
    ) -> Result<Option<BrokerDelivery>, BrokerError> {
        let now = Utc::now();
        self.reclaim_expired(now).await?;

        let held: i64 = sqlx::query(
            "SELECT COUNT(*) AS held FROM broker_messages WHERE state = 'inflight' AND consumer = ?",
        )
        .bind(consumer)
        .fetch_one(&self.pool)
        .await?
        .try_get("held")?;
        if held as usize >= self.settings.prefetch {
            return Ok(None);
        }

        for _ in 0..CLAIM_ATTEMPTS {
            let candidate = sqlx::query(
                "SELECT message_id FROM broker_messages
                 WHERE queue = ? AND state = 'ready' AND available_at <= ?
                 ORDER BY enqueued_at, rowid
                 LIMIT 1",
            )
            .bind(queue)
            .bind(now.timestamp_millis())
            .fetch_optional(&self.pool)
            .await?;
            let Some(candidate) = candidate else {
                return Ok(None);
            };
            let message_id: String = candidate.try_get("message_id")?;

            let delivery_id = Uuid::new_v4();
            let expires = now + to_chrono(self.settings.visibility_timeout)?;
            let claimed = sqlx::query(
                "UPDATE broker_messages
                 SET state = 'inflight', consumer = ?, delivery_id = ?, attempt = attempt + 1,
                     lease_expires_at = ?
                 WHERE message_id = ? AND state = 'ready'",
            )
            .bind(consumer)
            .bind(delivery_id.to_string())
            .bind(expires.timestamp_millis())
            .bind(&message_id)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 1 {
                let row = sqlx::query(&format!(
                    "SELECT {DELIVERY_COLUMNS} FROM broker_messages WHERE message_id = ?"
                ))
                .bind(&message_id)
                .fetch_one(&self.pool)
                .await?;
                return row_to_delivery(&row).map(Some);
            }
        }
        Ok(None)
    }

    async fn settle(
        &self,
        consumer: &str,
        delivery_id: Uuid,
        statement: &str,
        reason: Option<&str>,
    ) -> Result<(), BrokerError> {
        let mut query = sqlx::query(statement);
        if let Some(reason) = reason {
            query = query.bind(reason);
        }
        let result = query
            .bind(Utc::now().timestamp_millis())
            .bind(delivery_id.to_string())
            .bind(consumer)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(BrokerError::UnknownDelivery(delivery_id))
        }
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        let dedupe = message.dedupe_key_or_derived();
        let body = serde_json::to_string(&message.body)?;
        let inserted = sqlx::query(
            "INSERT INTO broker_messages (message_id, queue, body, dedupe_key, state, attempt, enqueued_at)
             VALUES (?, ?, ?, ?, 'ready', 0, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&message.queue)
        .bind(body)
        .bind(&dedupe)
        .bind(message.enqueued_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if err.message().contains("UNIQUE") => {
                Err(BrokerError::Duplicate(dedupe))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn poll(&self, queue: &str, consumer: &str) -> Result<Option<BrokerDelivery>, BrokerError> {
        let deadline = tokio::time::Instant::now() + self.settings.poll_wait;
        loop {
            if let Some(delivery) = self.try_lease(queue, consumer).await? {
                return Ok(Some(delivery));
            }
            if tokio::time::Instant::now() + POLL_INTERVAL > deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, consumer: &str, delivery_id: Uuid) -> Result<(), BrokerError> {
        self.settle(
            consumer,
            delivery_id,
            "UPDATE broker_messages
             SET state = 'acked', lease_expires_at = NULL, settled_at = ?
             WHERE delivery_id = ? AND consumer = ? AND state = 'inflight'",
            None,
        )
        .await
    }

    async fn nack(&self, consumer: &str, delivery_id: Uuid) -> Result<(), BrokerError> {
        let row = sqlx::query(
            "SELECT attempt FROM broker_messages
             WHERE delivery_id = ? AND consumer = ? AND state = 'inflight'",
        )
        .bind(delivery_id.to_string())
        .bind(consumer)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(BrokerError::UnknownDelivery(delivery_id))?;
        let attempt: i64 = row.try_get("attempt")?;

        let now = Utc::now();
        let available_at =
            now + to_chrono(self.settings.redelivery_backoff(attempt.max(1) as u32))?;
        let result = sqlx::query(
            "UPDATE broker_messages
             SET state = CASE WHEN attempt >= ? THEN 'dead' ELSE 'ready' END,
                 dead_reason = CASE WHEN attempt >= ? THEN ? ELSE NULL END,
                 dead_at = CASE WHEN attempt >= ? THEN ? ELSE NULL END,
                 consumer = NULL,
                 lease_expires_at = NULL,
                 available_at = ?
             WHERE delivery_id = ? AND consumer = ? AND state = 'inflight'",
        )
        .bind(self.settings.max_deliveries as i64)
        .bind(self.settings.max_deliveries as i64)
        .bind(MAX_DELIVERIES_REASON)
        .bind(self.settings.max_deliveries as i64)
        .bind(now.timestamp_millis())
        .bind(available_at.timestamp_millis())
        .bind(delivery_id.to_string())
        .bind(consumer)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(BrokerError::UnknownDelivery(delivery_id))
        }
    }

    async fn reject(
        &self,
        consumer: &str,
        delivery_id: Uuid,
        reason: &str,
    ) -> Result<(), BrokerError> {
        self.settle(
            consumer,
            delivery_id,
            "UPDATE broker_messages
             SET state = 'dead', dead_reason = ?, dead_at = ?, lease_expires_at = NULL
             WHERE delivery_id = ? AND consumer = ? AND state = 'inflight'",
            Some(reason),
        )
        .await
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, BrokerError> {
        let rows = sqlx::query(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM broker_messages
             WHERE queue = ? AND state = 'dead'
             ORDER BY dead_at"
        ))
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DeadLetter, BrokerError> {
                let dead_at: Option<i64> = row.try_get("dead_at")?;
                Ok(DeadLetter {
                    delivery: row_to_delivery(row)?,
                    reason: row
                        .try_get::<Option<String>, _>("dead_reason")?
                        .unwrap_or_default(),
                    dead_lettered_at: dead_at
                        .and_then(DateTime::<Utc>::from_timestamp_millis)
                        .unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }

    async fn heartbeat(&self) -> Result<(), BrokerError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration, BrokerError> {
    chrono::Duration::from_std(duration).map_err(|err| BrokerError::Internal(err.to_string()))
}

fn row_to_delivery(row: &SqliteRow) -> Result<BrokerDelivery, BrokerError> {
    let body: String = row.try_get("body")?;
    let delivery_id: Option<String> = row.try_get("delivery_id")?;
    let delivery_id = delivery_id
        .as_deref()
        .map(Uuid::parse_str)
        .transpose()
        .map_err(|err| BrokerError::Storage(err.to_string()))?
        .unwrap_or_else(Uuid::nil);
    let enqueued_at: i64 = row.try_get("enqueued_at")?;
    let attempt: i64 = row.try_get("attempt")?;

    Ok(BrokerDelivery {
        delivery_id,
        queue: row.try_get("queue")?,
        body: ChannelMessage::from_json(&body)?,
        dedupe_key: row.try_get("dedupe_key")?,
        enqueued_at: DateTime::<Utc>::from_timestamp_millis(enqueued_at).ok_or_else(|| {
            BrokerError::Storage(format!("enqueued_at out of range: {enqueued_at}"))
        })?,
        attempt: attempt as u32,
    })
}
