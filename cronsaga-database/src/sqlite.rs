use std::{str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use cronsaga_models::{
    core::{Task, TaskClaim},
    saga::{SagaState, SagaStatus},
};
use log::info;
use sqlx::{
    ConnectOptions, Executor, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use uuid::Uuid;

use crate::{
    StoreError,
    interfaces::{SagaStore, TaskStore},
    mappers::{row_to_saga, row_to_task, to_millis},
};

const TABLE_INIT_SQL: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        cron_expression TEXT NOT NULL,
        payload TEXT NOT NULL,
        next_run_at INTEGER NOT NULL,
        last_run_at INTEGER,
        is_active INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deactivated_at INTEGER,
        deactivation_reason TEXT,
        revision INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (is_active, next_run_at)",
    "CREATE TABLE IF NOT EXISTS sagas (
        saga_id TEXT PRIMARY KEY,
        transaction_type TEXT NOT NULL,
        status TEXT NOT NULL,
        current_step INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        completed_at INTEGER,
        version INTEGER NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_sagas_status ON sagas (status)",
];

const TASK_COLUMNS: &str = "id, name, cron_expression, payload, next_run_at, last_run_at, \
    is_active, created_at, updated_at, deactivated_at, deactivation_reason, revision";

pub struct SqliteDb {
    pub pool: SqlitePool,
}

impl SqliteDb {
    pub async fn new(filename: &str) -> Result<Self, StoreError> {
        let mut options = SqliteConnectOptions::new()
            .filename(filename)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        options
            .log_statements(log::LevelFilter::Debug)
            .log_slow_statements(log::LevelFilter::Warn, Duration::from_secs(1));

        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let db = SqliteDb { pool };
        db.create_tables().await?;
        info!("Opened task database {}", filename);
        Ok(db)
    }

    /// Private in-memory database; the single connection keeps it alive.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = SqliteDb { pool };
        db.create_tables().await?;
        Ok(db)
    }

    pub async fn create_tables(&self) -> Result<(), StoreError> {
        for statement in TABLE_INIT_SQL {
            self.pool.execute(statement).await?;
        }
        Ok(())
    }
}

impl TaskStore for SqliteDb {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&task.payload)?;
        sqlx::query(&format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(task.id.to_string())
        .bind(&task.name)
        .bind(&task.cron_expression)
        .bind(payload)
        .bind(to_millis(task.next_run_at))
        .bind(task.last_run_at.map(to_millis))
        .bind(task.is_active)
        .bind(to_millis(task.created_at))
        .bind(to_millis(task.updated_at))
        .bind(task.deactivated_at.map(to_millis))
        .bind(&task.deactivation_reason)
        .bind(task.revision)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn list_active_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE is_active = 1 ORDER BY next_run_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn fetch_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE is_active = 1 AND next_run_at <= ?
             ORDER BY next_run_at
             LIMIT ?"
        ))
        .bind(to_millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn claim_task(&self, claim: &TaskClaim) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks
             SET last_run_at = ?, next_run_at = ?, updated_at = ?, revision = revision + 1
             WHERE id = ?
               AND is_active = 1
               AND next_run_at = ?
               AND next_run_at <= ?
               AND revision = ?",
        )
        .bind(to_millis(claim.claimed_at))
        .bind(to_millis(claim.next_run_at))
        .bind(to_millis(claim.claimed_at))
        .bind(claim.task_id.to_string())
        .bind(to_millis(claim.expected_next_run_at))
        .bind(to_millis(claim.claimed_at))
        .bind(claim.expected_revision)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_task(&self, task: &Task) -> Result<bool, StoreError> {
        let payload = serde_json::to_string(&task.payload)?;
        let result = sqlx::query(
            "UPDATE tasks
             SET name = ?, cron_expression = ?, payload = ?, next_run_at = ?, is_active = ?,
                 updated_at = ?, deactivated_at = ?, deactivation_reason = ?,
                 revision = revision + 1
             WHERE id = ? AND revision = ?",
        )
        .bind(&task.name)
        .bind(&task.cron_expression)
        .bind(payload)
        .bind(to_millis(task.next_run_at))
        .bind(task.is_active)
        .bind(to_millis(task.updated_at))
        .bind(task.deactivated_at.map(to_millis))
        .bind(&task.deactivation_reason)
        .bind(task.id.to_string())
        .bind(task.revision)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn deactivate_task(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks
             SET is_active = 0, deactivated_at = ?, deactivation_reason = ?, updated_at = ?,
                 revision = revision + 1
             WHERE id = ? AND is_active = 1",
        )
        .bind(to_millis(at))
        .bind(reason)
        .bind(to_millis(at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

impl SagaStore for SqliteDb {
    async fn insert_saga(&self, saga: &SagaState) -> Result<(), StoreError> {
        let body = serde_json::to_string(saga)?;
        sqlx::query(
            "INSERT INTO sagas (saga_id, transaction_type, status, current_step, created_at,
                                completed_at, version, body)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(saga.saga_id.to_string())
        .bind(&saga.transaction_type)
        .bind(saga.status.as_str())
        .bind(saga.current_step as i64)
        .bind(to_millis(saga.created_at))
        .bind(saga.completed_at.map(to_millis))
        .bind(saga.version)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_saga(&self, id: Uuid) -> Result<Option<SagaState>, StoreError> {
        let row = sqlx::query("SELECT body FROM sagas WHERE saga_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_saga).transpose()
    }

    async fn save_saga(&self, saga: &SagaState) -> Result<bool, StoreError> {
        let mut stored = saga.clone();
        stored.version = saga.version + 1;
        let body = serde_json::to_string(&stored)?;

        let result = sqlx::query(
            "UPDATE sagas
             SET status = ?, current_step = ?, completed_at = ?, version = ?, body = ?
             WHERE saga_id = ? AND version = ?",
        )
        .bind(stored.status.as_str())
        .bind(stored.current_step as i64)
        .bind(stored.completed_at.map(to_millis))
        .bind(stored.version)
        .bind(body)
        .bind(saga.saga_id.to_string())
        .bind(saga.version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_sagas_by_status(&self, status: SagaStatus) -> Result<Vec<SagaState>, StoreError> {
        let rows = sqlx::query("SELECT body FROM sagas WHERE status = ? ORDER BY created_at")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_saga).collect()
    }
}
