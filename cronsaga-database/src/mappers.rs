use chrono::{DateTime, Utc};
use cronsaga_models::{core::Task, saga::SagaState};
use sqlx::{Row, sqlite::SqliteRow};
use uuid::Uuid;

use crate::StoreError;

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(id: &str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("timestamp out of range: {millis}"),
    })
}

fn optional_from_millis(id: &str, millis: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    millis.map(|value| from_millis(id, value)).transpose()
}

pub fn parse_id(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|err| StoreError::Corrupt {
        id: raw.to_string(),
        reason: err.to_string(),
    })
}

pub fn row_to_task(row: &SqliteRow) -> Result<Task, StoreError> {
    let raw_id = row.try_get::<String, _>("id")?;
    let payload = row.try_get::<String, _>("payload")?;

    Ok(Task {
        id: parse_id(&raw_id)?,
        name: row.try_get::<String, _>("name")?,
        cron_expression: row.try_get::<String, _>("cron_expression")?,
        payload: serde_json::from_str(&payload)?,
        next_run_at: from_millis(&raw_id, row.try_get::<i64, _>("next_run_at")?)?,
        last_run_at: optional_from_millis(&raw_id, row.try_get::<Option<i64>, _>("last_run_at")?)?,
        is_active: row.try_get::<bool, _>("is_active")?,
        created_at: from_millis(&raw_id, row.try_get::<i64, _>("created_at")?)?,
        updated_at: from_millis(&raw_id, row.try_get::<i64, _>("updated_at")?)?,
        deactivated_at: optional_from_millis(
            &raw_id,
            row.try_get::<Option<i64>, _>("deactivated_at")?,
        )?,
        deactivation_reason: row.try_get::<Option<String>, _>("deactivation_reason")?,
        revision: row.try_get::<i64, _>("revision")?,
    })
}

pub fn row_to_saga(row: &SqliteRow) -> Result<SagaState, StoreError> {
    let body = row.try_get::<String, _>("body")?;
    Ok(serde_json::from_str(&body)?)
}
