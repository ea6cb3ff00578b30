use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Correlates every log record and message produced on behalf of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A persisted, cron-driven task.
///
/// `next_run_at` is always the earliest unfired trigger of `cron_expression`
/// evaluated from `last_run_at`, or from `created_at` before the first fire.
/// Tasks are never physically deleted; they are deactivated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub cron_expression: String,
    pub payload: Value,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivation_reason: Option<String>,
    pub revision: i64,
}

impl Task {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_run_at <= now
    }

    /// Instant the next trigger is evaluated from.
    pub fn schedule_anchor(&self) -> DateTime<Utc> {
        self.last_run_at.unwrap_or(self.created_at)
    }
}

/// Input accepted by task registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub cron_expression: String,
    #[serde(default)]
    pub payload: Value,
}

/// Administrative changes; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub payload: Option<Value>,
    pub is_active: Option<bool>,
}

/// Conditional write that grants one scheduler replica the right to fire
/// a task for the trigger instant `expected_next_run_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskClaim {
    pub task_id: Uuid,
    pub expected_next_run_at: DateTime<Utc>,
    pub expected_revision: i64,
    pub claimed_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
}

impl TaskClaim {
    pub fn for_task(task: &Task, claimed_at: DateTime<Utc>, next_run_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id,
            expected_next_run_at: task.next_run_at,
            expected_revision: task.revision,
            claimed_at,
            next_run_at,
        }
    }

    /// The task as it looks after the claim has been applied.
    pub fn apply(&self, task: &Task) -> Task {
        let mut claimed = task.clone();
        claimed.last_run_at = Some(self.claimed_at);
        claimed.next_run_at = self.next_run_at;
        claimed.updated_at = self.claimed_at;
        claimed.revision = task.revision + 1;
        claimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_task() -> Task {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        Task {
            id: Uuid::new_v4(),
            name: "nightly-export".into(),
            cron_expression: "0 2 * * *".into(),
            payload: serde_json::json!({"kind": "export"}),
            next_run_at: Utc.with_ymd_and_hms(2024, 1, 2, 2, 0, 0).unwrap(),
            last_run_at: None,
            is_active: true,
            created_at: created,
            updated_at: created,
            deactivated_at: None,
            deactivation_reason: None,
            revision: 0,
        }
    }

    #[test]
    fn inactive_task_is_never_due() {
        let mut task = sample_task();
        let later = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert!(task.is_due(later));

        task.is_active = false;
        assert!(!task.is_due(later));
    }

    #[test]
    fn claim_advances_schedule_and_revision() {
        let task = sample_task();
        let fired = Utc.with_ymd_and_hms(2024, 1, 2, 2, 0, 5).unwrap();
        let next = Utc.with_ymd_and_hms(2024, 1, 3, 2, 0, 0).unwrap();

        let claimed = TaskClaim::for_task(&task, fired, next).apply(&task);

        assert_eq!(claimed.last_run_at, Some(fired));
        assert_eq!(claimed.next_run_at, next);
        assert_eq!(claimed.revision, 1);
        assert_eq!(claimed.schedule_anchor(), fired);
    }
}
