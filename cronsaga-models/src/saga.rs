use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    Pending,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

impl SagaStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Compensated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "PENDING",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Failed => "FAILED",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Compensated => "COMPENSATED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(SagaStatus::Pending),
            "COMPLETED" => Some(SagaStatus::Completed),
            "FAILED" => Some(SagaStatus::Failed),
            "COMPENSATING" => Some(SagaStatus::Compensating),
            "COMPENSATED" => Some(SagaStatus::Compensated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationStatus {
    Pending,
    Completed,
    Failed,
}

/// Reverses the effect of a completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compensation {
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    pub status: CompensationStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl Compensation {
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            action: action.into(),
            payload,
            status: CompensationStatus::Pending,
            error: None,
            dispatched_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    pub step_id: String,
    pub service: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub compensation: Option<Compensation>,
    #[serde(default)]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SagaStep {
    pub fn new(
        step_id: impl Into<String>,
        service: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            service: service.into(),
            action: action.into(),
            payload,
            status: StepStatus::Pending,
            result: None,
            error: None,
            compensation: None,
            dispatched_at: None,
            completed_at: None,
        }
    }

    pub fn with_compensation(mut self, action: impl Into<String>, payload: Value) -> Self {
        self.compensation = Some(Compensation::new(action, payload));
        self
    }

    /// True when a later failure must invoke this step's compensation.
    pub fn needs_compensation(&self) -> bool {
        self.status == StepStatus::Completed
            && self
                .compensation
                .as_ref()
                .is_some_and(|c| c.status != CompensationStatus::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaTransition {
    pub from: SagaStatus,
    pub to: SagaStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaState {
    pub saga_id: Uuid,
    pub transaction_type: String,
    pub steps: Vec<SagaStep>,
    pub current_step: usize,
    pub status: SagaStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub history: Vec<SagaTransition>,
    #[serde(default)]
    pub version: i64,
}

impl SagaState {
    pub fn new(
        transaction_type: impl Into<String>,
        steps: Vec<SagaStep>,
        metadata: BTreeMap<String, Value>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            saga_id: Uuid::new_v4(),
            transaction_type: transaction_type.into(),
            steps,
            current_step: 0,
            status: SagaStatus::Pending,
            created_at,
            completed_at: None,
            metadata,
            history: Vec::new(),
            version: 0,
        }
    }

    pub fn current(&self) -> Option<&SagaStep> {
        self.steps.get(self.current_step)
    }

    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.step_id == step_id)
    }

    /// Moves to `to`, recording the transition. `completed_at` is stamped
    /// the first time a terminal status is reached and never again.
    pub fn transition(&mut self, to: SagaStatus, at: DateTime<Utc>) {
        if self.status == to {
            return;
        }
        self.history.push(SagaTransition {
            from: self.status,
            to,
            at,
        });
        self.status = to;
        if to.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(at);
        }
    }

    /// A compensation failed; the saga cannot finish without an operator.
    pub fn requires_intervention(&self) -> bool {
        self.status == SagaStatus::Compensating
            && self.steps.iter().any(|step| {
                step.compensation
                    .as_ref()
                    .is_some_and(|c| c.status == CompensationStatus::Failed)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completed_at_is_stamped_once() {
        let t0 = Utc::now();
        let mut saga = SagaState::new("order", vec![], BTreeMap::new(), t0);

        saga.transition(SagaStatus::Completed, t0);
        let stamped = saga.completed_at;
        saga.transition(SagaStatus::Compensated, t0 + chrono::Duration::seconds(5));

        assert_eq!(saga.completed_at, stamped);
        assert_eq!(saga.history.len(), 2);
    }

    #[test]
    fn only_completed_steps_need_compensation() {
        let mut step = SagaStep::new("reserve", "inventory", "reserve", json!({}))
            .with_compensation("release", json!({}));
        assert!(!step.needs_compensation());

        step.status = StepStatus::Completed;
        assert!(step.needs_compensation());

        let plain = SagaStep::new("notify", "mail", "send", json!({}));
        assert!(!plain.needs_compensation());
    }

    #[test]
    fn status_round_trips_through_its_column_form() {
        for status in [
            SagaStatus::Pending,
            SagaStatus::Completed,
            SagaStatus::Failed,
            SagaStatus::Compensating,
            SagaStatus::Compensated,
        ] {
            assert_eq!(SagaStatus::parse(status.as_str()), Some(status));
        }
    }
}
