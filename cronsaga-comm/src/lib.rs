use std::fmt;

use chrono::{DateTime, Utc};
use cronsaga_models::core::CorrelationId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Discriminant used by consumers to resolve a handler at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskDispatch,
    SagaStep,
    SagaOutcome,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::TaskDispatch => "task_dispatch",
            MessageKind::SagaStep => "saga_step",
            MessageKind::SagaOutcome => "saga_outcome",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    TaskDispatch(TaskDispatch),
    SagaStep(SagaStepMessage),
    SagaOutcome(SagaStepOutcome),
}

/// A due task handed to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDispatch {
    pub task_id: Uuid,
    pub payload: Value,
    pub fired_at: DateTime<Utc>,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Forward,
    Compensate,
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepPhase::Forward => f.write_str("forward"),
            StepPhase::Compensate => f.write_str("compensate"),
        }
    }
}

/// Forward or compensating action for one saga step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStepMessage {
    pub saga_id: Uuid,
    pub step_id: String,
    pub service: String,
    pub action: String,
    pub payload: Value,
    pub phase: StepPhase,
    pub reply_to: String,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepResult {
    Completed {
        #[serde(default)]
        output: Value,
    },
    Failed {
        error: String,
    },
}

/// Reported by the service that executed a [`SagaStepMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStepOutcome {
    pub saga_id: Uuid,
    pub step_id: String,
    pub phase: StepPhase,
    pub result: StepResult,
    pub correlation_id: CorrelationId,
    pub reported_at: DateTime<Utc>,
}

impl SagaStepMessage {
    pub fn outcome(&self, result: StepResult) -> SagaStepOutcome {
        SagaStepOutcome {
            saga_id: self.saga_id,
            step_id: self.step_id.clone(),
            phase: self.phase,
            result,
            correlation_id: self.correlation_id,
            reported_at: Utc::now(),
        }
    }
}

impl ChannelMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ChannelMessage::TaskDispatch(_) => MessageKind::TaskDispatch,
            ChannelMessage::SagaStep(_) => MessageKind::SagaStep,
            ChannelMessage::SagaOutcome(_) => MessageKind::SagaOutcome,
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            ChannelMessage::TaskDispatch(dispatch) => dispatch.correlation_id,
            ChannelMessage::SagaStep(step) => step.correlation_id,
            ChannelMessage::SagaOutcome(outcome) => outcome.correlation_id,
        }
    }

    /// Key shared by every redelivery of the same logical effect.
    pub fn dedupe_key(&self) -> String {
        match self {
            ChannelMessage::TaskDispatch(dispatch) => format!(
                "task:{}:{}",
                dispatch.task_id,
                dispatch.fired_at.timestamp_millis()
            ),
            ChannelMessage::SagaStep(step) => {
                format!("saga:{}:{}:{}", step.saga_id, step.step_id, step.phase)
            }
            ChannelMessage::SagaOutcome(outcome) => format!(
                "outcome:{}:{}:{}",
                outcome.saga_id, outcome.step_id, outcome.phase
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_form_is_tagged_by_message_type() {
        let message = ChannelMessage::TaskDispatch(TaskDispatch {
            task_id: Uuid::nil(),
            payload: json!({"report": "daily"}),
            fired_at: Utc::now(),
            correlation_id: CorrelationId::new(),
        });

        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "task_dispatch");
        assert_eq!(value["payload"]["report"], "daily");
        assert_eq!(ChannelMessage::from_json(&value.to_string()).unwrap(), message);
    }

    #[test]
    fn forward_and_compensation_messages_have_distinct_keys() {
        let forward = SagaStepMessage {
            saga_id: Uuid::new_v4(),
            step_id: "charge".into(),
            service: "billing".into(),
            action: "charge".into(),
            payload: json!({}),
            phase: StepPhase::Forward,
            reply_to: "saga.outcomes".into(),
            correlation_id: CorrelationId::new(),
        };
        let mut compensate = forward.clone();
        compensate.phase = StepPhase::Compensate;

        assert_ne!(
            ChannelMessage::SagaStep(forward).dedupe_key(),
            ChannelMessage::SagaStep(compensate).dedupe_key()
        );
    }

    #[test]
    fn outcome_carries_step_identity() {
        let step = SagaStepMessage {
            saga_id: Uuid::new_v4(),
            step_id: "ship".into(),
            service: "logistics".into(),
            action: "ship".into(),
            payload: json!({}),
            phase: StepPhase::Compensate,
            reply_to: "saga.outcomes".into(),
            correlation_id: CorrelationId::new(),
        };

        let outcome = step.outcome(StepResult::Failed {
            error: "carrier offline".into(),
        });

        assert_eq!(outcome.saga_id, step.saga_id);
        assert_eq!(outcome.phase, StepPhase::Compensate);
        assert_eq!(outcome.correlation_id, step.correlation_id);
    }
}
