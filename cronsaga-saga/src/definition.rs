use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use cronsaga_models::saga::{CompensationStatus, SagaState, SagaStep, StepStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SagaError;

/// Step template for one transaction type. Steps run in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaDefinition {
    pub transaction_type: String,
    pub steps: Vec<SagaStep>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl SagaDefinition {
    pub fn new(transaction_type: impl Into<String>) -> Self {
        Self {
            transaction_type: transaction_type.into(),
            steps: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn step(mut self, step: SagaStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Step ids address outcomes, so they must be present and unique.
    pub fn validate(&self) -> Result<(), SagaError> {
        if self.transaction_type.trim().is_empty() {
            return Err(SagaError::InvalidDefinition("transaction_type is empty".into()));
        }
        let mut seen = HashSet::new();
        for (position, step) in self.steps.iter().enumerate() {
            if step.step_id.trim().is_empty() {
                return Err(SagaError::InvalidDefinition(format!(
                    "step {position} has an empty step_id"
                )));
            }
            if !seen.insert(step.step_id.as_str()) {
                return Err(SagaError::InvalidDefinition(format!(
                    "step_id '{}' is used more than once",
                    step.step_id
                )));
            }
            if step.service.trim().is_empty() || step.action.trim().is_empty() {
                return Err(SagaError::InvalidDefinition(format!(
                    "step '{}' needs a service and an action",
                    step.step_id
                )));
            }
            if step
                .compensation
                .as_ref()
                .is_some_and(|c| c.action.trim().is_empty())
            {
                return Err(SagaError::InvalidDefinition(format!(
                    "compensation of step '{}' has an empty action",
                    step.step_id
                )));
            }
        }
        Ok(())
    }

    /// Fresh saga state. Any progress carried in the template (statuses,
    /// results, dispatch stamps) is discarded.
    pub fn into_state(self, created_at: DateTime<Utc>) -> SagaState {
        let steps = self.steps.into_iter().map(reset).collect();
        SagaState::new(self.transaction_type, steps, self.metadata, created_at)
    }
}

fn reset(mut step: SagaStep) -> SagaStep {
    step.status = StepStatus::Pending;
    step.result = None;
    step.error = None;
    step.dispatched_at = None;
    step.completed_at = None;
    if let Some(compensation) = step.compensation.as_mut() {
        compensation.status = CompensationStatus::Pending;
        compensation.error = None;
        compensation.dispatched_at = None;
    }
    step
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn builder_keeps_step_order() {
        let definition = SagaDefinition::new("order")
            .step(SagaStep::new("reserve", "inventory", "reserve", json!({})).with_compensation("release", json!({})))
            .step(SagaStep::new("charge", "billing", "charge", json!({})))
            .metadata("tenant", json!("acme"));

        let state = definition.into_state(Utc::now());

        let ids: Vec<&str> = state.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, ["reserve", "charge"]);
        assert_eq!(state.metadata["tenant"], json!("acme"));
        assert_eq!(state.current_step, 0);
    }

    #[test]
    fn definition_loads_from_json() {
        let definition: SagaDefinition = serde_json::from_value(json!({
            "transaction_type": "order",
            "steps": [{
                "step_id": "reserve",
                "service": "inventory",
                "action": "reserve",
                "payload": {"sku": "A1"},
                "status": "PENDING",
                "compensation": {"action": "release", "status": "PENDING"}
            }]
        }))
        .unwrap();

        assert_eq!(definition.steps.len(), 1);
        assert!(definition.steps[0].compensation.is_some());
    }

    #[test]
    fn duplicate_and_empty_step_ids_are_rejected() {
        let duplicate = SagaDefinition::new("order")
            .step(SagaStep::new("charge", "billing", "charge", json!({})))
            .step(SagaStep::new("charge", "billing", "capture", json!({})));
        assert!(matches!(
            duplicate.validate(),
            Err(SagaError::InvalidDefinition(reason)) if reason.contains("charge")
        ));

        let empty = SagaDefinition::new("order").step(SagaStep::new(" ", "billing", "charge", json!({})));
        assert!(empty.validate().is_err());

        let no_action = SagaDefinition::new("order").step(SagaStep::new("charge", "billing", "", json!({})));
        assert!(no_action.validate().is_err());

        assert!(SagaDefinition::new("").validate().is_err());
    }

    #[test]
    fn template_progress_is_reset() {
        let definition: SagaDefinition = serde_json::from_value(json!({
            "transaction_type": "order",
            "steps": [{
                "step_id": "reserve",
                "service": "inventory",
                "action": "reserve",
                "status": "COMPLETED",
                "result": {"reservation": "old"},
                "dispatched_at": "2026-01-01T00:00:00Z",
                "compensation": {"action": "release", "status": "FAILED", "error": "boom"}
            }]
        }))
        .unwrap();
        definition.validate().unwrap();

        let state = definition.into_state(Utc::now());

        let step = &state.steps[0];
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.result.is_none());
        assert!(step.dispatched_at.is_none());
        let compensation = step.compensation.as_ref().unwrap();
        assert_eq!(compensation.status, CompensationStatus::Pending);
        assert!(compensation.error.is_none());
    }
}
