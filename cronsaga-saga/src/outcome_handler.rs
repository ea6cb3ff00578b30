use std::sync::Arc;

use async_trait::async_trait;
use cronsaga_comm::ChannelMessage;
use cronsaga_database::SagaStore;
use cronsaga_worker::{DeliveryContext, HandlerError, MessageHandler};

use crate::{coordinator::SagaCoordinator, errors::SagaError};

/// Feeds step outcomes from the reply queue into the coordinator.
pub struct SagaOutcomeHandler<S: SagaStore> {
    coordinator: Arc<SagaCoordinator<S>>,
}

impl<S: SagaStore> SagaOutcomeHandler<S> {
    pub fn new(coordinator: Arc<SagaCoordinator<S>>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl<S: SagaStore> MessageHandler for SagaOutcomeHandler<S> {
    async fn handle(
        &self,
        message: &ChannelMessage,
        _context: &DeliveryContext,
    ) -> Result<(), HandlerError> {
        let ChannelMessage::SagaOutcome(outcome) = message else {
            return Err(HandlerError::Permanent(format!(
                "expected saga_outcome, got {}",
                message.kind()
            )));
        };
        self.coordinator
            .handle_outcome(outcome)
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

fn classify(err: SagaError) -> HandlerError {
    match err {
        SagaError::NotFound(_) | SagaError::UnknownStep { .. } | SagaError::InvalidDefinition(_) => {
            HandlerError::Permanent(err.to_string())
        }
        other => HandlerError::Transient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use cronsaga_broker::{ConnectionMonitor, DispatchSettings, Dispatcher, in_memory::InMemoryBroker};
    use cronsaga_comm::{SagaStepOutcome, StepPhase, StepResult, TaskDispatch};
    use cronsaga_database::in_memory::InMemorySagaStore;
    use cronsaga_models::core::CorrelationId;
    use cronsaga_utilities::ComponentLogger;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::{CoordinatorSettings, SagaDefinition};

    fn handler() -> SagaOutcomeHandler<InMemorySagaStore> {
        let logger = ComponentLogger::new("cronsaga-scheduler", "saga-coordinator");
        let dispatcher = Dispatcher::new(
            Arc::new(InMemoryBroker::new()),
            ConnectionMonitor::always_connected(),
            DispatchSettings::default(),
            logger.child("dispatcher"),
        );
        SagaOutcomeHandler::new(Arc::new(SagaCoordinator::new(
            Arc::new(InMemorySagaStore::new()),
            dispatcher,
            CoordinatorSettings::default(),
            logger,
        )))
    }

    fn context(message: &ChannelMessage) -> DeliveryContext {
        DeliveryContext {
            delivery_id: Uuid::new_v4(),
            queue: "saga-outcomes".into(),
            dedupe_key: message.dedupe_key(),
            attempt: 1,
            correlation_id: message.correlation_id(),
        }
    }

    fn outcome(saga_id: Uuid, step_id: &str) -> ChannelMessage {
        ChannelMessage::SagaOutcome(SagaStepOutcome {
            saga_id,
            step_id: step_id.into(),
            phase: StepPhase::Forward,
            result: StepResult::Completed { output: json!({}) },
            correlation_id: CorrelationId(saga_id),
            reported_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn outcome_for_missing_saga_is_permanent() {
        let handler = handler();
        let message = outcome(Uuid::new_v4(), "a");

        let err = handler.handle(&message, &context(&message)).await.unwrap_err();
        assert!(matches!(err, HandlerError::Permanent(_)));
    }

    #[tokio::test]
    async fn outcome_advances_saga() {
        let handler = handler();
        let saga = handler
            .coordinator
            .start(SagaDefinition::new("order").step(cronsaga_models::saga::SagaStep::new(
                "a",
                "svc",
                "do",
                json!({}),
            )))
            .await
            .unwrap();
        let message = outcome(saga.saga_id, "a");

        handler.handle(&message, &context(&message)).await.unwrap();

        let pending = handler.coordinator.resume(saga.saga_id).await.unwrap();
        assert_eq!(pending.status, cronsaga_models::saga::SagaStatus::Completed);
    }

    #[tokio::test]
    async fn wrong_message_kind_is_permanent() {
        let handler = handler();
        let message = ChannelMessage::TaskDispatch(TaskDispatch {
            task_id: Uuid::new_v4(),
            payload: json!({}),
            fired_at: Utc::now(),
            correlation_id: CorrelationId::new(),
        });

        let err = handler.handle(&message, &context(&message)).await.unwrap_err();
        assert!(matches!(err, HandlerError::Permanent(_)));
    }
}
