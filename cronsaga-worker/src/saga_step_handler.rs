use std::collections::HashMap;

use async_trait::async_trait;
use cronsaga_broker::Dispatcher;
use cronsaga_comm::{ChannelMessage, SagaStepMessage, StepResult};
use cronsaga_utilities::ComponentLogger;
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::Value;

use crate::{
    effect::{EffectResponse, post_effect},
    handler::{DeliveryContext, HandlerError, MessageHandler},
};

/// Body POSTed to `<service-url>/<action>`.
#[derive(Debug, Serialize)]
struct StepRequest<'a> {
    saga_id: uuid::Uuid,
    step_id: &'a str,
    phase: cronsaga_comm::StepPhase,
    payload: &'a Value,
}

/// Executes saga actions against the owning service and reports the outcome
/// on the message's `reply_to` queue.
///
/// A refused request becomes a failed outcome; only transport problems and
/// 5xx answers leave the delivery for redelivery. Once a delivery reaches
/// `max_attempts` those are reported as a failed outcome too, so the saga
/// compensates instead of waiting on a dead-lettered message.
pub struct SagaStepHandler {
    client: Client,
    endpoints: HashMap<String, Url>,
    dispatcher: Dispatcher,
    max_attempts: u32,
    logger: ComponentLogger,
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

impl SagaStepHandler {
    pub fn new(
        client: Client,
        endpoints: HashMap<String, Url>,
        dispatcher: Dispatcher,
        logger: ComponentLogger,
    ) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|(service, mut url)| {
                if !url.path().ends_with('/') {
                    let path = format!("{}/", url.path());
                    url.set_path(&path);
                }
                (service, url)
            })
            .collect();
        Self {
            client,
            endpoints,
            dispatcher,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            logger,
        }
    }

    /// Should match the broker's max deliveries for the saga queue.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn action_url(&self, step: &SagaStepMessage) -> Result<Url, String> {
        let base = self
            .endpoints
            .get(&step.service)
            .ok_or_else(|| format!("no endpoint configured for service '{}'", step.service))?;
        base.join(step.action.trim_start_matches('/'))
            .map_err(|err| format!("invalid action '{}': {}", step.action, err))
    }

    async fn execute(&self, step: &SagaStepMessage, context: &DeliveryContext) -> Result<StepResult, HandlerError> {
        let url = match self.action_url(step) {
            Ok(url) => url,
            Err(error) => return Ok(StepResult::Failed { error }),
        };
        let request = StepRequest {
            saga_id: step.saga_id,
            step_id: &step.step_id,
            phase: step.phase,
            payload: &step.payload,
        };

        Ok(match post_effect(&self.client, url, context, &request).await? {
            EffectResponse::Applied(output) => StepResult::Completed { output },
            EffectResponse::Refused(error) => StepResult::Failed { error },
        })
    }
}

#[async_trait]
impl MessageHandler for SagaStepHandler {
    async fn handle(&self, message: &ChannelMessage, context: &DeliveryContext) -> Result<(), HandlerError> {
        let ChannelMessage::SagaStep(step) = message else {
            return Err(HandlerError::Permanent(format!(
                "saga step handler cannot process {}",
                message.kind()
            )));
        };

        let result = match self.execute(step, context).await {
            Ok(result) => result,
            Err(HandlerError::Transient(reason)) if context.attempt >= self.max_attempts => {
                StepResult::Failed {
                    error: format!("gave up after {} attempt(s): {}", context.attempt, reason),
                }
            }
            Err(err) => return Err(err),
        };
        match &result {
            StepResult::Completed { .. } => self.logger.info(
                Some(&context.correlation_id),
                format_args!(
                    "Saga {} step {} ({}) {} completed on {}",
                    step.saga_id, step.step_id, step.phase, step.action, step.service
                ),
            ),
            StepResult::Failed { error } => self.logger.warn(
                Some(&context.correlation_id),
                format_args!(
                    "Saga {} step {} ({}) {} failed on {}: {}",
                    step.saga_id, step.step_id, step.phase, step.action, step.service, error
                ),
            ),
        }

        self.dispatcher
            .publish_outcome(&step.reply_to, step.outcome(result))
            .await
            .map(|_| ())
            .map_err(|err| HandlerError::Transient(format!("outcome not published: {err}")))
    }
}
