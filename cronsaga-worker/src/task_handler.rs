use async_trait::async_trait;
use cronsaga_comm::ChannelMessage;
use cronsaga_utilities::ComponentLogger;
use reqwest::{Client, Url};

use crate::{
    effect::{EffectResponse, post_effect},
    handler::{DeliveryContext, HandlerError, MessageHandler},
};

/// Delivers fired tasks to a webhook. Without a webhook the fire is only logged.
pub struct HttpTaskHandler {
    client: Client,
    webhook: Option<Url>,
    logger: ComponentLogger,
}

impl HttpTaskHandler {
    pub fn new(client: Client, webhook: Option<Url>, logger: ComponentLogger) -> Self {
        Self {
            client,
            webhook,
            logger,
        }
    }
}

#[async_trait]
impl MessageHandler for HttpTaskHandler {
    async fn handle(&self, message: &ChannelMessage, context: &DeliveryContext) -> Result<(), HandlerError> {
        let ChannelMessage::TaskDispatch(dispatch) = message else {
            return Err(HandlerError::Permanent(format!(
                "task handler cannot process {}",
                message.kind()
            )));
        };

        let Some(webhook) = &self.webhook else {
            self.logger.info(
                Some(&context.correlation_id),
                format_args!(
                    "Task {} fired at {} with payload {}",
                    dispatch.task_id, dispatch.fired_at, dispatch.payload
                ),
            );
            return Ok(());
        };

        match post_effect(&self.client, webhook.clone(), context, dispatch).await? {
            EffectResponse::Applied(_) => {
                self.logger.info(
                    Some(&context.correlation_id),
                    format_args!(
                        "Task {} delivered to {} (attempt {})",
                        dispatch.task_id, webhook, context.attempt
                    ),
                );
                Ok(())
            }
            EffectResponse::Refused(reason) => Err(HandlerError::Permanent(reason)),
        }
    }
}
