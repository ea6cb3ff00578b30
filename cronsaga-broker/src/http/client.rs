use crate::{
    http::types::{
        AckRequest, DeadLettersRequest, DeadLettersResponse, ErrorResponse, PollRequest,
        PollResponse, PublishRequest, RejectRequest,
    },
    Broker, BrokerDelivery, BrokerError, BrokerMessage, DeadLetter,
};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Serialize;
use tokio::time::Duration;
use uuid::Uuid;

/// [`Broker`] implementation talking to a remote `cronsaga-broker` process.
#[derive(Clone)]
pub struct HttpBroker {
    client: Client,
    base_url: Url,
    default_poll_timeout: Duration,
}

impl HttpBroker {
    pub fn new(base_url: Url, client: Client, default_poll_timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            default_poll_timeout,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, BrokerError> {
        self.base_url
            .join(path)
            .map_err(|err| BrokerError::Internal(err.to_string()))
    }

    async fn post<T>(&self, path: &str, body: &T) -> Result<Response, BrokerError>
    where
        T: Serialize + Sync,
    {
        let url = self.endpoint(path)?;
        self.client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)
    }

    async fn expect_ok(&self, path: &str, response: Response) -> Result<(), BrokerError> {
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            _ => Err(remote_error(path, response).await),
        }
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        let dedupe_key = message.dedupe_key_or_derived();
        let response = self.post("publish", &PublishRequest { message }).await?;

        match response.status() {
            StatusCode::CONFLICT => Err(BrokerError::Duplicate(dedupe_key)),
            _ => self.expect_ok("publish", response).await,
        }
    }

    async fn poll(&self, queue: &str, consumer: &str) -> Result<Option<BrokerDelivery>, BrokerError> {
        let request = PollRequest {
            queue: queue.to_string(),
            consumer: consumer.to_string(),
            timeout_ms: Some(self.default_poll_timeout.as_millis() as u64),
        };
        let response = self.post("poll", &request).await?;

        match response.status() {
            StatusCode::OK => {
                let payload = response
                    .json::<PollResponse>()
                    .await
                    .map_err(|err| BrokerError::Internal(err.to_string()))?;
                Ok(payload.delivery)
            }
            StatusCode::NO_CONTENT => Ok(None),
            _ => Err(remote_error("poll", response).await),
        }
    }

    async fn ack(&self, consumer: &str, delivery_id: Uuid) -> Result<(), BrokerError> {
        let request = AckRequest {
            consumer: consumer.to_string(),
            delivery_id,
        };
        let response = self.post("ack", &request).await?;
        self.expect_ok("ack", response).await
    }

    async fn nack(&self, consumer: &str, delivery_id: Uuid) -> Result<(), BrokerError> {
        let request = AckRequest {
            consumer: consumer.to_string(),
            delivery_id,
        };
        let response = self.post("nack", &request).await?;
        self.expect_ok("nack", response).await
    }

    async fn reject(
        &self,
        consumer: &str,
        delivery_id: Uuid,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let request = RejectRequest {
            consumer: consumer.to_string(),
            delivery_id,
            reason: reason.to_string(),
        };
        let response = self.post("reject", &request).await?;
        self.expect_ok("reject", response).await
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, BrokerError> {
        let request = DeadLettersRequest {
            queue: queue.to_string(),
        };
        let response = self.post("dead_letters", &request).await?;

        match response.status() {
            StatusCode::OK => {
                let payload = response
                    .json::<DeadLettersResponse>()
                    .await
                    .map_err(|err| BrokerError::Internal(err.to_string()))?;
                Ok(payload.dead_letters)
            }
            _ => Err(remote_error("dead_letters", response).await),
        }
    }

    async fn heartbeat(&self) -> Result<(), BrokerError> {
        let url = self.endpoint("health")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(transport_error)?;
        self.expect_ok("health", response).await
    }
}

fn transport_error(err: reqwest::Error) -> BrokerError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        BrokerError::Unavailable(err.to_string())
    } else {
        BrokerError::Internal(err.to_string())
    }
}

async fn remote_error(path: &str, response: Response) -> BrokerError {
    let status = response.status();
    let body = response.json::<ErrorResponse>().await.ok();
    let message = body
        .as_ref()
        .map(|body| body.message.clone())
        .unwrap_or_else(|| format!("unexpected {path} status: {status}"));

    match (status, body.as_ref().map(|body| body.code.as_str())) {
        (StatusCode::CONFLICT, _) => BrokerError::Duplicate(message),
        (StatusCode::NOT_FOUND, Some("unknown_delivery")) => match message.parse::<Uuid>() {
            Ok(id) => BrokerError::UnknownDelivery(id),
            Err(_) => BrokerError::Internal(message),
        },
        (StatusCode::SERVICE_UNAVAILABLE, _) => BrokerError::Unavailable(message),
        (_, Some("storage")) => BrokerError::Storage(message),
        _ => BrokerError::Internal(message),
    }
}
