use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use serde_json::Value;

use crate::handler::{DeliveryContext, HandlerError};

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-Id";

/// What the downstream service made of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum EffectResponse {
    /// 2xx, with the JSON body if there was one.
    Applied(Value),
    /// 4xx: the service refused the request and will keep refusing it.
    Refused(String),
}

/// POSTs `body` to `url` carrying the delivery's dedupe key so the service
/// can discard redeliveries. 5xx answers and transport errors are transient.
pub async fn post_effect<T>(
    client: &Client,
    url: Url,
    context: &DeliveryContext,
    body: &T,
) -> Result<EffectResponse, HandlerError>
where
    T: Serialize + ?Sized,
{
    let response = client
        .post(url.clone())
        .header(IDEMPOTENCY_KEY_HEADER, &context.dedupe_key)
        .header(CORRELATION_ID_HEADER, context.correlation_id.to_string())
        .json(body)
        .send()
        .await
        .map_err(|err| HandlerError::Transient(format!("POST {url} failed: {err}")))?;

    let status = response.status();
    if status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let output = serde_json::from_str(&text).unwrap_or(Value::Null);
        return Ok(EffectResponse::Applied(output));
    }

    let text = response.text().await.unwrap_or_default();
    let detail = if text.trim().is_empty() {
        format!("{url} answered {status}")
    } else {
        format!("{url} answered {status}: {}", text.trim())
    };

    if status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT && status != StatusCode::TOO_MANY_REQUESTS {
        Ok(EffectResponse::Refused(detail))
    } else {
        Err(HandlerError::Transient(detail))
    }
}
