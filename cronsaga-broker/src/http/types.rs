use crate::{BrokerDelivery, BrokerMessage, DeadLetter};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishRequest {
    pub message: BrokerMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollRequest {
    pub queue: String,
    pub consumer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollResponse {
    pub delivery: Option<BrokerDelivery>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckRequest {
    pub consumer: String,
    pub delivery_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RejectRequest {
    pub consumer: String,
    pub delivery_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeadLettersRequest {
    pub queue: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeadLettersResponse {
    pub dead_letters: Vec<DeadLetter>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}
