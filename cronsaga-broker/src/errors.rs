use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("duplicate message for key {0}")]
    Duplicate(String),
    #[error("delivery not found: {0}")]
    UnknownDelivery(uuid::Uuid),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker storage error: {0}")]
    Storage(String),
    #[error("internal broker error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        BrokerError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Internal(err.to_string())
    }
}
