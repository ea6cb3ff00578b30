use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("record already exists: {0}")]
    AlreadyExists(Uuid),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}
