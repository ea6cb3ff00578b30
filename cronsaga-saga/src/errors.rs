use cronsaga_broker::DispatchError;
use cronsaga_database::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SagaError {
    #[error("saga {0} not found")]
    NotFound(Uuid),
    #[error("saga {saga_id} has no step '{step_id}'")]
    UnknownStep { saga_id: Uuid, step_id: String },
    #[error("invalid saga definition: {0}")]
    InvalidDefinition(String),
    #[error("saga {0} kept changing underneath the coordinator")]
    Conflict(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
