use std::future::Future;

use chrono::{DateTime, Utc};
use cronsaga_models::{
    core::{Task, TaskClaim},
    saga::{SagaState, SagaStatus},
};
use uuid::Uuid;

use crate::StoreError;

// Implementors are shared across scheduler replicas and tasks; every
// mutation must be a single conditional statement, never read-then-write.
pub trait TaskStore: Send + Sync + 'static {
    fn insert_task(&self, task: &Task) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_task(&self, id: Uuid) -> impl Future<Output = Result<Option<Task>, StoreError>> + Send;

    fn list_active_tasks(&self) -> impl Future<Output = Result<Vec<Task>, StoreError>> + Send;

    /// Active tasks whose `next_run_at <= now`, earliest first.
    fn fetch_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Task>, StoreError>> + Send;

    /// Compare-and-swap on `(is_active, next_run_at, revision)`. Returns
    /// `false` when another replica already claimed this trigger instant or
    /// the task changed underneath the caller.
    fn claim_task(&self, claim: &TaskClaim) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Writes the administrative fields of `task` if the stored revision is
    /// still `task.revision`; the stored revision is then bumped.
    fn update_task(&self, task: &Task) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn deactivate_task(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

pub trait SagaStore: Send + Sync + 'static {
    fn insert_saga(&self, saga: &SagaState) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn load_saga(&self, id: Uuid) -> impl Future<Output = Result<Option<SagaState>, StoreError>> + Send;

    /// Persists `saga` if the stored version still equals `saga.version`.
    /// On success the stored copy carries `saga.version + 1`.
    fn save_saga(&self, saga: &SagaState) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn list_sagas_by_status(
        &self,
        status: SagaStatus,
    ) -> impl Future<Output = Result<Vec<SagaState>, StoreError>> + Send;
}
