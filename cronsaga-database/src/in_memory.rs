use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use cronsaga_models::{
    core::{Task, TaskClaim},
    saga::{SagaState, SagaStatus},
};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    StoreError,
    interfaces::{SagaStore, TaskStore},
};

/// Process-local task store. The mutex makes each conditional write atomic,
/// which is what the scheduler relies on from any backend.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    tasks: Arc<Mutex<HashMap<Uuid, Task>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for InMemoryTaskStore {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut guard = self.tasks.lock();
        if guard.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists(task.id));
        }
        guard.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.lock().get(&id).cloned())
    }

    async fn list_active_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let mut active: Vec<Task> = self
            .tasks
            .lock()
            .values()
            .filter(|task| task.is_active)
            .cloned()
            .collect();
        active.sort_by_key(|task| task.next_run_at);
        Ok(active)
    }

    async fn fetch_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let mut due: Vec<Task> = self
            .tasks
            .lock()
            .values()
            .filter(|task| task.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|task| task.next_run_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_task(&self, claim: &TaskClaim) -> Result<bool, StoreError> {
        let mut guard = self.tasks.lock();
        let Some(task) = guard.get_mut(&claim.task_id) else {
            return Ok(false);
        };
        let claimable = task.is_active
            && task.next_run_at == claim.expected_next_run_at
            && task.next_run_at <= claim.claimed_at
            && task.revision == claim.expected_revision;
        if !claimable {
            return Ok(false);
        }
        *task = claim.apply(task);
        Ok(true)
    }

    async fn update_task(&self, task: &Task) -> Result<bool, StoreError> {
        let mut guard = self.tasks.lock();
        match guard.get_mut(&task.id) {
            Some(stored) if stored.revision == task.revision => {
                let mut updated = task.clone();
                // scheduling history belongs to the claim path
                updated.last_run_at = stored.last_run_at;
                updated.created_at = stored.created_at;
                updated.revision = stored.revision + 1;
                *stored = updated;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn deactivate_task(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut guard = self.tasks.lock();
        match guard.get_mut(&id) {
            Some(task) if task.is_active => {
                task.is_active = false;
                task.deactivated_at = Some(at);
                task.deactivation_reason = Some(reason.to_string());
                task.updated_at = at;
                task.revision += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    sagas: Arc<Mutex<HashMap<Uuid, SagaState>>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SagaStore for InMemorySagaStore {
    async fn insert_saga(&self, saga: &SagaState) -> Result<(), StoreError> {
        let mut guard = self.sagas.lock();
        if guard.contains_key(&saga.saga_id) {
            return Err(StoreError::AlreadyExists(saga.saga_id));
        }
        guard.insert(saga.saga_id, saga.clone());
        Ok(())
    }

    async fn load_saga(&self, id: Uuid) -> Result<Option<SagaState>, StoreError> {
        Ok(self.sagas.lock().get(&id).cloned())
    }

    async fn save_saga(&self, saga: &SagaState) -> Result<bool, StoreError> {
        let mut guard = self.sagas.lock();
        match guard.get_mut(&saga.saga_id) {
            Some(stored) if stored.version == saga.version => {
                let mut updated = saga.clone();
                updated.version = saga.version + 1;
                *stored = updated;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_sagas_by_status(&self, status: SagaStatus) -> Result<Vec<SagaState>, StoreError> {
        let mut matching: Vec<SagaState> = self
            .sagas
            .lock()
            .values()
            .filter(|saga| saga.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|saga| saga.created_at);
        Ok(matching)
    }
}
