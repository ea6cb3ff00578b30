use std::sync::Arc;

use chrono::{DateTime, Utc};
use cronsaga_database::{StoreError, TaskStore};
use cronsaga_models::core::{NewTask, Task, TaskUpdate};
use cronsaga_utilities::ComponentLogger;
use thiserror::Error;
use uuid::Uuid;

use crate::cron::{CronCalculator, CronError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidCron(#[from] CronError),
    #[error("task {0} not found")]
    NotFound(Uuid),
    #[error("task {0} was modified concurrently")]
    Conflict(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Administrative surface over the task store. Every write validates the
/// cron expression before anything is persisted.
pub struct TaskRegistry<S: TaskStore> {
    store: Arc<S>,
    cron: CronCalculator,
    logger: ComponentLogger,
}

impl<S: TaskStore> TaskRegistry<S> {
    pub fn new(store: Arc<S>, cron: CronCalculator, logger: ComponentLogger) -> Self {
        Self { store, cron, logger }
    }

    pub async fn register(&self, new_task: NewTask, now: DateTime<Utc>) -> Result<Task, RegistryError> {
        let expression = new_task.cron_expression.trim().to_string();
        let next_run_at = self.cron.compute_next_run(&expression, now)?;

        let task = Task {
            id: Uuid::new_v4(),
            name: new_task.name,
            cron_expression: expression,
            payload: new_task.payload,
            next_run_at,
            last_run_at: None,
            is_active: true,
            created_at: now,
            updated_at: now,
            deactivated_at: None,
            deactivation_reason: None,
            revision: 0,
        };
        self.store.insert_task(&task).await?;

        self.logger.info(
            None,
            format_args!(
                "Registered task {} ({}) '{}', next run at {}",
                task.id, task.name, task.cron_expression, task.next_run_at
            ),
        );
        Ok(task)
    }

    /// Applies `update` if the task has not changed since it was read.
    ///
    /// Changing the expression or reactivating the task recomputes the next
    /// run from the last fire (or creation) instant.
    pub async fn update(
        &self,
        id: Uuid,
        update: TaskUpdate,
        now: DateTime<Utc>,
    ) -> Result<Task, RegistryError> {
        let current = self.get(id).await?;
        let mut task = current.clone();

        if let Some(name) = update.name {
            task.name = name;
        }
        if let Some(payload) = update.payload {
            task.payload = payload;
        }
        let mut reschedule = false;
        if let Some(expression) = update.cron_expression {
            let expression = expression.trim().to_string();
            if !self.cron.is_valid(&expression) {
                // surface the parse error itself
                self.cron.compute_next_run(&expression, now)?;
            }
            reschedule |= expression != current.cron_expression;
            task.cron_expression = expression;
        }
        match update.is_active {
            Some(true) if !current.is_active => {
                task.is_active = true;
                task.deactivated_at = None;
                task.deactivation_reason = None;
                reschedule = true;
            }
            Some(false) if current.is_active => {
                task.is_active = false;
                task.deactivated_at = Some(now);
                task.deactivation_reason = Some("deactivated by update".into());
            }
            _ => {}
        }
        if reschedule {
            task.next_run_at = self
                .cron
                .compute_next_run(&task.cron_expression, task.schedule_anchor())?;
        }
        task.updated_at = now;

        if !self.store.update_task(&task).await? {
            return Err(RegistryError::Conflict(id));
        }
        task.revision += 1;

        self.logger.info(
            None,
            format_args!(
                "Updated task {} '{}', active {}, next run at {}",
                task.id, task.cron_expression, task.is_active, task.next_run_at
            ),
        );
        Ok(task)
    }

    /// Soft-deletes the task. Deactivating an inactive task is a no-op.
    pub async fn deactivate(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<Task, RegistryError> {
        if self.store.deactivate_task(id, reason, now).await? {
            self.logger.info(None, format_args!("Deactivated task {}: {}", id, reason));
        }
        self.get(id).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Task, RegistryError> {
        self.store
            .get_task(id)
            .await?
            .ok_or(RegistryError::NotFound(id))
    }

    pub async fn list_active(&self) -> Result<Vec<Task>, RegistryError> {
        Ok(self.store.list_active_tasks().await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use cronsaga_database::in_memory::InMemoryTaskStore;
    use serde_json::json;

    use super::*;

    fn registry() -> (TaskRegistry<InMemoryTaskStore>, Arc<InMemoryTaskStore>) {
        let store = Arc::new(InMemoryTaskStore::new());
        let registry = TaskRegistry::new(
            store.clone(),
            CronCalculator::new(),
            ComponentLogger::new("cronsaga-scheduler", "registry"),
        );
        (registry, store)
    }

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    fn nightly() -> NewTask {
        NewTask {
            name: "nightly-report".into(),
            cron_expression: "0 2 * * *".into(),
            payload: json!({"report": "sales"}),
        }
    }

    #[tokio::test]
    async fn register_computes_first_run() {
        let (registry, _) = registry();

        let task = registry.register(nightly(), reference()).await.unwrap();

        assert_eq!(task.next_run_at, Utc.with_ymd_and_hms(2024, 1, 2, 2, 0, 0).unwrap());
        assert!(task.is_active);
        assert_eq!(registry.get(task.id).await.unwrap(), task);
    }

    #[tokio::test]
    async fn invalid_expression_is_never_persisted() {
        let (registry, store) = registry();
        let mut new_task = nightly();
        new_task.cron_expression = "invalid".into();

        let err = registry.register(new_task, reference()).await.unwrap_err();

        assert!(matches!(err, RegistryError::InvalidCron(_)));
        assert!(store.list_active_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_with_new_expression_reschedules() {
        let (registry, _) = registry();
        let task = registry.register(nightly(), reference()).await.unwrap();

        let update = TaskUpdate {
            cron_expression: Some("0 12 * * *".into()),
            ..TaskUpdate::default()
        };
        let updated = registry.update(task.id, update, reference()).await.unwrap();

        assert_eq!(updated.next_run_at, Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        assert_eq!(updated.revision, task.revision + 1);
        assert_eq!(registry.get(task.id).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn update_rejects_invalid_expression() {
        let (registry, _) = registry();
        let task = registry.register(nightly(), reference()).await.unwrap();

        let update = TaskUpdate {
            cron_expression: Some("not a cron".into()),
            ..TaskUpdate::default()
        };
        let err = registry.update(task.id, update, reference()).await.unwrap_err();

        assert!(matches!(err, RegistryError::InvalidCron(_)));
        assert_eq!(registry.get(task.id).await.unwrap().cron_expression, "0 2 * * *");
    }

    #[tokio::test]
    async fn deactivated_task_leaves_active_listing() {
        let (registry, _) = registry();
        let task = registry.register(nightly(), reference()).await.unwrap();

        let deactivated = registry
            .deactivate(task.id, "retired", reference())
            .await
            .unwrap();

        assert!(!deactivated.is_active);
        assert_eq!(deactivated.deactivation_reason.as_deref(), Some("retired"));
        assert!(registry.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (registry, _) = registry();
        let err = registry.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }
}
