use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use cronsaga_broker::{Acknowledgement, Dispatcher};
use cronsaga_database::{StoreError, TaskStore};
use cronsaga_models::core::{CorrelationId, Task, TaskClaim};
use cronsaga_utilities::ComponentLogger;
use tokio::{
    sync::Notify,
    time::{self, MissedTickBehavior},
};

use crate::cron::CronCalculator;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    /// Due tasks fetched per tick.
    pub batch_size: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

/// What happened to one due task during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskTransition {
    Dispatched(Acknowledgement),
    /// The fire is committed but the message did not reach the broker.
    DispatchFailed,
    /// Another replica claimed this trigger instant first.
    ClaimLost,
    /// Not due or no longer active when processed.
    Skipped,
    /// The expression no longer parses; the task was switched off.
    Deactivated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub dispatched: usize,
    pub dispatch_failed: usize,
    pub claim_lost: usize,
    pub skipped: usize,
    pub deactivated: usize,
    pub errors: usize,
}

impl TickReport {
    fn record(&mut self, transition: &TaskTransition) {
        match transition {
            TaskTransition::Dispatched(_) => self.dispatched += 1,
            TaskTransition::DispatchFailed => self.dispatch_failed += 1,
            TaskTransition::ClaimLost => self.claim_lost += 1,
            TaskTransition::Skipped => self.skipped += 1,
            TaskTransition::Deactivated => self.deactivated += 1,
        }
    }
}

/// Periodic driver that claims due tasks and hands them to the dispatcher.
///
/// Several replicas may run against the same store; the claim is the only
/// coordination between them.
pub struct Scheduler<S: TaskStore> {
    store: Arc<S>,
    dispatcher: Dispatcher,
    cron: CronCalculator,
    settings: SchedulerSettings,
    logger: ComponentLogger,
}

impl<S: TaskStore> Scheduler<S> {
    pub fn new(
        store: Arc<S>,
        dispatcher: Dispatcher,
        cron: CronCalculator,
        settings: SchedulerSettings,
        logger: ComponentLogger,
    ) -> Self {
        Self {
            store,
            dispatcher,
            cron,
            settings,
            logger,
        }
    }

    /// Ticks until `shutdown` is notified. Failed ticks are logged and the
    /// loop carries on.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        let shutdown = shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();

        let mut ticker = time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.logger.info(
            None,
            format_args!(
                "Scheduler loop started (tick {:?}, batch {})",
                self.settings.tick_interval, self.settings.batch_size
            ),
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    self.logger.info(None, format_args!("Scheduler received shutdown signal."));
                    break;
                }
                _ = ticker.tick() => {
                    let start = time::Instant::now();
                    match self.run_iteration(Utc::now()).await {
                        Ok(report) if report.due > 0 => self.logger.info(
                            None,
                            format_args!(
                                "Tick handled {} due task(s) in {:.3}s: {:?}",
                                report.due,
                                start.elapsed().as_secs_f64(),
                                report
                            ),
                        ),
                        Ok(_) => {}
                        Err(err) => self
                            .logger
                            .error(None, format_args!("Scheduler tick failed: {}", err)),
                    }
                }
            }
        }
    }

    pub async fn run_iteration(&self, now: DateTime<Utc>) -> Result<TickReport, StoreError> {
        let tasks = self
            .store
            .fetch_due_tasks(now, self.settings.batch_size)
            .await?;

        let mut report = TickReport {
            due: tasks.len(),
            ..TickReport::default()
        };
        for task in tasks {
            let task_id = task.id;
            match self.process_task(task, now).await {
                Ok(transition) => report.record(&transition),
                Err(err) => {
                    report.errors += 1;
                    self.logger
                        .error(None, format_args!("Failed to process task {}: {}", task_id, err));
                }
            }
        }
        Ok(report)
    }

    /// Claims a single due task, advances its schedule from `now` and
    /// dispatches it. A failed dispatch does not roll back the claim.
    pub async fn process_task(&self, task: Task, now: DateTime<Utc>) -> Result<TaskTransition, StoreError> {
        if !task.is_due(now) {
            return Ok(TaskTransition::Skipped);
        }

        let next_run_at = match self.cron.compute_next_run(&task.cron_expression, now) {
            Ok(next) => next,
            Err(err) => {
                let reason = err.to_string();
                self.store.deactivate_task(task.id, &reason, now).await?;
                self.logger.error(
                    None,
                    format_args!("Deactivated task {} ({}): {}", task.id, task.name, reason),
                );
                return Ok(TaskTransition::Deactivated);
            }
        };

        let claim = TaskClaim::for_task(&task, now, next_run_at);
        if !self.store.claim_task(&claim).await? {
            self.logger.debug(
                None,
                format_args!("Task {} already claimed for {}", task.id, task.next_run_at),
            );
            return Ok(TaskTransition::ClaimLost);
        }

        let correlation = CorrelationId::new();
        self.logger.debug(
            Some(&correlation),
            format_args!("Claimed task {} ({}), next run at {}", task.id, task.name, next_run_at),
        );

        match self
            .dispatcher
            .dispatch(task.id, task.payload, now, correlation)
            .await
        {
            Ok(ack) => {
                self.logger.info(
                    Some(&correlation),
                    format_args!("Dispatched task {} ({})", task.id, task.name),
                );
                Ok(TaskTransition::Dispatched(ack))
            }
            Err(err) => {
                self.logger.warn(
                    Some(&correlation),
                    format_args!(
                        "Dispatch of task {} failed, next attempt at {}: {}",
                        task.id, next_run_at, err
                    ),
                );
                Ok(TaskTransition::DispatchFailed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use cronsaga_broker::{
        in_memory::InMemoryBroker, Broker, ConnectionHandle, ConnectionMonitor, ConnectionStatus,
        DispatchSettings,
    };
    use cronsaga_comm::ChannelMessage;
    use cronsaga_database::in_memory::InMemoryTaskStore;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn task(expression: &str, next_run_at: DateTime<Utc>) -> Task {
        let created = next_run_at - ChronoDuration::days(30);
        Task {
            id: Uuid::new_v4(),
            name: format!("task-{expression}"),
            cron_expression: expression.into(),
            payload: json!({"expression": expression}),
            next_run_at,
            last_run_at: None,
            is_active: true,
            created_at: created,
            updated_at: created,
            deactivated_at: None,
            deactivation_reason: None,
            revision: 0,
        }
    }

    fn scheduler_with(
        store: Arc<InMemoryTaskStore>,
        broker: &InMemoryBroker,
        connection: ConnectionHandle,
    ) -> Scheduler<InMemoryTaskStore> {
        let logger = ComponentLogger::new("cronsaga-scheduler", "scheduler-loop");
        let dispatcher = Dispatcher::new(
            Arc::new(broker.clone()),
            connection,
            DispatchSettings::default(),
            logger.child("dispatcher"),
        );
        Scheduler::new(
            store,
            dispatcher,
            CronCalculator::new(),
            SchedulerSettings::default(),
            logger,
        )
    }

    fn scheduler(store: Arc<InMemoryTaskStore>, broker: &InMemoryBroker) -> Scheduler<InMemoryTaskStore> {
        scheduler_with(store, broker, ConnectionMonitor::always_connected())
    }

    #[tokio::test]
    async fn due_task_is_claimed_advanced_and_dispatched() {
        let store = Arc::new(InMemoryTaskStore::new());
        let broker = InMemoryBroker::new();
        let now = Utc::now();
        let due = task("*/5 * * * *", now - ChronoDuration::minutes(1));
        store.insert_task(&due).await.unwrap();

        let report = scheduler(store.clone(), &broker).run_iteration(now).await.unwrap();

        assert_eq!(report.dispatched, 1);
        let stored = store.get_task(due.id).await.unwrap().unwrap();
        assert_eq!(stored.last_run_at, Some(now));
        assert!(stored.next_run_at > now);

        let delivery = broker.poll("tasks", "worker").await.unwrap().unwrap();
        match delivery.body {
            ChannelMessage::TaskDispatch(dispatch) => {
                assert_eq!(dispatch.task_id, due.id);
                assert_eq!(dispatch.payload, due.payload);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn missed_intervals_fire_once_after_downtime() {
        let store = Arc::new(InMemoryTaskStore::new());
        let broker = InMemoryBroker::new();
        let now = Utc::now();
        let stale = task("0 * * * *", now - ChronoDuration::days(3));
        store.insert_task(&stale).await.unwrap();
        let scheduler = scheduler(store.clone(), &broker);

        let first = scheduler.run_iteration(now).await.unwrap();
        let second = scheduler.run_iteration(now).await.unwrap();

        assert_eq!(first.dispatched, 1);
        assert_eq!(second.due, 0);
        assert_eq!(broker.depth("tasks"), 1);
    }

    #[tokio::test]
    async fn deactivated_task_is_never_dispatched() {
        let store = Arc::new(InMemoryTaskStore::new());
        let broker = InMemoryBroker::new();
        let now = Utc::now();
        let due = task("* * * * *", now - ChronoDuration::hours(1));
        store.insert_task(&due).await.unwrap();
        store.deactivate_task(due.id, "retired", now).await.unwrap();
        let scheduler = scheduler(store.clone(), &broker);

        let report = scheduler.run_iteration(now).await.unwrap();
        assert_eq!(report.due, 0);

        // a copy fetched before the switch-off loses the claim
        let transition = scheduler.process_task(due, now).await.unwrap();
        assert_eq!(transition, TaskTransition::ClaimLost);
        assert_eq!(broker.depth("tasks"), 0);
    }

    #[tokio::test]
    async fn corrupted_expression_deactivates_only_that_task() {
        let store = Arc::new(InMemoryTaskStore::new());
        let broker = InMemoryBroker::new();
        let now = Utc::now();
        let broken = task("every tuesday-ish", now - ChronoDuration::minutes(2));
        let healthy = task("*/5 * * * *", now - ChronoDuration::minutes(1));
        store.insert_task(&broken).await.unwrap();
        store.insert_task(&healthy).await.unwrap();

        let report = scheduler(store.clone(), &broker).run_iteration(now).await.unwrap();

        assert_eq!(report.deactivated, 1);
        assert_eq!(report.dispatched, 1);
        let broken = store.get_task(broken.id).await.unwrap().unwrap();
        assert!(!broken.is_active);
        assert!(broken.deactivation_reason.is_some());
    }

    #[tokio::test]
    async fn failed_dispatch_keeps_the_claim() {
        let store = Arc::new(InMemoryTaskStore::new());
        let broker = InMemoryBroker::new();
        let now = Utc::now();
        let due = task("*/5 * * * *", now - ChronoDuration::minutes(1));
        store.insert_task(&due).await.unwrap();
        let (_tx, rx) = tokio::sync::watch::channel(ConnectionStatus::Reconnecting { attempt: 1 });
        let scheduler = scheduler_with(store.clone(), &broker, ConnectionHandle::new(rx));

        let report = scheduler.run_iteration(now).await.unwrap();

        assert_eq!(report.dispatch_failed, 1);
        assert_eq!(broker.depth("tasks"), 0);
        let stored = store.get_task(due.id).await.unwrap().unwrap();
        assert_eq!(stored.last_run_at, Some(now));
        assert!(!stored.is_due(now));
    }

    #[tokio::test]
    async fn racing_replicas_dispatch_once() {
        let store = Arc::new(InMemoryTaskStore::new());
        let broker = InMemoryBroker::new();
        let now = Utc::now();
        let due = task("*/5 * * * *", now - ChronoDuration::minutes(1));
        store.insert_task(&due).await.unwrap();

        let first = scheduler(store.clone(), &broker);
        let second = scheduler(store.clone(), &broker);
        let (a, b) = tokio::join!(
            first.process_task(due.clone(), now),
            second.process_task(due.clone(), now)
        );
        let transitions = [a.unwrap(), b.unwrap()];

        let dispatched = transitions
            .iter()
            .filter(|t| matches!(t, TaskTransition::Dispatched(_)))
            .count();
        assert_eq!(dispatched, 1);
        assert!(transitions.contains(&TaskTransition::ClaimLost));
        assert_eq!(broker.depth("tasks"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_until_shutdown() {
        let store = Arc::new(InMemoryTaskStore::new());
        let broker = InMemoryBroker::new();
        let due = task("*/5 * * * *", Utc::now() - ChronoDuration::minutes(1));
        store.insert_task(&due).await.unwrap();
        let scheduler = Arc::new(scheduler(store.clone(), &broker));
        let shutdown = Arc::new(Notify::new());

        let handle = {
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        time::sleep(Duration::from_secs(1)).await;
        shutdown.notify_waiters();
        handle.await.unwrap();

        assert_eq!(broker.depth("tasks"), 1);
    }
}
