use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use cronsaga_broker::Dispatcher;
use cronsaga_comm::{SagaStepMessage, SagaStepOutcome, StepPhase, StepResult};
use cronsaga_database::SagaStore;
use cronsaga_models::{
    core::CorrelationId,
    saga::{CompensationStatus, SagaState, SagaStatus, StepStatus},
};
use cronsaga_utilities::ComponentLogger;
use serde_json::Value;
use tokio::{
    sync::Notify,
    time::{self, MissedTickBehavior},
};
use uuid::Uuid;

use crate::{definition::SagaDefinition, errors::SagaError};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Queue the coordinator consumes step outcomes from.
    pub reply_to: String,
    /// Reload-and-reapply attempts when a save loses the version check.
    pub max_conflict_retries: u32,
    /// A dispatched action with no outcome after this long is treated as failed.
    pub step_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            reply_to: "saga-outcomes".into(),
            max_conflict_retries: 5,
            step_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// What one [`SagaCoordinator::sweep`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub inspected: usize,
    pub dispatched: usize,
    pub timed_out: usize,
    pub errors: usize,
}

/// The one action a saga is waiting on, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAction {
    Forward(usize),
    Compensate(usize),
}

/// Drives sagas forward on step outcomes and walks compensations back on failure.
///
/// Every state change is saved with a version check before the next action
/// is dispatched, so concurrent coordinators never both advance a saga.
pub struct SagaCoordinator<S: SagaStore> {
    store: Arc<S>,
    dispatcher: Dispatcher,
    settings: CoordinatorSettings,
    logger: ComponentLogger,
}

impl<S: SagaStore> SagaCoordinator<S> {
    pub fn new(
        store: Arc<S>,
        dispatcher: Dispatcher,
        settings: CoordinatorSettings,
        logger: ComponentLogger,
    ) -> Self {
        Self {
            store,
            dispatcher,
            settings,
            logger,
        }
    }

    /// Persists a new PENDING saga and dispatches its first step. A saga
    /// without steps completes immediately.
    ///
    /// A failed first dispatch is logged, not returned: the saga is already
    /// stored and [`SagaCoordinator::resume`] picks it up.
    pub async fn start(&self, definition: SagaDefinition) -> Result<SagaState, SagaError> {
        definition.validate()?;
        let now = Utc::now();
        let mut saga = definition.into_state(now);
        if saga.steps.is_empty() {
            saga.transition(SagaStatus::Completed, now);
        }
        self.store.insert_saga(&saga).await?;

        let correlation = correlation(&saga);
        self.logger.info(
            Some(&correlation),
            format_args!(
                "Started saga {} ({}) with {} step(s)",
                saga.saga_id,
                saga.transaction_type,
                saga.steps.len()
            ),
        );

        match self.advance(saga.clone()).await {
            Ok(saga) => Ok(saga),
            Err(SagaError::Dispatch(err)) => {
                self.logger.warn(
                    Some(&correlation),
                    format_args!("First step of saga {} not dispatched: {}", saga.saga_id, err),
                );
                Ok(saga)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn handle_outcome(&self, outcome: &SagaStepOutcome) -> Result<SagaState, SagaError> {
        let saga_id = outcome.saga_id;
        let step_id = outcome.step_id.as_str();
        match (&outcome.phase, &outcome.result) {
            (StepPhase::Forward, StepResult::Completed { output }) => {
                self.on_step_completed(saga_id, step_id, output.clone()).await
            }
            (StepPhase::Forward, StepResult::Failed { error }) => {
                self.on_step_failed(saga_id, step_id, error).await
            }
            (StepPhase::Compensate, StepResult::Completed { .. }) => {
                self.on_compensation_completed(saga_id, step_id).await
            }
            (StepPhase::Compensate, StepResult::Failed { error }) => {
                self.on_compensation_failed(saga_id, step_id, error).await
            }
        }
    }

    pub async fn on_step_completed(
        &self,
        saga_id: Uuid,
        step_id: &str,
        output: Value,
    ) -> Result<SagaState, SagaError> {
        let (saga, applied) = self
            .mutate(saga_id, |saga| {
                let index = step_of(saga, step_id)?;
                if saga.status != SagaStatus::Pending
                    || index != saga.current_step
                    || saga.steps[index].status != StepStatus::Pending
                {
                    return Ok(false);
                }
                let now = Utc::now();
                let step = &mut saga.steps[index];
                step.status = StepStatus::Completed;
                step.result = Some(output.clone());
                step.completed_at = Some(now);
                saga.current_step = index + 1;
                if saga.current_step == saga.steps.len() {
                    saga.transition(SagaStatus::Completed, now);
                }
                Ok(true)
            })
            .await?;

        self.log_applied(&saga, applied, step_id, "completed");
        self.advance(saga).await
    }

    /// Fails the step and starts the reverse walk over completed steps.
    pub async fn on_step_failed(
        &self,
        saga_id: Uuid,
        step_id: &str,
        error: &str,
    ) -> Result<SagaState, SagaError> {
        let (saga, applied) = self
            .mutate(saga_id, |saga| {
                let index = step_of(saga, step_id)?;
                if saga.status != SagaStatus::Pending
                    || index != saga.current_step
                    || saga.steps[index].status != StepStatus::Pending
                {
                    return Ok(false);
                }
                let now = Utc::now();
                let step = &mut saga.steps[index];
                step.status = StepStatus::Failed;
                step.error = Some(error.to_string());
                step.completed_at = Some(now);
                saga.transition(SagaStatus::Failed, now);
                saga.transition(SagaStatus::Compensating, now);
                match next_compensation(saga) {
                    Some(next) => saga.current_step = next,
                    None => saga.transition(SagaStatus::Compensated, now),
                }
                Ok(true)
            })
            .await?;

        self.log_applied(&saga, applied, step_id, "failed");
        self.advance(saga).await
    }

    pub async fn on_compensation_completed(
        &self,
        saga_id: Uuid,
        step_id: &str,
    ) -> Result<SagaState, SagaError> {
        let (saga, applied) = self
            .mutate(saga_id, |saga| {
                let index = step_of(saga, step_id)?;
                if saga.status != SagaStatus::Compensating || next_compensation(saga) != Some(index) {
                    return Ok(false);
                }
                if let Some(compensation) = saga.steps[index].compensation.as_mut() {
                    compensation.status = CompensationStatus::Completed;
                }
                match next_compensation(saga) {
                    Some(next) => saga.current_step = next,
                    None => saga.transition(SagaStatus::Compensated, Utc::now()),
                }
                Ok(true)
            })
            .await?;

        self.log_applied(&saga, applied, step_id, "compensated");
        self.advance(saga).await
    }

    /// Records the failure and halts the saga in COMPENSATING. Nothing is
    /// retried; the saga is reported by [`SagaCoordinator::requiring_intervention`].
    pub async fn on_compensation_failed(
        &self,
        saga_id: Uuid,
        step_id: &str,
        error: &str,
    ) -> Result<SagaState, SagaError> {
        let (saga, applied) = self
            .mutate(saga_id, |saga| {
                let index = step_of(saga, step_id)?;
                if saga.status != SagaStatus::Compensating || next_compensation(saga) != Some(index) {
                    return Ok(false);
                }
                if let Some(compensation) = saga.steps[index].compensation.as_mut() {
                    compensation.status = CompensationStatus::Failed;
                    compensation.error = Some(error.to_string());
                }
                Ok(true)
            })
            .await?;

        if applied {
            self.logger.error(
                Some(&correlation(&saga)),
                format_args!(
                    "Compensation of step {} in saga {} failed, operator intervention required: {}",
                    step_id, saga.saga_id, error
                ),
            );
        } else {
            self.log_applied(&saga, applied, step_id, "compensation failed");
        }
        Ok(saga)
    }

    /// Re-dispatches the action a saga is waiting on if it was never sent.
    pub async fn resume(&self, saga_id: Uuid) -> Result<SagaState, SagaError> {
        let saga = self
            .store
            .load_saga(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;
        self.advance(saga).await
    }

    /// Resumes every non-terminal saga; returns how many were inspected.
    pub async fn resume_all(&self) -> Result<usize, SagaError> {
        let mut sagas = self.store.list_sagas_by_status(SagaStatus::Pending).await?;
        sagas.extend(self.store.list_sagas_by_status(SagaStatus::Compensating).await?);
        let count = sagas.len();
        for saga in sagas {
            let saga_id = saga.saga_id;
            if let Err(err) = self.advance(saga).await {
                self.logger.warn(
                    Some(&CorrelationId(saga_id)),
                    format_args!("Saga {} not resumed: {}", saga_id, err),
                );
            }
        }
        Ok(count)
    }

    /// One pass over every unfinished saga: sends actions that never went out
    /// and fails actions whose outcome is overdue by `step_timeout`. An
    /// overdue step starts compensation; an overdue compensation halts the
    /// saga for intervention.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, SagaError> {
        let mut sagas = self.store.list_sagas_by_status(SagaStatus::Pending).await?;
        sagas.extend(self.store.list_sagas_by_status(SagaStatus::Compensating).await?);
        let mut report = SweepReport {
            inspected: sagas.len(),
            ..SweepReport::default()
        };

        for saga in sagas {
            let saga_id = saga.saga_id;
            let Some(action) = pending_action(&saga) else {
                continue;
            };
            let result = match dispatched_at(&saga, action) {
                None => self.advance(saga).await.map(|_| report.dispatched += 1),
                Some(at) if self.is_overdue(at, now) => {
                    report.timed_out += 1;
                    self.time_out(&saga, action).await.map(|_| ())
                }
                Some(_) => Ok(()),
            };
            if let Err(err) = result {
                report.errors += 1;
                self.logger.warn(
                    Some(&CorrelationId(saga_id)),
                    format_args!("Sweep of saga {} failed: {}", saga_id, err),
                );
            }
        }
        Ok(report)
    }

    /// Sweeps every `interval` until `shutdown` is notified.
    pub async fn run(&self, shutdown: Arc<Notify>, interval: Duration) {
        let shutdown = shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();

        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.logger.info(
            None,
            format_args!(
                "Saga sweep started (every {:?}, step timeout {:?})",
                interval, self.settings.step_timeout
            ),
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    self.logger.info(None, format_args!("Saga sweep received shutdown signal."));
                    break;
                }
                _ = ticker.tick() => match self.sweep(Utc::now()).await {
                    Ok(report) if report.dispatched + report.timed_out + report.errors > 0 => {
                        self.logger.info(None, format_args!("Saga sweep: {:?}", report));
                    }
                    Ok(_) => {}
                    Err(err) => self
                        .logger
                        .error(None, format_args!("Saga sweep failed: {}", err)),
                },
            }
        }
    }

    /// Sagas stuck in COMPENSATING because a compensation failed.
    pub async fn requiring_intervention(&self) -> Result<Vec<SagaState>, SagaError> {
        let compensating = self
            .store
            .list_sagas_by_status(SagaStatus::Compensating)
            .await?;
        Ok(compensating
            .into_iter()
            .filter(SagaState::requires_intervention)
            .collect())
    }

    fn is_overdue(&self, dispatched_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - dispatched_at)
            .to_std()
            .is_ok_and(|elapsed| elapsed >= self.settings.step_timeout)
    }

    async fn time_out(&self, saga: &SagaState, action: PendingAction) -> Result<SagaState, SagaError> {
        let error = format!("no outcome within {:?} of dispatch", self.settings.step_timeout);
        match action {
            PendingAction::Forward(index) => {
                let step_id = &saga.steps[index].step_id;
                self.logger.warn(
                    Some(&correlation(saga)),
                    format_args!("Step {} of saga {} timed out", step_id, saga.saga_id),
                );
                self.on_step_failed(saga.saga_id, step_id, &error).await
            }
            PendingAction::Compensate(index) => {
                let step_id = &saga.steps[index].step_id;
                self.on_compensation_failed(saga.saga_id, step_id, &error).await
            }
        }
    }

    /// Dispatches the pending action unless it already went out, then
    /// stamps its `dispatched_at`.
    async fn advance(&self, saga: SagaState) -> Result<SagaState, SagaError> {
        let Some(action) = pending_action(&saga) else {
            return Ok(saga);
        };
        if is_dispatched(&saga, action) {
            return Ok(saga);
        }

        let message = self.step_message(&saga, action);
        let phase = message.phase;
        let step_id = message.step_id.clone();
        self.dispatcher.dispatch_saga_step(message).await?;
        self.logger.info(
            Some(&correlation(&saga)),
            format_args!("Dispatched {} of step {} in saga {}", phase, step_id, saga.saga_id),
        );

        let (saga, _) = self
            .mutate(saga.saga_id, |saga| {
                if pending_action(saga) != Some(action) || is_dispatched(saga, action) {
                    return Ok(false);
                }
                let now = Some(Utc::now());
                match action {
                    PendingAction::Forward(index) => saga.steps[index].dispatched_at = now,
                    PendingAction::Compensate(index) => {
                        if let Some(compensation) = saga.steps[index].compensation.as_mut() {
                            compensation.dispatched_at = now;
                        }
                    }
                }
                Ok(true)
            })
            .await?;
        Ok(saga)
    }

    /// Load, apply `change`, save with the version check; reloads and
    /// reapplies when another writer got there first.
    async fn mutate<F>(&self, saga_id: Uuid, mut change: F) -> Result<(SagaState, bool), SagaError>
    where
        F: FnMut(&mut SagaState) -> Result<bool, SagaError>,
    {
        for _ in 0..=self.settings.max_conflict_retries {
            let mut saga = self
                .store
                .load_saga(saga_id)
                .await?
                .ok_or(SagaError::NotFound(saga_id))?;
            if !change(&mut saga)? {
                return Ok((saga, false));
            }
            if self.store.save_saga(&saga).await? {
                saga.version += 1;
                return Ok((saga, true));
            }
            self.logger.debug(
                Some(&CorrelationId(saga_id)),
                format_args!("Version conflict on saga {}, retrying", saga_id),
            );
        }
        Err(SagaError::Conflict(saga_id))
    }

    fn step_message(&self, saga: &SagaState, action: PendingAction) -> SagaStepMessage {
        let (index, phase) = match action {
            PendingAction::Forward(index) => (index, StepPhase::Forward),
            PendingAction::Compensate(index) => (index, StepPhase::Compensate),
        };
        let step = &saga.steps[index];
        let (action_name, payload) = match (phase, &step.compensation) {
            (StepPhase::Compensate, Some(compensation)) => {
                (compensation.action.clone(), compensation.payload.clone())
            }
            _ => (step.action.clone(), step.payload.clone()),
        };
        SagaStepMessage {
            saga_id: saga.saga_id,
            step_id: step.step_id.clone(),
            service: step.service.clone(),
            action: action_name,
            payload,
            phase,
            reply_to: self.settings.reply_to.clone(),
            correlation_id: correlation(saga),
        }
    }

    fn log_applied(&self, saga: &SagaState, applied: bool, step_id: &str, event: &str) {
        let correlation = correlation(saga);
        if applied {
            self.logger.info(
                Some(&correlation),
                format_args!(
                    "Saga {} step {} {}; status {}",
                    saga.saga_id,
                    step_id,
                    event,
                    saga.status.as_str()
                ),
            );
        } else {
            self.logger.debug(
                Some(&correlation),
                format_args!(
                    "Ignoring stale '{}' outcome for step {} of saga {} ({})",
                    event,
                    step_id,
                    saga.saga_id,
                    saga.status.as_str()
                ),
            );
        }
    }
}

/// Every message of a saga shares the saga id as correlation id.
fn correlation(saga: &SagaState) -> CorrelationId {
    CorrelationId(saga.saga_id)
}

fn step_of(saga: &SagaState, step_id: &str) -> Result<usize, SagaError> {
    saga.step_index(step_id).ok_or_else(|| SagaError::UnknownStep {
        saga_id: saga.saga_id,
        step_id: step_id.to_string(),
    })
}

/// Latest completed step whose compensation has not run yet.
fn next_compensation(saga: &SagaState) -> Option<usize> {
    saga.steps.iter().rposition(|step| {
        step.needs_compensation()
            && step
                .compensation
                .as_ref()
                .is_some_and(|c| c.status == CompensationStatus::Pending)
    })
}

fn pending_action(saga: &SagaState) -> Option<PendingAction> {
    match saga.status {
        SagaStatus::Pending => saga
            .current()
            .filter(|step| step.status == StepStatus::Pending)
            .map(|_| PendingAction::Forward(saga.current_step)),
        SagaStatus::Compensating if !saga.requires_intervention() => {
            next_compensation(saga).map(PendingAction::Compensate)
        }
        _ => None,
    }
}

fn dispatched_at(saga: &SagaState, action: PendingAction) -> Option<DateTime<Utc>> {
    match action {
        PendingAction::Forward(index) => saga.steps[index].dispatched_at,
        PendingAction::Compensate(index) => saga.steps[index]
            .compensation
            .as_ref()
            .and_then(|c| c.dispatched_at),
    }
}

fn is_dispatched(saga: &SagaState, action: PendingAction) -> bool {
    dispatched_at(saga, action).is_some()
}
