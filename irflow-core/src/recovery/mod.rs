//! Recovery manager: classifies nothing, decides what to do about errors
//! the caller has already classified.
//!
//! Every `handle_error` call records the error, fails fast while the
//! classification's circuit breaker is open, and otherwise runs the
//! strategy mapped from the classification. The only suspension points are
//! the backoff delay and caller-supplied retry operations; both are
//! abandoned if the owning incident reaches a terminal state meanwhile.

pub mod circuit;
pub mod strategy;

pub use circuit::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use strategy::{ErrorClassification, RecoveryStrategy, default_strategies};

use crate::collaborators::{
    AuditEntry, AuditEventType, AuditSeverity, Clock, Collaborators, IncidentPatch,
    NotificationPriority, Scheduler, SystemClock, TokioScheduler,
};
use crate::config::RecoveryConfig;
use crate::error::CollaboratorError;
use crate::state_machine::{StateChange, StateMachine};
use crate::types::{IncidentId, IncidentState, LifecyclePhase, TransitionContext};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Actor name used for transitions, overrides and audit entries made here.
pub const RECOVERY_ACTOR: &str = "recovery_manager";

/// Attempt-counter scope for errors not tied to an incident.
const GLOBAL_SCOPE: &str = "global";

const CRITICAL_CHANNEL_CAPACITY: usize = 64;

/// A caller-supplied operation re-run by the retry strategies.
pub type RetryOperation = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Extra input to `handle_error`: free-form details and, for the retry
/// strategies, the operation to re-run.
#[derive(Clone, Default)]
pub struct RecoveryContext {
    pub details: TransitionContext,
    pub retry: Option<RetryOperation>,
}

impl RecoveryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key, value);
        self
    }

    /// Attach the operation the retry strategies should re-run.
    pub fn with_retry<F, Fut>(mut self, operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.retry = Some(Arc::new(move || operation().boxed()));
        self
    }
}

/// How a strategy handler ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Recovered,
    NotRecovered,
    /// The incident became terminal while the handler was suspended.
    Cancelled,
}

impl RecoveryOutcome {
    pub fn is_recovered(self) -> bool {
        self == RecoveryOutcome::Recovered
    }

    fn from_result(result: Result<(), CollaboratorError>) -> Self {
        match result {
            Ok(()) => RecoveryOutcome::Recovered,
            Err(e) => {
                warn!(error = %e, "Recovery step failed");
                RecoveryOutcome::NotRecovered
            }
        }
    }
}

/// One handled error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub classification: ErrorClassification,
    pub message: String,
    pub incident_id: Option<IncidentId>,
    pub strategy: RecoveryStrategy,
    pub details: TransitionContext,
}

/// A request for a human, recorded by the manual-intervention strategy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualInterventionRequest {
    pub timestamp: DateTime<Utc>,
    pub incident_id: Option<IncidentId>,
    pub classification: ErrorClassification,
    pub message: String,
}

/// Raised by Escalate when there is no incident to notify about.
#[derive(Debug, Clone, PartialEq)]
pub struct CriticalSignal {
    pub timestamp: DateTime<Utc>,
    pub classification: ErrorClassification,
    pub message: String,
}

/// Snapshot returned by `get_error_statistics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub total_attempts: u64,
    pub by_classification: BTreeMap<ErrorClassification, u64>,
    /// `1 − total_errors / total_attempts`, or 0.0 with no attempts. A rough
    /// indicator only: it is not a success ratio and may go negative.
    pub recovery_rate: f64,
    pub circuit_breakers: BTreeMap<ErrorClassification, CircuitSnapshot>,
    pub circuit_trips: u64,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    cooldown: chrono::Duration,
    retry: u32,
    backoff_retry: u32,
    backoff_cap_secs: u64,
    history_capacity: usize,
}

impl From<&RecoveryConfig> for Limits {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            cooldown: i64::try_from(config.circuit_cooldown_secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(chrono::Duration::MAX),
            retry: config.retry_limit,
            backoff_retry: config.backoff_retry_limit,
            backoff_cap_secs: config.backoff_cap_secs,
            history_capacity: config.error_history_capacity,
        }
    }
}

/// All mutable bookkeeping, behind one lock.
#[derive(Debug, Default)]
struct RecoveryState {
    strategies: HashMap<ErrorClassification, RecoveryStrategy>,
    attempts: HashMap<(ErrorClassification, String), u32>,
    breakers: HashMap<ErrorClassification, CircuitBreaker>,
    errors: VecDeque<ErrorRecord>,
    manual_interventions: Vec<ManualInterventionRequest>,
    total_errors: u64,
    total_attempts: u64,
    by_classification: BTreeMap<ErrorClassification, u64>,
    circuit_trips: u64,
}

/// Chooses and runs recovery strategies for classified errors.
pub struct RecoveryManager {
    state_machine: Arc<StateMachine>,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    limits: Limits,
    state: Mutex<RecoveryState>,
    critical: broadcast::Sender<CriticalSignal>,
}

impl RecoveryManager {
    pub fn new(state_machine: Arc<StateMachine>, collaborators: Collaborators) -> Self {
        let (critical, _) = broadcast::channel(CRITICAL_CHANNEL_CAPACITY);
        Self {
            state_machine,
            collaborators,
            clock: Arc::new(SystemClock),
            scheduler: Arc::new(TokioScheduler),
            limits: Limits::from(&RecoveryConfig::default()),
            state: Mutex::new(RecoveryState {
                strategies: default_strategies(),
                ..Default::default()
            }),
            critical,
        }
    }

    /// Apply limits and strategy overrides from configuration.
    pub fn with_config(mut self, config: &RecoveryConfig) -> Self {
        self.limits = Limits::from(config);
        self.lock()
            .strategies
            .extend(config.strategy_overrides.iter().map(|(c, s)| (*c, *s)));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    fn lock(&self) -> MutexGuard<'_, RecoveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.state_machine
    }

    /// Replace the strategy for one classification.
    pub fn set_strategy(&self, classification: ErrorClassification, strategy: RecoveryStrategy) {
        info!(%classification, %strategy, "Recovery strategy overridden");
        self.lock().strategies.insert(classification, strategy);
    }

    pub fn strategy_for(&self, classification: ErrorClassification) -> RecoveryStrategy {
        self.lock()
            .strategies
            .get(&classification)
            .copied()
            .unwrap_or_else(|| classification.default_strategy())
    }

    /// Critical signals raised when an error escalates without an incident.
    pub fn subscribe_critical(&self) -> broadcast::Receiver<CriticalSignal> {
        self.critical.subscribe()
    }

    // -----------------------------------------------------------------------
    // Entry point
    // -----------------------------------------------------------------------

    /// Record a classified error and attempt recovery. Returns `true` only
    /// when the mapped strategy reports success.
    pub async fn handle_error(
        &self,
        error: &str,
        classification: ErrorClassification,
        incident_id: Option<&str>,
        ctx: &RecoveryContext,
    ) -> bool {
        let strategy = self.strategy_for(classification);
        self.record_error(error, classification, incident_id, strategy, &ctx.details)
            .await;

        let Some(trial) = self.admit(classification) else {
            warn!(%classification, incident_id = ?incident_id, "Circuit open, failing fast");
            return false;
        };
        let outcome = self
            .run_strategy(strategy, error, classification, incident_id, ctx)
            .await;

        if trial {
            match outcome {
                RecoveryOutcome::Recovered => {
                    info!(%classification, "Trial recovery succeeded, closing circuit");
                    if let Some(breaker) = self.lock().breakers.get_mut(&classification) {
                        breaker.record_success();
                    }
                }
                RecoveryOutcome::NotRecovered => self.trip_and_audit(classification).await,
                RecoveryOutcome::Cancelled => {
                    debug!(%classification, "Trial cancelled, circuit stays half-open");
                    if let Some(breaker) = self.lock().breakers.get_mut(&classification) {
                        breaker.abandon_trial();
                    }
                }
            }
        }

        let recovered = outcome.is_recovered();
        if recovered {
            info!(%classification, %strategy, incident_id = ?incident_id, "Recovered from error");
        } else {
            warn!(%classification, %strategy, incident_id = ?incident_id, ?outcome, "Recovery did not complete");
        }
        self.audit(
            AuditEventType::RecoveryAction,
            incident_id,
            json!({
                "classification": classification,
                "strategy": strategy,
                "outcome": outcome,
            }),
            if recovered {
                AuditSeverity::Info
            } else {
                AuditSeverity::Warning
            },
        )
        .await;
        recovered
    }

    async fn record_error(
        &self,
        error: &str,
        classification: ErrorClassification,
        incident_id: Option<&str>,
        strategy: RecoveryStrategy,
        details: &TransitionContext,
    ) {
        let record = ErrorRecord {
            id: Uuid::new_v4(),
            timestamp: self.clock.now(),
            classification,
            message: error.to_string(),
            incident_id: incident_id.map(str::to_string),
            strategy,
            details: details.clone(),
        };
        {
            let capacity = self.limits.history_capacity;
            let mut state = self.lock();
            state.total_errors += 1;
            *state.by_classification.entry(classification).or_default() += 1;
            if capacity > 0 {
                while state.errors.len() >= capacity {
                    state.errors.pop_front();
                }
                state.errors.push_back(record);
            }
        }
        debug!(%classification, incident_id = ?incident_id, error, "Error recorded");

        self.audit(
            AuditEventType::ErrorRecorded,
            incident_id,
            json!({
                "classification": classification,
                "message": error,
                "strategy": strategy,
                "details": details,
            }),
            AuditSeverity::Error,
        )
        .await;
    }

    /// Decide under one lock whether this call may run. `None` means fail
    /// fast. `Some(true)` means the call holds the half-open trial slot, in
    /// which case the classification's counters are cleared so the trial
    /// starts fresh.
    fn admit(&self, classification: ErrorClassification) -> Option<bool> {
        let now = self.clock.now();
        let cooldown = self.limits.cooldown;
        let mut state = self.lock();
        let trial = match state.breakers.get_mut(&classification) {
            None => false,
            Some(breaker) => {
                if !breaker.is_call_permitted(now, cooldown) {
                    return None;
                }
                breaker.begin_trial()
            }
        };
        if trial {
            state.attempts.retain(|(c, _), _| *c != classification);
            debug!(%classification, "Running half-open trial");
        }
        Some(trial)
    }

    async fn run_strategy(
        &self,
        strategy: RecoveryStrategy,
        error: &str,
        classification: ErrorClassification,
        incident_id: Option<&str>,
        ctx: &RecoveryContext,
    ) -> RecoveryOutcome {
        self.lock().total_attempts += 1;
        debug!(%strategy, %classification, incident_id = ?incident_id, "Dispatching recovery strategy");
        match strategy {
            RecoveryStrategy::Retry => {
                self.retry(classification, incident_id, ctx, self.limits.retry)
                    .await
            }
            RecoveryStrategy::RetryWithBackoff => {
                self.retry_with_backoff(classification, incident_id, ctx)
                    .await
            }
            RecoveryStrategy::Skip => self.skip(error, classification, incident_id).await,
            RecoveryStrategy::Escalate => self.escalate(error, classification, incident_id).await,
            RecoveryStrategy::FailIncident => self.fail_incident(error, incident_id, ctx).await,
            RecoveryStrategy::RestartWorkflow => self.restart_workflow(incident_id).await,
            RecoveryStrategy::RestartAgent => {
                self.restart_agent(error, classification, incident_id)
                    .await
            }
            RecoveryStrategy::ManualIntervention => {
                self.manual_intervention(error, classification, incident_id)
                    .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Strategy handlers
    // -----------------------------------------------------------------------

    fn attempt_key(
        classification: ErrorClassification,
        incident_id: Option<&str>,
    ) -> (ErrorClassification, String) {
        (classification, incident_id.unwrap_or(GLOBAL_SCOPE).to_string())
    }

    fn attempts(&self, classification: ErrorClassification, incident_id: Option<&str>) -> u32 {
        self.lock()
            .attempts
            .get(&Self::attempt_key(classification, incident_id))
            .copied()
            .unwrap_or(0)
    }

    async fn retry(
        &self,
        classification: ErrorClassification,
        incident_id: Option<&str>,
        ctx: &RecoveryContext,
        limit: u32,
    ) -> RecoveryOutcome {
        let Some(operation) = ctx.retry.clone() else {
            debug!(%classification, "No retry operation supplied");
            return RecoveryOutcome::NotRecovered;
        };

        if self.is_incident_terminal(incident_id) {
            debug!(%classification, incident_id = ?incident_id, "Incident terminal, no retry");
            return RecoveryOutcome::Cancelled;
        }

        let key = Self::attempt_key(classification, incident_id);
        let attempt = {
            let mut state = self.lock();
            let attempts = state.attempts.entry(key.clone()).or_default();
            if *attempts >= limit {
                None
            } else {
                *attempts += 1;
                Some(*attempts)
            }
        };
        let Some(attempt) = attempt else {
            warn!(%classification, incident_id = ?incident_id, limit, "Retry limit reached");
            self.trip_and_audit(classification).await;
            return RecoveryOutcome::NotRecovered;
        };

        debug!(%classification, incident_id = ?incident_id, attempt, "Retrying operation");
        match self.unless_terminal(incident_id, operation()).await {
            None => RecoveryOutcome::Cancelled,
            Some(Ok(())) => {
                self.lock().attempts.remove(&key);
                RecoveryOutcome::Recovered
            }
            Some(Err(e)) => {
                warn!(%classification, incident_id = ?incident_id, attempt, error = %e, "Retry failed");
                RecoveryOutcome::NotRecovered
            }
        }
    }

    async fn retry_with_backoff(
        &self,
        classification: ErrorClassification,
        incident_id: Option<&str>,
        ctx: &RecoveryContext,
    ) -> RecoveryOutcome {
        let limit = self.limits.backoff_retry;
        let attempts = self.attempts(classification, incident_id);
        if attempts >= limit {
            warn!(%classification, incident_id = ?incident_id, limit, "Backoff retry limit reached");
            self.trip_and_audit(classification).await;
            return RecoveryOutcome::NotRecovered;
        }

        let delay = backoff_delay(attempts, self.limits.backoff_cap_secs);
        debug!(%classification, delay_secs = delay.as_secs(), "Backing off before retry");
        if self
            .unless_terminal(incident_id, self.scheduler.sleep(delay))
            .await
            .is_none()
        {
            return RecoveryOutcome::Cancelled;
        }
        self.retry(classification, incident_id, ctx, limit).await
    }

    async fn skip(
        &self,
        error: &str,
        classification: ErrorClassification,
        incident_id: Option<&str>,
    ) -> RecoveryOutcome {
        if let Some(id) = incident_id {
            let note = format!("Skipped operation after {classification} error: {error}");
            if let Err(e) = self
                .collaborators
                .store
                .update(id, IncidentPatch::note(note))
                .await
            {
                warn!(incident_id = %id, error = %e, "Failed to note skipped operation");
            }
        }
        RecoveryOutcome::Recovered
    }

    async fn escalate(
        &self,
        error: &str,
        classification: ErrorClassification,
        incident_id: Option<&str>,
    ) -> RecoveryOutcome {
        match incident_id {
            Some(id) => {
                let message =
                    format!("Escalation: {classification} error requires attention: {error}");
                if let Err(e) = self
                    .collaborators
                    .notifier
                    .send(Some(id), "escalation", &message, NotificationPriority::Urgent)
                    .await
                {
                    warn!(incident_id = %id, error = %e, "Escalation notification failed");
                }
            }
            None => {
                error!(%classification, error, "Critical error with no incident, escalating");
                let _ = self.critical.send(CriticalSignal {
                    timestamp: self.clock.now(),
                    classification,
                    message: error.to_string(),
                });
            }
        }
        RecoveryOutcome::NotRecovered
    }

    async fn fail_incident(
        &self,
        error: &str,
        incident_id: Option<&str>,
        ctx: &RecoveryContext,
    ) -> RecoveryOutcome {
        let Some(id) = incident_id else {
            warn!("FailIncident requires an incident id");
            return RecoveryOutcome::NotRecovered;
        };
        let context = ctx.details.clone().with("failure_reason", error);
        let from = self.state_machine.current_state(id);
        if !self
            .state_machine
            .transition(id, IncidentState::Failed, RECOVERY_ACTOR, &context)
        {
            return RecoveryOutcome::NotRecovered;
        }
        self.audit(
            AuditEventType::StateTransition,
            Some(id),
            json!({ "from": from, "to": IncidentState::Failed, "failure_reason": error }),
            AuditSeverity::Error,
        )
        .await;
        let patch = IncidentPatch::status(IncidentState::Failed.as_str())
            .with_field("failure_reason", error);
        if let Err(e) = self.collaborators.store.update(id, patch).await {
            warn!(incident_id = %id, error = %e, "Failed to update incident status");
        }
        RecoveryOutcome::Recovered
    }

    async fn restart_workflow(&self, incident_id: Option<&str>) -> RecoveryOutcome {
        let Some(id) = incident_id else {
            debug!("RestartWorkflow requires an incident id");
            return RecoveryOutcome::NotRecovered;
        };
        let state = self.state_machine.current_state(id);
        self.unless_terminal(Some(id), self.restart_from(id, state))
            .await
            .unwrap_or(RecoveryOutcome::Cancelled)
    }

    /// Re-issue the request that drives the phase `state` belongs to.
    async fn restart_from(&self, id: &str, state: IncidentState) -> RecoveryOutcome {
        let workflow = &self.collaborators.workflow;
        match state.phase() {
            LifecyclePhase::Analysis => {
                info!(incident_id = %id, %state, "Restarting analysis");
                RecoveryOutcome::from_result(workflow.request_analysis(id).await)
            }
            LifecyclePhase::Remediation => {
                info!(incident_id = %id, %state, "Restarting remediation");
                RecoveryOutcome::from_result(workflow.request_remediation(id).await)
            }
            _ => {
                debug!(incident_id = %id, %state, "No workflow to restart from this state");
                RecoveryOutcome::NotRecovered
            }
        }
    }

    async fn restart_agent(
        &self,
        error: &str,
        classification: ErrorClassification,
        incident_id: Option<&str>,
    ) -> RecoveryOutcome {
        match self.collaborators.workflow.restart_agent(incident_id).await {
            Some(result) => RecoveryOutcome::from_result(result),
            None => {
                debug!("No generic agent restart exposed, escalating");
                self.escalate(error, classification, incident_id).await
            }
        }
    }

    async fn manual_intervention(
        &self,
        error: &str,
        classification: ErrorClassification,
        incident_id: Option<&str>,
    ) -> RecoveryOutcome {
        let request = ManualInterventionRequest {
            timestamp: self.clock.now(),
            incident_id: incident_id.map(str::to_string),
            classification,
            message: error.to_string(),
        };
        self.lock().manual_interventions.push(request);
        warn!(%classification, incident_id = ?incident_id, "Manual intervention requested");
        self.audit(
            AuditEventType::ManualInterventionRequested,
            incident_id,
            json!({ "classification": classification, "message": error }),
            AuditSeverity::Warning,
        )
        .await;
        RecoveryOutcome::Recovered
    }

    // -----------------------------------------------------------------------
    // Circuit breakers
    // -----------------------------------------------------------------------

    /// True while the breaker is open and the cool-down has not elapsed, or
    /// while a half-open trial is in flight. Once the cool-down has elapsed
    /// the breaker moves to half-open and this returns false.
    pub fn is_circuit_open(&self, classification: ErrorClassification) -> bool {
        let now = self.clock.now();
        let cooldown = self.limits.cooldown;
        self.lock()
            .breakers
            .get_mut(&classification)
            .is_some_and(|breaker| !breaker.is_call_permitted(now, cooldown))
    }

    /// Open the classification's breaker now.
    pub fn trip_circuit_breaker(&self, classification: ErrorClassification) -> u64 {
        let now = self.clock.now();
        let trips = {
            let mut state = self.lock();
            state.circuit_trips += 1;
            let breaker = state.breakers.entry(classification).or_default();
            breaker.trip(now);
            breaker.trips()
        };
        warn!(%classification, trips, "Circuit breaker opened");
        trips
    }

    async fn trip_and_audit(&self, classification: ErrorClassification) {
        let trips = self.trip_circuit_breaker(classification);
        self.audit(
            AuditEventType::CircuitBreakerTripped,
            None,
            json!({ "classification": classification, "trips": trips }),
            AuditSeverity::Warning,
        )
        .await;
    }

    /// Force a breaker closed and forget the classification's attempts.
    pub fn reset_circuit_breaker(&self, classification: ErrorClassification) {
        let mut state = self.lock();
        if let Some(breaker) = state.breakers.get_mut(&classification) {
            breaker.record_success();
        }
        state.attempts.retain(|(c, _), _| *c != classification);
        info!(%classification, "Circuit breaker reset");
    }

    pub fn circuit_state(&self, classification: ErrorClassification) -> CircuitState {
        self.lock()
            .breakers
            .get(&classification)
            .map(CircuitBreaker::state)
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Repair
    // -----------------------------------------------------------------------

    /// Undo a `Failed` or `TimedOut` incident.
    ///
    /// A failed incident is restored to its most recent state that was not a
    /// failure, through the administrative override. A timed-out incident
    /// has its workflow restarted from the most recent non-terminal state and
    /// is restored there if the restart succeeds.
    pub async fn repair_incident(&self, incident_id: &str) -> bool {
        let current = self.state_machine.current_state(incident_id);
        let target = match current {
            IncidentState::Failed => self.last_state_where(incident_id, |s| !s.is_failure()),
            IncidentState::TimedOut => {
                let Some(target) = self.last_state_where(incident_id, |s| !s.is_terminal()) else {
                    warn!(incident_id, "No live state to restart from");
                    return false;
                };
                if !self.restart_from(incident_id, target).await.is_recovered() {
                    warn!(incident_id, %target, "Workflow restart failed, incident left timed out");
                    return false;
                }
                Some(target)
            }
            _ => {
                debug!(incident_id, %current, "Nothing to repair");
                return false;
            }
        };
        let Some(target) = target else {
            warn!(incident_id, "No prior state to restore");
            return false;
        };

        let reason = format!("repair: restored from {current} to {target}");
        self.state_machine
            .administrative_override(incident_id, target, RECOVERY_ACTOR, &reason);
        self.audit(
            AuditEventType::AdministrativeOverride,
            Some(incident_id),
            json!({ "from": current, "to": target, "reason": reason }),
            AuditSeverity::Warning,
        )
        .await;
        let patch = IncidentPatch::status(target.as_str()).with_field("repaired", true);
        if let Err(e) = self.collaborators.store.update(incident_id, patch).await {
            warn!(incident_id, error = %e, "Failed to update repaired incident");
        }
        info!(incident_id, from = %current, to = %target, "Incident repaired");
        true
    }

    /// Newest state in the incident's history satisfying `keep`, looking at
    /// each record's resulting state before the state it left.
    fn last_state_where(
        &self,
        incident_id: &str,
        keep: impl Fn(IncidentState) -> bool,
    ) -> Option<IncidentState> {
        self.state_machine
            .history(incident_id)
            .iter()
            .rev()
            .flat_map(|record| [record.resulting_state, record.details.prior_state])
            .find(|state| keep(*state))
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn get_error_statistics(&self) -> ErrorStatistics {
        let state = self.lock();
        let recovery_rate = if state.total_attempts == 0 {
            0.0
        } else {
            1.0 - state.total_errors as f64 / state.total_attempts as f64
        };
        ErrorStatistics {
            total_errors: state.total_errors,
            total_attempts: state.total_attempts,
            by_classification: state.by_classification.clone(),
            recovery_rate,
            circuit_breakers: state
                .breakers
                .iter()
                .map(|(c, b)| (*c, b.snapshot()))
                .collect(),
            circuit_trips: state.circuit_trips,
        }
    }

    /// Most recent errors, newest first.
    pub fn error_history(&self, limit: usize) -> Vec<ErrorRecord> {
        self.lock().errors.iter().rev().take(limit).cloned().collect()
    }

    pub fn manual_interventions(&self) -> Vec<ManualInterventionRequest> {
        self.lock().manual_interventions.clone()
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn is_incident_terminal(&self, incident_id: Option<&str>) -> bool {
        incident_id.is_some_and(|id| self.state_machine.current_state(id).is_terminal())
    }

    /// Run `fut` unless the incident is or becomes terminal first, in which
    /// case `None` is returned and `fut` is dropped.
    async fn unless_terminal<T>(
        &self,
        incident_id: Option<&str>,
        fut: impl Future<Output = T>,
    ) -> Option<T> {
        let Some(id) = incident_id else {
            return Some(fut.await);
        };
        let changes = self.state_machine.subscribe();
        if self.state_machine.current_state(id).is_terminal() {
            debug!(incident_id = %id, "Incident already terminal, abandoning recovery");
            return None;
        }
        tokio::select! {
            out = fut => Some(out),
            () = self.wait_for_terminal(id, changes) => {
                info!(incident_id = %id, "Incident became terminal, recovery cancelled");
                None
            }
        }
    }

    async fn wait_for_terminal(&self, id: &str, mut changes: broadcast::Receiver<StateChange>) {
        loop {
            match changes.recv().await {
                Ok(change) if change.incident_id == id && change.to.is_terminal() => return,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    if self.state_machine.current_state(id).is_terminal() {
                        return;
                    }
                }
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }

    async fn audit(
        &self,
        event_type: AuditEventType,
        incident_id: Option<&str>,
        details: Value,
        severity: AuditSeverity,
    ) {
        let entry = AuditEntry {
            timestamp: self.clock.now(),
            event_type,
            incident_id: incident_id.map(str::to_string),
            details,
            actor: RECOVERY_ACTOR.to_string(),
            severity,
        };
        if let Err(e) = self.collaborators.audit.append(entry).await {
            warn!(error = %e, ?event_type, "Audit append failed");
        }
    }
}

/// `min(2^attempts, cap)` seconds.
pub fn backoff_delay(attempts: u32, cap_secs: u64) -> Duration {
    let secs = 2u64.checked_pow(attempts).unwrap_or(u64::MAX).min(cap_secs);
    Duration::from_secs(secs)
}
