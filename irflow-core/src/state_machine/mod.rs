//! Guarded incident lifecycle state machine.
//!
//! Owns, per incident, the current state, an append-only transition history
//! and a milestone timeline. Requests are checked against a fixed table of
//! guarded rows; an invalid request returns `false` and changes nothing.
//!
//! Transitions for one incident must be serialised by the caller. Calls for
//! different incidents are independent.

pub mod guards;
pub mod table;

pub use guards::{Effect, Guard, IncidentTimeline, Milestone, REMEDIATION_CONFIDENCE_THRESHOLD};
pub use table::{Transition, default_table};

use crate::collaborators::{Clock, SystemClock};
use crate::types::{IncidentId, IncidentState, TransitionContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// How a state change came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// A table row whose guard held.
    Guarded,
    /// A direct overwrite that bypassed the table (incident repair).
    AdministrativeOverride,
}

/// Details captured alongside a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDetails {
    pub prior_state: IncidentState,
    pub description: String,
    pub context: TransitionContext,
}

/// An immutable entry in an incident's transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: Uuid,
    pub resulting_state: IncidentState,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub kind: TransitionKind,
    pub details: TransitionDetails,
}

/// Broadcast after every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub incident_id: IncidentId,
    pub from: IncidentState,
    pub to: IncidentState,
    pub kind: TransitionKind,
}

#[derive(Debug, Default)]
struct IncidentEntry {
    state: Option<IncidentState>,
    history: Vec<TransitionRecord>,
    timeline: IncidentTimeline,
}

impl IncidentEntry {
    fn current(&self) -> IncidentState {
        self.state.unwrap_or(IncidentState::Initialized)
    }
}

/// The incident lifecycle state machine.
pub struct StateMachine {
    table: Vec<Transition>,
    incidents: Mutex<HashMap<IncidentId, IncidentEntry>>,
    clock: Arc<dyn Clock>,
    changes: broadcast::Sender<StateChange>,
}

impl StateMachine {
    /// A state machine over the default lifecycle table.
    pub fn new() -> Self {
        Self::with_table(default_table())
    }

    pub fn with_table(table: Vec<Transition>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            table,
            incidents: Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            changes,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IncidentId, IncidentEntry>> {
        self.incidents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// First row (in table order) from `from` to `to` whose guard holds.
    fn find_row(
        &self,
        from: IncidentState,
        to: IncidentState,
        ctx: &TransitionContext,
    ) -> Option<&Transition> {
        self.table.iter().find(|row| {
            row.from == from && row.to == to && row.guard.as_ref().is_none_or(|g| g.evaluate(ctx))
        })
    }

    /// Whether `transition(id, to, _, ctx)` would succeed right now.
    pub fn can_transition(&self, id: &str, to: IncidentState, ctx: &TransitionContext) -> bool {
        let from = self.current_state(id);
        let allowed = self.find_row(from, to, ctx).is_some();
        debug!(incident_id = %id, %from, %to, allowed, "Checked transition");
        allowed
    }

    /// Attempt a guarded transition.
    ///
    /// On success the row's effect runs, the state is updated, a record is
    /// appended to the history and `true` is returned. Otherwise nothing
    /// changes and the result is `false`.
    pub fn transition(
        &self,
        id: &str,
        to: IncidentState,
        actor: &str,
        ctx: &TransitionContext,
    ) -> bool {
        let change = {
            let mut incidents = self.lock();
            let from = incidents
                .get(id)
                .map(IncidentEntry::current)
                .unwrap_or(IncidentState::Initialized);

            let Some(row) = self.find_row(from, to, ctx) else {
                warn!(incident_id = %id, %from, %to, actor, "Transition rejected");
                return false;
            };

            let now = self.clock.now();
            let entry = incidents.entry(id.to_string()).or_default();
            if let Some(effect) = &row.effect {
                effect.apply(&mut entry.timeline, now);
            }
            entry.state = Some(to);
            entry.history.push(TransitionRecord {
                id: Uuid::new_v4(),
                resulting_state: to,
                timestamp: now,
                actor: actor.to_string(),
                kind: TransitionKind::Guarded,
                details: TransitionDetails {
                    prior_state: from,
                    description: row.description.to_string(),
                    context: ctx.clone(),
                },
            });
            info!(incident_id = %id, %from, %to, actor, description = row.description, "Transition applied");

            StateChange {
                incident_id: id.to_string(),
                from,
                to,
                kind: TransitionKind::Guarded,
            }
        };

        // No receivers is fine.
        let _ = self.changes.send(change);
        true
    }

    /// Overwrite the current state without consulting the table.
    ///
    /// This is the escape hatch used by incident repair. The history records
    /// it with `TransitionKind::AdministrativeOverride`. Returns the prior
    /// state.
    pub fn administrative_override(
        &self,
        id: &str,
        to: IncidentState,
        actor: &str,
        reason: &str,
    ) -> IncidentState {
        let from = {
            let mut incidents = self.lock();
            let entry = incidents.entry(id.to_string()).or_default();
            let from = entry.current();
            entry.state = Some(to);
            entry.history.push(TransitionRecord {
                id: Uuid::new_v4(),
                resulting_state: to,
                timestamp: self.clock.now(),
                actor: actor.to_string(),
                kind: TransitionKind::AdministrativeOverride,
                details: TransitionDetails {
                    prior_state: from,
                    description: reason.to_string(),
                    context: TransitionContext::new(),
                },
            });
            from
        };
        warn!(incident_id = %id, %from, %to, actor, reason, "Administrative state override");

        let _ = self.changes.send(StateChange {
            incident_id: id.to_string(),
            from,
            to,
            kind: TransitionKind::AdministrativeOverride,
        });
        from
    }

    /// Current state; `Initialized` for incidents never seen.
    pub fn current_state(&self, id: &str) -> IncidentState {
        self.lock()
            .get(id)
            .map(IncidentEntry::current)
            .unwrap_or(IncidentState::Initialized)
    }

    /// Ordered transition history.
    pub fn history(&self, id: &str) -> Vec<TransitionRecord> {
        self.lock()
            .get(id)
            .map(|entry| entry.history.clone())
            .unwrap_or_default()
    }

    pub fn timeline(&self, id: &str) -> IncidentTimeline {
        self.lock()
            .get(id)
            .map(|entry| entry.timeline.clone())
            .unwrap_or_default()
    }

    /// Distinct target states reachable from the current state under `ctx`,
    /// in table order.
    pub fn allowed_transitions(&self, id: &str, ctx: &TransitionContext) -> Vec<IncidentState> {
        let from = self.current_state(id);
        let mut targets = Vec::new();
        for row in self.table.iter().filter(|row| row.from == from) {
            if row.guard.as_ref().is_none_or(|g| g.evaluate(ctx)) && !targets.contains(&row.to) {
                targets.push(row.to);
            }
        }
        targets
    }

    pub fn is_terminal(&self, state: IncidentState) -> bool {
        state.is_terminal()
    }

    /// The transition table, read-only.
    pub fn transitions(&self) -> &[Transition] {
        &self.table
    }

    /// Incidents that have had at least one state change.
    pub fn incident_ids(&self) -> Vec<IncidentId> {
        let mut ids: Vec<_> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stream of every subsequent state change.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
