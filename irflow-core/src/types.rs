//! Shared types: incident lifecycle states and the transition context.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Identifier of an incident, as handed off by the detection layer.
pub type IncidentId = String;

/// Lifecycle state of an incident. Exactly one is current per incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentState {
    Initialized,
    DetectionReceived,
    AnalysisInProgress,
    AnalysisComplete,
    InvestigationInProgress,
    InvestigationComplete,
    RemediationRequested,
    RemediationApproved,
    RemediationInProgress,
    RemediationComplete,
    RemediationFailed,
    Resolved,
    Closed,
    Failed,
    TimedOut,
}

/// Coarse grouping of states, used when restarting a stalled workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Intake,
    Analysis,
    Remediation,
    Resolution,
    Terminal,
}

impl IncidentState {
    /// Every state, in lifecycle order.
    pub const ALL: [IncidentState; 15] = [
        IncidentState::Initialized,
        IncidentState::DetectionReceived,
        IncidentState::AnalysisInProgress,
        IncidentState::AnalysisComplete,
        IncidentState::InvestigationInProgress,
        IncidentState::InvestigationComplete,
        IncidentState::RemediationRequested,
        IncidentState::RemediationApproved,
        IncidentState::RemediationInProgress,
        IncidentState::RemediationComplete,
        IncidentState::RemediationFailed,
        IncidentState::Resolved,
        IncidentState::Closed,
        IncidentState::Failed,
        IncidentState::TimedOut,
    ];

    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IncidentState::Closed | IncidentState::Failed | IncidentState::TimedOut
        )
    }

    /// True for `Failed` and `TimedOut`, the states a repair can undo.
    pub fn is_failure(self) -> bool {
        matches!(self, IncidentState::Failed | IncidentState::TimedOut)
    }

    pub fn phase(self) -> LifecyclePhase {
        use IncidentState::*;
        match self {
            Initialized => LifecyclePhase::Intake,
            DetectionReceived | AnalysisInProgress | AnalysisComplete
            | InvestigationInProgress | InvestigationComplete => LifecyclePhase::Analysis,
            RemediationRequested | RemediationApproved | RemediationInProgress
            | RemediationFailed => LifecyclePhase::Remediation,
            RemediationComplete | Resolved => LifecyclePhase::Resolution,
            Closed | Failed | TimedOut => LifecyclePhase::Terminal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IncidentState::Initialized => "initialized",
            IncidentState::DetectionReceived => "detection_received",
            IncidentState::AnalysisInProgress => "analysis_in_progress",
            IncidentState::AnalysisComplete => "analysis_complete",
            IncidentState::InvestigationInProgress => "investigation_in_progress",
            IncidentState::InvestigationComplete => "investigation_complete",
            IncidentState::RemediationRequested => "remediation_requested",
            IncidentState::RemediationApproved => "remediation_approved",
            IncidentState::RemediationInProgress => "remediation_in_progress",
            IncidentState::RemediationComplete => "remediation_complete",
            IncidentState::RemediationFailed => "remediation_failed",
            IncidentState::Resolved => "resolved",
            IncidentState::Closed => "closed",
            IncidentState::Failed => "failed",
            IncidentState::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for IncidentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        IncidentState::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| format!("unknown incident state: {s}"))
    }
}

/// Context handed to transition guards and recorded in the history.
///
/// A JSON object with a handful of well-known keys (`confidence`,
/// `threat_confirmed`, `auto_approved`, `approved_by`, `rejected`,
/// `actions`, `failure_reason`); anything else is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionContext(Map<String, Value>);

impl TransitionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn array(&self, key: &str) -> Option<&Vec<Value>> {
        self.0.get(key).and_then(Value::as_array)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for TransitionContext {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<TransitionContext> for Value {
    fn from(ctx: TransitionContext) -> Self {
        Value::Object(ctx.0)
    }
}
