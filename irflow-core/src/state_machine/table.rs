//! The fixed, guarded transition table.

use super::guards::{Effect, Guard, Milestone, REMEDIATION_CONFIDENCE_THRESHOLD};
use crate::types::IncidentState;
use serde::Serialize;

/// One row of the transition table. Immutable once the table is built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub from: IncidentState,
    pub to: IncidentState,
    pub guard: Option<Guard>,
    pub effect: Option<Effect>,
    pub description: &'static str,
}

impl Transition {
    const fn new(from: IncidentState, to: IncidentState, description: &'static str) -> Self {
        Self {
            from,
            to,
            guard: None,
            effect: None,
            description,
        }
    }

    fn guarded(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    fn effect(mut self, milestone: Milestone) -> Self {
        self.effect = Some(Effect::Record(milestone));
        self
    }
}

/// Build the incident lifecycle table.
///
/// Row order matters: when several rows share the same endpoints, the first
/// whose guard passes is the one that fires.
pub fn default_table() -> Vec<Transition> {
    use IncidentState::*;

    let mut table = vec![
        Transition::new(Initialized, DetectionReceived, "detection handed off")
            .effect(Milestone::Detected),
        Transition::new(DetectionReceived, AnalysisInProgress, "analysis started")
            .effect(Milestone::AnalysisStarted),
        Transition::new(AnalysisInProgress, AnalysisComplete, "analysis finished"),
        Transition::new(
            AnalysisComplete,
            RemediationRequested,
            "confident analysis, remediation requested",
        )
        .guarded(Guard::MinConfidence(REMEDIATION_CONFIDENCE_THRESHOLD)),
        Transition::new(
            AnalysisComplete,
            InvestigationInProgress,
            "low confidence, investigation started",
        )
        .guarded(Guard::BelowConfidence(REMEDIATION_CONFIDENCE_THRESHOLD)),
        Transition::new(AnalysisComplete, Resolved, "dismissed as false positive")
            .guarded(Guard::ThreatDismissed)
            .effect(Milestone::Resolved),
        Transition::new(
            InvestigationInProgress,
            InvestigationComplete,
            "investigation finished",
        ),
        Transition::new(
            InvestigationComplete,
            AnalysisInProgress,
            "re-analysis with investigation findings",
        ),
        Transition::new(
            InvestigationComplete,
            RemediationRequested,
            "threat confirmed by investigation",
        )
        .guarded(Guard::ThreatConfirmed),
        Transition::new(
            RemediationRequested,
            RemediationApproved,
            "auto-approved by policy",
        )
        .guarded(Guard::AutoApproved),
        Transition::new(
            RemediationRequested,
            RemediationApproved,
            "approved by analyst",
        )
        .guarded(Guard::ManuallyApproved),
        Transition::new(RemediationRequested, Resolved, "remediation rejected")
            .guarded(Guard::ApprovalRejected)
            .effect(Milestone::Resolved),
        Transition::new(
            RemediationApproved,
            RemediationInProgress,
            "remediation started",
        )
        .effect(Milestone::RemediationStarted),
        Transition::new(
            RemediationInProgress,
            RemediationComplete,
            "all remediation actions completed",
        )
        .guarded(Guard::AllActionsCompleted),
        Transition::new(
            RemediationInProgress,
            RemediationFailed,
            "remediation action failed",
        )
        .guarded(Guard::AnyActionFailed),
        Transition::new(RemediationFailed, RemediationRequested, "remediation retried"),
        Transition::new(RemediationComplete, Resolved, "incident resolved")
            .effect(Milestone::Resolved),
        Transition::new(Resolved, Closed, "incident closed").effect(Milestone::Closed),
    ];

    let live: Vec<IncidentState> = IncidentState::ALL
        .into_iter()
        .filter(|s| !s.is_terminal())
        .collect();
    table.extend(
        live.iter()
            .map(|&from| Transition::new(from, Failed, "incident failed")),
    );
    table.extend(
        live.iter()
            .map(|&from| Transition::new(from, TimedOut, "incident timed out")),
    );

    table
}
