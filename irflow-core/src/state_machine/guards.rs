//! Named guard predicates and side-effect actions attached to transitions.
//!
//! Both are plain enums so the transition table stays inspectable: a guard is
//! resolved to its predicate through `Guard::evaluate`, an effect through
//! `Effect::apply`.

use crate::types::TransitionContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Confidence at or above which analysis may request remediation directly.
pub const REMEDIATION_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// A side-effect-free, deterministic predicate over a transition context.
///
/// A field the guard needs that is absent (or of the wrong type) makes the
/// guard fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "guard", content = "threshold", rename_all = "snake_case")]
pub enum Guard {
    /// `confidence >= threshold`.
    MinConfidence(f64),
    /// `confidence < threshold`.
    BelowConfidence(f64),
    /// `threat_confirmed == true`.
    ThreatConfirmed,
    /// `threat_confirmed == false` (a false positive).
    ThreatDismissed,
    /// `auto_approved == true`, set after the approval engine said yes.
    AutoApproved,
    /// A non-empty `approved_by`.
    ManuallyApproved,
    /// `rejected == true`.
    ApprovalRejected,
    /// Non-empty `actions`, every one with `status == "completed"`.
    AllActionsCompleted,
    /// Some entry of `actions` has `status == "failed"`.
    AnyActionFailed,
}

impl Guard {
    pub fn evaluate(&self, ctx: &TransitionContext) -> bool {
        match self {
            Guard::MinConfidence(threshold) => {
                ctx.f64("confidence").is_some_and(|c| c >= *threshold)
            }
            Guard::BelowConfidence(threshold) => {
                ctx.f64("confidence").is_some_and(|c| c < *threshold)
            }
            Guard::ThreatConfirmed => ctx.bool("threat_confirmed") == Some(true),
            Guard::ThreatDismissed => ctx.bool("threat_confirmed") == Some(false),
            Guard::AutoApproved => ctx.bool("auto_approved") == Some(true),
            Guard::ManuallyApproved => ctx
                .str("approved_by")
                .is_some_and(|who| !who.trim().is_empty()),
            Guard::ApprovalRejected => ctx.bool("rejected") == Some(true),
            Guard::AllActionsCompleted => ctx.array("actions").is_some_and(|actions| {
                !actions.is_empty()
                    && actions
                        .iter()
                        .all(|a| a.get("status").and_then(|s| s.as_str()) == Some("completed"))
            }),
            Guard::AnyActionFailed => ctx.array("actions").is_some_and(|actions| {
                actions
                    .iter()
                    .any(|a| a.get("status").and_then(|s| s.as_str()) == Some("failed"))
            }),
        }
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::MinConfidence(t) => write!(f, "confidence >= {t}"),
            Guard::BelowConfidence(t) => write!(f, "confidence < {t}"),
            Guard::ThreatConfirmed => write!(f, "threat confirmed"),
            Guard::ThreatDismissed => write!(f, "threat dismissed"),
            Guard::AutoApproved => write!(f, "auto-approved"),
            Guard::ManuallyApproved => write!(f, "approved by analyst"),
            Guard::ApprovalRejected => write!(f, "approval rejected"),
            Guard::AllActionsCompleted => write!(f, "all actions completed"),
            Guard::AnyActionFailed => write!(f, "any action failed"),
        }
    }
}

/// Lifecycle milestones recorded on an incident's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Milestone {
    Detected,
    AnalysisStarted,
    RemediationStarted,
    Resolved,
    Closed,
}

/// Side effect run when a transition row fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Record(Milestone),
}

impl Effect {
    pub fn apply(&self, timeline: &mut IncidentTimeline, at: DateTime<Utc>) {
        match self {
            Effect::Record(milestone) => timeline.mark(*milestone, at),
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Record(m) => write!(f, "record {m:?}"),
        }
    }
}

/// When each lifecycle milestone was first reached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentTimeline {
    pub detected_at: Option<DateTime<Utc>>,
    pub analysis_started_at: Option<DateTime<Utc>>,
    pub remediation_started_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl IncidentTimeline {
    /// Set the milestone if it has not been reached before.
    pub fn mark(&mut self, milestone: Milestone, at: DateTime<Utc>) {
        let slot = match milestone {
            Milestone::Detected => &mut self.detected_at,
            Milestone::AnalysisStarted => &mut self.analysis_started_at,
            Milestone::RemediationStarted => &mut self.remediation_started_at,
            Milestone::Resolved => &mut self.resolved_at,
            Milestone::Closed => &mut self.closed_at,
        };
        slot.get_or_insert(at);
    }

    /// Detection to resolution, when both are known.
    pub fn time_to_resolve(&self) -> Option<chrono::Duration> {
        Some(self.resolved_at? - self.detected_at?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_confidence_guards() {
        let high = TransitionContext::new().with("confidence", 0.9);
        let exact = TransitionContext::new().with("confidence", 0.7);
        let low = TransitionContext::new().with("confidence", 0.5);
        let missing = TransitionContext::new();

        let min = Guard::MinConfidence(REMEDIATION_CONFIDENCE_THRESHOLD);
        assert!(min.evaluate(&high));
        assert!(min.evaluate(&exact));
        assert!(!min.evaluate(&low));
        assert!(!min.evaluate(&missing));

        let below = Guard::BelowConfidence(REMEDIATION_CONFIDENCE_THRESHOLD);
        assert!(below.evaluate(&low));
        assert!(!below.evaluate(&exact));
        assert!(!below.evaluate(&missing));
    }

    #[test]
    fn test_threat_guards_require_explicit_flag() {
        let confirmed = TransitionContext::new().with("threat_confirmed", true);
        let dismissed = TransitionContext::new().with("threat_confirmed", false);
        let wrong_type = TransitionContext::new().with("threat_confirmed", "yes");

        assert!(Guard::ThreatConfirmed.evaluate(&confirmed));
        assert!(!Guard::ThreatConfirmed.evaluate(&dismissed));
        assert!(Guard::ThreatDismissed.evaluate(&dismissed));
        assert!(!Guard::ThreatDismissed.evaluate(&wrong_type));
        assert!(!Guard::ThreatConfirmed.evaluate(&wrong_type));
    }

    #[test]
    fn test_approval_guards() {
        let approved = TransitionContext::new().with("auto_approved", true);
        assert!(Guard::AutoApproved.evaluate(&approved));
        assert!(!Guard::AutoApproved.evaluate(&TransitionContext::new()));
        assert!(
            Guard::ManuallyApproved.evaluate(&TransitionContext::new().with("approved_by", "sam"))
        );
        assert!(
            !Guard::ManuallyApproved.evaluate(&TransitionContext::new().with("approved_by", "  "))
        );
        assert!(Guard::ApprovalRejected.evaluate(&TransitionContext::new().with("rejected", true)));
    }

    #[test]
    fn test_aggregate_action_guards() {
        let done = TransitionContext::new().with(
            "actions",
            json!([{"status": "completed"}, {"status": "completed"}]),
        );
        let mixed = TransitionContext::new().with(
            "actions",
            json!([{"status": "completed"}, {"status": "failed"}]),
        );
        let empty = TransitionContext::new().with("actions", json!([]));

        assert!(Guard::AllActionsCompleted.evaluate(&done));
        assert!(!Guard::AnyActionFailed.evaluate(&done));
        assert!(!Guard::AllActionsCompleted.evaluate(&mixed));
        assert!(Guard::AnyActionFailed.evaluate(&mixed));
        assert!(!Guard::AllActionsCompleted.evaluate(&empty));
        assert!(!Guard::AnyActionFailed.evaluate(&empty));
    }

    #[test]
    fn test_timeline_keeps_first_milestone() {
        let mut timeline = IncidentTimeline::default();
        let first = Utc::now();
        let later = first + chrono::Duration::minutes(5);
        Effect::Record(Milestone::Detected).apply(&mut timeline, first);
        Effect::Record(Milestone::Detected).apply(&mut timeline, later);
        Effect::Record(Milestone::Resolved).apply(&mut timeline, later);
        assert_eq!(timeline.detected_at, Some(first));
        assert_eq!(timeline.time_to_resolve(), Some(chrono::Duration::minutes(5)));
    }
}
