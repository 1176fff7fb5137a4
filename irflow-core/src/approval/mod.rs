//! Auto-approval engine: decides whether a batch of proposed remedial
//! actions may proceed without a human.
//!
//! The decision is all-or-nothing per batch: every action must match an
//! enabled rule whose conditions hold and whose risk ceiling covers the
//! action's risk score. Malformed or missing input never raises; it only
//! makes approval less likely.

pub mod history;
pub mod risk;
pub mod rules;

pub use history::{ApprovalDecision, ApprovalStatistics, DecisionHistory};
pub use risk::{RiskTier, risk_score};
pub use rules::{
    ApprovalRule, CompiledRule, Condition, EvaluationContext, Operator, builtin_rules,
    compile_rules, load_rules,
};

use crate::collaborators::{Clock, SystemClock};
use crate::config::ApprovalConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Reason reported when auto-remediation is switched off.
pub const DISABLED_REASON: &str = "disabled";

/// What the engine knows about an incident. Every field but the id may be
/// missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentSnapshot {
    pub id: String,
    pub severity: Option<String>,
    pub confidence: Option<f64>,
    pub attack_type: Option<String>,
    pub threat_confirmed: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub prior_action_count: usize,
}

impl IncidentSnapshot {
    /// Build a snapshot from arbitrary JSON, tolerating missing or
    /// mistyped fields. Analysis results may be flat or nested under
    /// `analysis`.
    pub fn from_json(value: &Value) -> Self {
        let analysis = value.get("analysis");
        let lookup = |key: &str| {
            value
                .get(key)
                .filter(|v| !v.is_null())
                .or_else(|| analysis.and_then(|a| a.get(key)))
        };

        let id = match value.get("id").or_else(|| value.get("incident_id")) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => "unknown".to_string(),
        };
        let prior_action_count = value
            .get("actions_taken")
            .and_then(Value::as_array)
            .map(Vec::len)
            .or_else(|| {
                value
                    .get("prior_action_count")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
            })
            .unwrap_or(0);

        Self {
            id,
            severity: lookup("severity")
                .and_then(Value::as_str)
                .map(|s| s.to_lowercase()),
            confidence: lookup("confidence").and_then(Value::as_f64),
            attack_type: lookup("attack_type")
                .and_then(Value::as_str)
                .map(str::to_string),
            threat_confirmed: lookup("threat_confirmed").and_then(Value::as_bool),
            created_at: value
                .get("created_at")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            prior_action_count,
        }
    }
}

/// A remedial action proposed for an incident.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub action_type: Option<String>,
    /// Name of the resource acted on; environment names raise the risk.
    pub target: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl ProposedAction {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: Some(action_type.into()),
            ..Default::default()
        }
    }

    pub fn on(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Lenient JSON constructor: `action_type` (or `type`), and `target`
    /// (or `resource`, `resource_name`).
    pub fn from_json(value: &Value) -> Self {
        let string_field = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| value.get(*k).and_then(Value::as_str))
                .map(str::to_string)
        };
        Self {
            action_type: string_field(&["action_type", "type"]),
            target: string_field(&["target", "resource", "resource_name"]),
            parameters: value
                .get("parameters")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

/// Per-action verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionAssessment {
    pub action_type: Option<String>,
    pub risk_score: f64,
    pub matched_rule: Option<String>,
    pub approved: bool,
    pub reason: String,
}

/// Result of `can_auto_approve`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalOutcome {
    pub approved: bool,
    pub reasons: Vec<String>,
    pub assessments: Vec<ActionAssessment>,
}

impl ApprovalOutcome {
    fn denied(reason: &str) -> Self {
        Self {
            approved: false,
            reasons: vec![reason.to_string()],
            assessments: Vec::new(),
        }
    }

    /// The `(approved, reasons)` pair.
    pub fn into_pair(self) -> (bool, Vec<String>) {
        (self.approved, self.reasons)
    }
}

/// Rule-based auto-approval engine. Rules are read-only after construction.
pub struct AutoApprovalEngine {
    enabled: bool,
    rules: Vec<CompiledRule>,
    history: Mutex<DecisionHistory>,
    clock: Arc<dyn Clock>,
}

impl AutoApprovalEngine {
    pub fn new(rules: Vec<CompiledRule>) -> Self {
        Self {
            enabled: true,
            rules,
            history: Mutex::new(DecisionHistory::default()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Engine over the built-in rule set.
    pub fn with_builtin_rules() -> Self {
        let rules = compile_rules(builtin_rules()).unwrap_or_else(|e| {
            warn!(error = %e, "Built-in approval rules failed to compile; nothing will auto-approve");
            Vec::new()
        });
        Self::new(rules)
    }

    /// Engine configured from `ApprovalConfig`: rules come from
    /// `rules_path` when set, the built-in set otherwise.
    pub fn from_config(config: &ApprovalConfig) -> crate::Result<Self> {
        let rules = match &config.rules_path {
            Some(path) => load_rules(path)?,
            None => builtin_rules(),
        };
        let engine = Self::new(compile_rules(rules)?)
            .with_enabled(config.auto_remediation_enabled)
            .with_history_capacity(config.decision_history_capacity);
        info!(
            rules = engine.rules.len(),
            enabled = engine.enabled,
            "Auto-approval engine ready"
        );
        Ok(engine)
    }

    /// Global auto-remediation switch.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history = Mutex::new(DecisionHistory::new(capacity));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn rules(&self) -> impl Iterator<Item = &ApprovalRule> {
        self.rules.iter().map(|r| &r.rule)
    }

    /// Facts the rules are evaluated against.
    pub fn evaluation_context(&self, incident: &IncidentSnapshot) -> EvaluationContext {
        let incident_age_hours = incident
            .created_at
            .map(|created| (self.clock.now() - created).num_seconds() as f64 / 3600.0);
        EvaluationContext {
            severity: incident.severity.clone(),
            confidence: incident.confidence,
            attack_type: incident.attack_type.clone(),
            threat_confirmed: incident.threat_confirmed,
            incident_age_hours,
            prior_action_count: incident.prior_action_count,
        }
    }

    /// Decide whether every action in the batch may proceed automatically.
    pub fn can_auto_approve(
        &self,
        incident: &IncidentSnapshot,
        actions: &[ProposedAction],
    ) -> ApprovalOutcome {
        if !self.enabled {
            debug!(incident_id = %incident.id, "Auto-remediation disabled");
            return ApprovalOutcome::denied(DISABLED_REASON);
        }

        let ctx = self.evaluation_context(incident);
        let mut rules_evaluated = 0;
        let outcome = if actions.is_empty() {
            ApprovalOutcome::denied("no actions proposed")
        } else {
            let assessments: Vec<_> = actions
                .iter()
                .map(|action| self.assess(action, &ctx, &mut rules_evaluated))
                .collect();
            ApprovalOutcome {
                approved: assessments.iter().all(|a| a.approved),
                reasons: assessments.iter().map(|a| a.reason.clone()).collect(),
                assessments,
            }
        };

        if outcome.approved {
            info!(incident_id = %incident.id, actions = actions.len(), "Batch auto-approved");
        } else {
            warn!(incident_id = %incident.id, reasons = ?outcome.reasons, "Batch requires human approval");
        }

        self.record(ApprovalDecision {
            timestamp: self.clock.now(),
            incident_id: incident.id.clone(),
            action_types: actions
                .iter()
                .map(|a| a.action_type.clone().unwrap_or_default())
                .collect(),
            approved: outcome.approved,
            reasons: outcome.reasons.clone(),
            rules_evaluated_count: rules_evaluated,
        });
        outcome
    }

    /// Scan enabled rules in load order. The first rule that matches and
    /// whose ceiling covers the risk approves the action; a matching rule
    /// whose ceiling is too low does not stop the scan.
    fn assess(
        &self,
        action: &ProposedAction,
        ctx: &EvaluationContext,
        rules_evaluated: &mut usize,
    ) -> ActionAssessment {
        let Some(action_type) = action
            .action_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
        else {
            return ActionAssessment {
                action_type: None,
                risk_score: 1.0,
                matched_rule: None,
                approved: false,
                reason: "action has no type".into(),
            };
        };

        let risk = risk_score(action_type, action.target.as_deref(), ctx.confidence);
        let mut closest: Option<&ApprovalRule> = None;

        for compiled in self.rules.iter().filter(|r| r.rule.enabled) {
            *rules_evaluated += 1;
            if !compiled.matches_action(action_type) || !compiled.conditions_hold(ctx) {
                continue;
            }
            let rule = &compiled.rule;
            if risk <= rule.max_risk_score {
                debug!(action_type, rule = %rule.id, risk, "Action approved");
                return ActionAssessment {
                    action_type: Some(action_type.to_string()),
                    risk_score: risk,
                    matched_rule: Some(rule.id.clone()),
                    approved: true,
                    reason: format!(
                        "{action_type}: approved by rule '{}' (risk {risk:.2} <= {:.2})",
                        rule.name, rule.max_risk_score
                    ),
                };
            }
            debug!(action_type, rule = %rule.id, risk, ceiling = rule.max_risk_score, "Risk above rule ceiling");
            closest.get_or_insert(rule);
        }

        let reason = match closest {
            Some(rule) => format!(
                "{action_type}: risk {risk:.2} exceeds ceiling of matching rule '{}' ({:.2})",
                rule.name, rule.max_risk_score
            ),
            None => format!("{action_type}: no matching approval rule"),
        };
        ActionAssessment {
            action_type: Some(action_type.to_string()),
            risk_score: risk,
            matched_rule: None,
            approved: false,
            reason,
        }
    }

    fn record(&self, decision: ApprovalDecision) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(decision);
    }

    /// Most recent decisions, newest first.
    pub fn recent_decisions(&self, limit: usize) -> Vec<ApprovalDecision> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent(limit)
    }

    pub fn statistics(&self) -> ApprovalStatistics {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .statistics()
    }
}

impl Default for AutoApprovalEngine {
    fn default() -> Self {
        Self::with_builtin_rules()
    }
}
