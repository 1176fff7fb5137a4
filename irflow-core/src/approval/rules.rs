//! Approval rules: conditions over the evaluation context plus action-type
//! patterns and a risk ceiling.

use crate::error::RuleError;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::path::Path;

/// Comparison applied by a rule condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    LessThan,
    GreaterThan,
    In,
    Contains,
}

/// `field <operator> value`, evaluated against an `EvaluationContext`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Evaluate against the context. A missing actual value fails every
    /// operator.
    pub fn holds(&self, ctx: &EvaluationContext) -> bool {
        let Some(actual) = ctx.get(&self.field) else {
            return false;
        };
        match self.operator {
            Operator::Equals => values_equal(&actual, &self.value),
            Operator::LessThan => match (actual.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
            Operator::GreaterThan => match (actual.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            Operator::In => self
                .value
                .as_array()
                .is_some_and(|options| options.iter().any(|o| values_equal(&actual, o))),
            Operator::Contains => match (&actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => {
                    haystack.to_lowercase().contains(&needle.to_lowercase())
                }
                (Value::Array(items), needle) => items.iter().any(|i| values_equal(i, needle)),
                _ => false,
            },
        }
    }
}

/// Numbers compare numerically, strings case-insensitively, everything else
/// structurally.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::String(x), Value::String(y)) => x.eq_ignore_ascii_case(y),
        _ => a == b,
    }
}

/// The facts rule conditions are evaluated against, derived from an incident.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationContext {
    pub severity: Option<String>,
    pub confidence: Option<f64>,
    pub attack_type: Option<String>,
    pub threat_confirmed: Option<bool>,
    pub incident_age_hours: Option<f64>,
    pub prior_action_count: usize,
}

impl EvaluationContext {
    /// Look up a field by the name rules use.
    pub fn get(&self, field: &str) -> Option<Value> {
        match field {
            "severity" => self.severity.as_ref().map(|s| json!(s)),
            "confidence" => self.confidence.map(|c| json!(c)),
            "attack_type" => self.attack_type.as_ref().map(|s| json!(s)),
            "threat_confirmed" => self.threat_confirmed.map(Value::Bool),
            "incident_age_hours" => self.incident_age_hours.map(|h| json!(h)),
            "prior_action_count" => Some(json!(self.prior_action_count)),
            _ => None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// An approval rule, as loaded from YAML or built in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Glob patterns over action types, e.g. `get_*`.
    pub action_patterns: Vec<String>,
    pub max_risk_score: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// A rule with its action patterns compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: ApprovalRule,
    matcher: GlobSet,
}

impl CompiledRule {
    pub fn compile(rule: ApprovalRule) -> Result<Self, RuleError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &rule.action_patterns {
            let glob = Glob::new(pattern).map_err(|e| RuleError::InvalidPattern {
                rule_id: rule.id.clone(),
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            builder.add(glob);
        }
        let matcher = builder.build().map_err(|e| RuleError::InvalidPattern {
            rule_id: rule.id.clone(),
            pattern: rule.action_patterns.join(", "),
            message: e.to_string(),
        })?;
        Ok(Self { rule, matcher })
    }

    pub fn matches_action(&self, action_type: &str) -> bool {
        self.matcher.is_match(action_type)
    }

    pub fn conditions_hold(&self, ctx: &EvaluationContext) -> bool {
        self.rule.conditions.iter().all(|c| c.holds(ctx))
    }
}

/// Compile a rule list, rejecting duplicate ids. Load order is preserved.
pub fn compile_rules(rules: Vec<ApprovalRule>) -> Result<Vec<CompiledRule>, RuleError> {
    let mut seen = HashSet::new();
    rules
        .into_iter()
        .map(|rule| {
            if !seen.insert(rule.id.clone()) {
                return Err(RuleError::DuplicateId { rule_id: rule.id });
            }
            CompiledRule::compile(rule)
        })
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RuleFile {
    Wrapped { rules: Vec<ApprovalRule> },
    List(Vec<ApprovalRule>),
}

/// Load rules from a YAML file: either a bare list or `rules: [...]`.
pub fn load_rules(path: &Path) -> Result<Vec<ApprovalRule>, RuleError> {
    let content = std::fs::read_to_string(path).map_err(|_| RuleError::FileNotFound {
        path: path.to_path_buf(),
    })?;
    let parsed: RuleFile = serde_yaml::from_str(&content).map_err(|e| RuleError::ParseError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(match parsed {
        RuleFile::Wrapped { rules } | RuleFile::List(rules) => rules,
    })
}

/// The rule set used when no rule file is configured.
pub fn builtin_rules() -> Vec<ApprovalRule> {
    vec![
        ApprovalRule {
            id: "read-only-investigation".into(),
            name: "Read-only investigation".into(),
            conditions: vec![],
            action_patterns: vec![
                "get_*".into(),
                "list_*".into(),
                "describe_*".into(),
                "query_*".into(),
            ],
            max_risk_score: 0.5,
            enabled: true,
        },
        ApprovalRule {
            id: "containment-confirmed-threat".into(),
            name: "Containment of a confirmed threat".into(),
            conditions: vec![
                Condition::new("threat_confirmed", Operator::Equals, true),
                Condition::new("confidence", Operator::GreaterThan, 0.8),
                Condition::new(
                    "severity",
                    Operator::In,
                    json!(["low", "medium", "high"]),
                ),
            ],
            action_patterns: vec![
                "block_*".into(),
                "quarantine_*".into(),
                "isolate_*".into(),
                "snapshot_*".into(),
                "tag_*".into(),
            ],
            max_risk_score: 0.8,
            enabled: true,
        },
        ApprovalRule {
            id: "credential-rotation".into(),
            name: "Credential rotation after compromise".into(),
            conditions: vec![
                Condition::new(
                    "attack_type",
                    Operator::In,
                    json!(["credential_compromise", "brute_force"]),
                ),
                Condition::new("confidence", Operator::GreaterThan, 0.9),
            ],
            action_patterns: vec!["rotate_*".into(), "revoke_*".into()],
            max_risk_score: 0.9,
            enabled: true,
        },
        ApprovalRule {
            id: "stakeholder-notification".into(),
            name: "Stakeholder notification".into(),
            conditions: vec![Condition::new(
                "incident_age_hours",
                Operator::LessThan,
                72,
            )],
            action_patterns: vec!["notify_*".into(), "create_ticket*".into()],
            max_risk_score: 0.3,
            enabled: true,
        },
        ApprovalRule {
            id: "destructive-actions".into(),
            name: "Destructive actions".into(),
            conditions: vec![Condition::new("severity", Operator::Equals, "critical")],
            action_patterns: vec![
                "delete_*".into(),
                "terminate_*".into(),
                "destroy_*".into(),
            ],
            max_risk_score: 0.9,
            enabled: false,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ctx() -> EvaluationContext {
        EvaluationContext {
            severity: Some("Medium".into()),
            confidence: Some(0.85),
            attack_type: Some("credential_compromise".into()),
            threat_confirmed: Some(true),
            incident_age_hours: Some(3.5),
            prior_action_count: 2,
        }
    }

    #[test]
    fn test_operators() {
        let c = ctx();
        assert!(Condition::new("severity", Operator::Equals, "medium").holds(&c));
        assert!(Condition::new("confidence", Operator::GreaterThan, 0.8).holds(&c));
        assert!(!Condition::new("confidence", Operator::LessThan, 0.8).holds(&c));
        assert!(Condition::new("severity", Operator::In, json!(["low", "medium"])).holds(&c));
        assert!(Condition::new("attack_type", Operator::Contains, "credential").holds(&c));
        assert!(Condition::new("prior_action_count", Operator::Equals, 2).holds(&c));
    }

    #[test]
    fn test_missing_values_fail_closed() {
        let empty = EvaluationContext::default();
        for op in [
            Operator::Equals,
            Operator::LessThan,
            Operator::GreaterThan,
            Operator::In,
            Operator::Contains,
        ] {
            assert!(
                !Condition::new("confidence", op, json!([0.5])).holds(&empty),
                "{op:?} should fail on a missing value"
            );
        }
        assert!(!Condition::new("no_such_field", Operator::Equals, "x").holds(&ctx()));
    }

    #[test]
    fn test_numeric_operators_reject_strings() {
        let c = ctx();
        assert!(!Condition::new("severity", Operator::LessThan, 5).holds(&c));
        assert!(!Condition::new("confidence", Operator::GreaterThan, "high").holds(&c));
    }

    #[test]
    fn test_pattern_matching() {
        let rule = CompiledRule::compile(builtin_rules().remove(0)).unwrap();
        assert!(rule.matches_action("get_instance"));
        assert!(rule.matches_action("describe_security_groups"));
        assert!(!rule.matches_action("delete_instance"));
        assert!(!rule.matches_action("forget_instance"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let rule = ApprovalRule {
            id: "bad".into(),
            name: "bad".into(),
            conditions: vec![],
            action_patterns: vec!["get_[".into()],
            max_risk_score: 0.5,
            enabled: true,
        };
        assert!(matches!(
            CompiledRule::compile(rule),
            Err(RuleError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut rules = builtin_rules();
        rules.push(rules[0].clone());
        assert!(matches!(
            compile_rules(rules),
            Err(RuleError::DuplicateId { .. })
        ));
    }

    #[test]
    fn test_load_rules_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
rules:
  - id: block-ips
    name: Block attacker IPs
    conditions:
      - field: threat_confirmed
        operator: equals
        value: true
    action_patterns: ["block_ip*"]
    max_risk_score: 0.6
  - id: disabled
    name: Disabled
    action_patterns: ["*"]
    max_risk_score: 1.0
    enabled: false
"#
        )
        .unwrap();

        let rules = load_rules(file.path()).unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules[0].enabled);
        assert_eq!(rules[0].conditions[0].operator, Operator::Equals);
        assert!(!rules[1].enabled);
    }

    #[test]
    fn test_load_rules_missing_file() {
        let err = load_rules(Path::new("/nonexistent/rules.yaml")).unwrap_err();
        assert!(matches!(err, RuleError::FileNotFound { .. }));
    }
}
