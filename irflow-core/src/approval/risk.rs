//! Risk scoring for proposed remedial actions.
//!
//! score = (tier base + environment bump) × (2 − confidence), clamped to [0, 1].

use serde::{Deserialize, Serialize};
use std::fmt;

const HIGH_RISK_PREFIXES: &[&str] = &[
    "delete_",
    "terminate_",
    "destroy_",
    "drop_",
    "revoke_",
    "disable_",
    "detach_",
    "modify_",
];

const MEDIUM_RISK_PREFIXES: &[&str] = &[
    "stop_",
    "restart_",
    "reboot_",
    "update_",
    "block_",
    "quarantine_",
    "isolate_",
    "rotate_",
];

const LOW_RISK_PREFIXES: &[&str] = &[
    "get_",
    "list_",
    "describe_",
    "read_",
    "query_",
    "snapshot_",
    "tag_",
];

const PRODUCTION_BUMP: f64 = 0.2;
const STAGING_BUMP: f64 = 0.1;

/// Severity tier of an action type, by prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Unclassified,
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn of(action_type: &str) -> Self {
        let action_type = action_type.to_lowercase();
        let has_prefix = |prefixes: &[&str]| prefixes.iter().any(|p| action_type.starts_with(p));
        if has_prefix(HIGH_RISK_PREFIXES) {
            RiskTier::High
        } else if has_prefix(MEDIUM_RISK_PREFIXES) {
            RiskTier::Medium
        } else if has_prefix(LOW_RISK_PREFIXES) {
            RiskTier::Low
        } else {
            RiskTier::Unclassified
        }
    }

    pub fn base_score(self) -> f64 {
        match self {
            RiskTier::High => 0.7,
            RiskTier::Medium => 0.4,
            RiskTier::Low => 0.2,
            RiskTier::Unclassified => 0.1,
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTier::High => write!(f, "high"),
            RiskTier::Medium => write!(f, "medium"),
            RiskTier::Low => write!(f, "low"),
            RiskTier::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// Extra risk for the environment named in the target resource.
pub fn environment_bump(target: Option<&str>) -> f64 {
    let Some(target) = target.map(str::to_lowercase) else {
        return 0.0;
    };
    if target.contains("production") {
        PRODUCTION_BUMP
    } else if target.contains("staging") {
        STAGING_BUMP
    } else {
        0.0
    }
}

/// Score an action. Missing confidence counts as zero.
pub fn risk_score(action_type: &str, target: Option<&str>, confidence: Option<f64>) -> f64 {
    let confidence = confidence
        .filter(|c| c.is_finite())
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);
    let base = RiskTier::of(action_type).base_score() + environment_bump(target);
    (base * (2.0 - confidence)).clamp(0.0, 1.0)
}
