//! Failure classifications and the recovery strategies mapped to them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Category of a runtime failure, assigned by the caller before the error
/// reaches the recovery manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    AgentCommunication,
    PersistenceError,
    WorkflowError,
    TimeoutError,
    ValidationError,
    ExecutionFailure,
    ResourceUnavailable,
    Unknown,
}

impl ErrorClassification {
    pub const ALL: [ErrorClassification; 8] = [
        ErrorClassification::AgentCommunication,
        ErrorClassification::PersistenceError,
        ErrorClassification::WorkflowError,
        ErrorClassification::TimeoutError,
        ErrorClassification::ValidationError,
        ErrorClassification::ExecutionFailure,
        ErrorClassification::ResourceUnavailable,
        ErrorClassification::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClassification::AgentCommunication => "agent_communication",
            ErrorClassification::PersistenceError => "persistence_error",
            ErrorClassification::WorkflowError => "workflow_error",
            ErrorClassification::TimeoutError => "timeout_error",
            ErrorClassification::ValidationError => "validation_error",
            ErrorClassification::ExecutionFailure => "execution_failure",
            ErrorClassification::ResourceUnavailable => "resource_unavailable",
            ErrorClassification::Unknown => "unknown",
        }
    }

    /// Strategy used when no override is configured.
    pub fn default_strategy(self) -> RecoveryStrategy {
        match self {
            ErrorClassification::AgentCommunication => RecoveryStrategy::RetryWithBackoff,
            ErrorClassification::PersistenceError => RecoveryStrategy::Retry,
            ErrorClassification::WorkflowError => RecoveryStrategy::RestartWorkflow,
            ErrorClassification::TimeoutError => RecoveryStrategy::RetryWithBackoff,
            ErrorClassification::ValidationError => RecoveryStrategy::Skip,
            ErrorClassification::ExecutionFailure => RecoveryStrategy::Escalate,
            ErrorClassification::ResourceUnavailable => RecoveryStrategy::RetryWithBackoff,
            ErrorClassification::Unknown => RecoveryStrategy::ManualIntervention,
        }
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the recovery manager does about a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Re-invoke the supplied operation at once.
    Retry,
    /// Wait `min(2^attempts, cap)` seconds, then retry.
    RetryWithBackoff,
    /// Note the skipped operation on the incident and carry on.
    Skip,
    /// Urgent notification, or a process-level critical signal.
    Escalate,
    /// Drive the incident into `Failed`.
    FailIncident,
    /// Re-issue the analysis or remediation request for the current phase.
    RestartWorkflow,
    /// Generic agent restart, escalating when none is exposed.
    RestartAgent,
    /// Record a request for a human.
    ManualIntervention,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::RetryWithBackoff => "retry_with_backoff",
            RecoveryStrategy::Skip => "skip",
            RecoveryStrategy::Escalate => "escalate",
            RecoveryStrategy::FailIncident => "fail_incident",
            RecoveryStrategy::RestartWorkflow => "restart_workflow",
            RecoveryStrategy::RestartAgent => "restart_agent",
            RecoveryStrategy::ManualIntervention => "manual_intervention",
        };
        f.write_str(name)
    }
}

/// The default classification → strategy table.
pub fn default_strategies() -> HashMap<ErrorClassification, RecoveryStrategy> {
    ErrorClassification::ALL
        .into_iter()
        .map(|c| (c, c.default_strategy()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_covers_every_classification() {
        let table = default_strategies();
        assert_eq!(table.len(), ErrorClassification::ALL.len());
        assert_eq!(
            table[&ErrorClassification::ResourceUnavailable],
            RecoveryStrategy::RetryWithBackoff
        );
        assert_eq!(
            table[&ErrorClassification::PersistenceError],
            RecoveryStrategy::Retry
        );
        assert_eq!(
            table[&ErrorClassification::Unknown],
            RecoveryStrategy::ManualIntervention
        );
    }

    #[test]
    fn test_serde_names_match_display() {
        for c in ErrorClassification::ALL {
            let json = serde_json::to_string(&c).unwrap();
            assert_eq!(json, format!("\"{c}\""));
        }
        let parsed: RecoveryStrategy = serde_json::from_str("\"fail_incident\"").unwrap();
        assert_eq!(parsed, RecoveryStrategy::FailIncident);
    }
}
