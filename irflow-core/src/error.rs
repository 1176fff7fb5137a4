//! Error types for the irflow core library.
//!
//! Decision APIs (transitions, approvals, recovery) signal rejection with
//! booleans and never return these errors. They cover the fallible edges:
//! configuration, rule loading, and calls into external collaborators.

use std::path::PathBuf;

/// Errors from setting up the core: loading configuration and building the
/// approval engine.
#[derive(Debug, thiserror::Error)]
pub enum IrflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A layer could not be read or did not fit `IrflowConfig`.
    #[error("Failed to load configuration: {message}")]
    Load { message: String },
}

/// Errors raised while loading approval rules.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Rule file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Rule file parse error in {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid action pattern '{pattern}' in rule '{rule_id}': {message}")]
    InvalidPattern {
        rule_id: String,
        pattern: String,
        message: String,
    },

    #[error("Duplicate rule id: {rule_id}")]
    DuplicateId { rule_id: String },
}

/// Failures reported by external collaborators (store, audit, notifications,
/// workflow driver). Always handled best-effort by the core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Incident store error: {message}")]
    Store { message: String },

    #[error("Audit trail append failed: {message}")]
    Audit { message: String },

    #[error("Notification delivery failed: {message}")]
    Notification { message: String },

    #[error("Workflow driver error: {message}")]
    Workflow { message: String },
}

pub type Result<T> = std::result::Result<T, IrflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_error_converts_with_question_mark() {
        fn build() -> Result<()> {
            let duplicate = RuleError::DuplicateId {
                rule_id: "read-only".into(),
            };
            Err::<(), _>(duplicate)?;
            Ok(())
        }
        let err = build().unwrap_err();
        assert!(matches!(err, IrflowError::Rule(RuleError::DuplicateId { .. })));
        assert_eq!(err.to_string(), "Rule error: Duplicate rule id: read-only");
    }

    #[test]
    fn test_config_error_display() {
        let err = IrflowError::from(ConfigError::Load {
            message: "invalid type for key recovery.retry_limit".into(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: Failed to load configuration: \
             invalid type for key recovery.retry_limit"
        );
    }
}
