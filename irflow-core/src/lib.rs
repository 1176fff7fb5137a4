//! # irflow Core
//!
//! Core library for irflow, the incident-response decision layer.
//! Provides the incident lifecycle state machine, the rule-based
//! auto-approval engine, the recovery manager with per-classification
//! circuit breakers, collaborator interfaces, and configuration.

pub mod approval;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod recovery;
pub mod state_machine;
pub mod types;

// Re-export commonly used types at the crate root.
pub use approval::{
    ApprovalOutcome, ApprovalRule, AutoApprovalEngine, IncidentSnapshot, ProposedAction,
};
pub use collaborators::{Clock, Collaborators, ManualClock, Scheduler, SystemClock};
pub use config::{ApprovalConfig, IrflowConfig, RecoveryConfig, load_config};
pub use error::{CollaboratorError, ConfigError, IrflowError, Result, RuleError};
pub use recovery::{
    ErrorClassification, ErrorStatistics, RecoveryContext, RecoveryManager, RecoveryStrategy,
};
pub use state_machine::{StateMachine, TransitionKind, TransitionRecord};
pub use types::{IncidentId, IncidentState, TransitionContext};
