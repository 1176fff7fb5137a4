//! Narrow interfaces to the systems the core depends on but does not own:
//! the incident store, the audit trail, notification delivery, the
//! orchestration layer's workflow hooks, and time.
//!
//! Every call into a collaborator is best-effort from the core's point of
//! view: failures are logged and never block the primary path.

pub mod clock;
pub mod memory;

pub use clock::{Clock, ManualClock, Scheduler, SystemClock, TokioScheduler};
pub use memory::{
    InMemoryAuditTrail, InMemoryIncidentStore, RecordingDispatcher, RecordingWorkflowDriver,
    SentNotification, WorkflowRequest,
};

use crate::error::CollaboratorError;
use crate::types::IncidentId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Incident store
// ---------------------------------------------------------------------------

/// The durable representation of an incident, as far as the core reads it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: IncidentId,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

/// A partial update applied by `IncidentStore::update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentPatch {
    pub status: Option<String>,
    pub note: Option<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl IncidentPatch {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            ..Default::default()
        }
    }

    pub fn note(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<IncidentRecord>, CollaboratorError>;

    async fn update(&self, id: &str, patch: IncidentPatch) -> Result<(), CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    StateTransition,
    AdministrativeOverride,
    ErrorRecorded,
    RecoveryAction,
    CircuitBreakerTripped,
    ManualInterventionRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub incident_id: Option<IncidentId>,
    pub details: Value,
    pub actor: String,
    pub severity: AuditSeverity,
}

#[async_trait]
pub trait AuditTrail: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<(), CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationPriority::Low => write!(f, "low"),
            NotificationPriority::Normal => write!(f, "normal"),
            NotificationPriority::High => write!(f, "high"),
            NotificationPriority::Urgent => write!(f, "urgent"),
        }
    }
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(
        &self,
        incident_id: Option<&str>,
        category: &str,
        message: &str,
        priority: NotificationPriority,
    ) -> Result<(), CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Workflow driver
// ---------------------------------------------------------------------------

/// Hooks into the orchestration layer, used to restart stalled work.
#[async_trait]
pub trait WorkflowDriver: Send + Sync {
    /// Re-issue the analysis request for an incident.
    async fn request_analysis(&self, incident_id: &str) -> Result<(), CollaboratorError>;

    /// Re-issue the remediation request for an incident.
    async fn request_remediation(&self, incident_id: &str) -> Result<(), CollaboratorError>;

    /// Restart the agent responsible for an incident. `None` means no
    /// generic restart is exposed.
    async fn restart_agent(
        &self,
        _incident_id: Option<&str>,
    ) -> Option<Result<(), CollaboratorError>> {
        None
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// The external systems the recovery manager calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn IncidentStore>,
    pub audit: Arc<dyn AuditTrail>,
    pub notifier: Arc<dyn NotificationDispatcher>,
    pub workflow: Arc<dyn WorkflowDriver>,
}

impl Collaborators {
    /// Fresh in-memory implementations of every collaborator.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryIncidentStore::new()),
            audit: Arc::new(InMemoryAuditTrail::new()),
            notifier: Arc::new(RecordingDispatcher::new()),
            workflow: Arc::new(RecordingWorkflowDriver::new()),
        }
    }
}
