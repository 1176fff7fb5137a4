//! In-memory collaborators for tests and the CLI simulation.

use super::{
    AuditEntry, AuditTrail, IncidentPatch, IncidentRecord, IncidentStore, NotificationDispatcher,
    NotificationPriority, WorkflowDriver,
};
use crate::error::CollaboratorError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// Incident store backed by a `HashMap`. Updating an unknown incident
/// creates it.
#[derive(Debug, Default)]
pub struct InMemoryIncidentStore {
    incidents: Mutex<HashMap<String, IncidentRecord>>,
    fail_writes: AtomicBool,
}

impl InMemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: IncidentRecord) {
        self.incidents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id.clone(), record);
    }

    /// Make every subsequent `update` fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot(&self, id: &str) -> Option<IncidentRecord> {
        self.incidents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

#[async_trait]
impl IncidentStore for InMemoryIncidentStore {
    async fn get(&self, id: &str) -> Result<Option<IncidentRecord>, CollaboratorError> {
        Ok(self.snapshot(id))
    }

    async fn update(&self, id: &str, patch: IncidentPatch) -> Result<(), CollaboratorError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Store {
                message: format!("write rejected for {id}"),
            });
        }
        let mut incidents = self.incidents.lock().unwrap_or_else(PoisonError::into_inner);
        let record = incidents
            .entry(id.to_string())
            .or_insert_with(|| IncidentRecord {
                id: id.to_string(),
                ..Default::default()
            });
        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(note) = patch.note {
            record.notes.push(note);
        }
        record.fields.extend(patch.fields);
        Ok(())
    }
}

/// Audit trail that keeps every entry in memory.
#[derive(Debug, Default)]
pub struct InMemoryAuditTrail {
    entries: Mutex<Vec<AuditEntry>>,
    fail_appends: AtomicBool,
}

impl InMemoryAuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// An audit trail whose appends always fail.
    pub fn failing() -> Self {
        let trail = Self::default();
        trail.fail_appends.store(true, Ordering::SeqCst);
        trail
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AuditTrail for InMemoryAuditTrail {
    async fn append(&self, entry: AuditEntry) -> Result<(), CollaboratorError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Audit {
                message: "audit backend unavailable".into(),
            });
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        Ok(())
    }
}

/// A notification captured by `RecordingDispatcher`.
#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub incident_id: Option<String>,
    pub category: String,
    pub message: String,
    pub priority: NotificationPriority,
}

/// Dispatcher that records instead of delivering.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<SentNotification>>,
    fail: AtomicBool,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `send` fail without recording.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn send(
        &self,
        incident_id: Option<&str>,
        category: &str,
        message: &str,
        priority: NotificationPriority,
    ) -> Result<(), CollaboratorError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Notification {
                message: format!("{category} channel unreachable"),
            });
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentNotification {
                incident_id: incident_id.map(str::to_string),
                category: category.to_string(),
                message: message.to_string(),
                priority,
            });
        Ok(())
    }
}

/// A request observed by `RecordingWorkflowDriver`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowRequest {
    Analysis(String),
    Remediation(String),
    AgentRestart(Option<String>),
}

/// Workflow driver that records requests and succeeds (or fails, when told to).
#[derive(Debug, Default)]
pub struct RecordingWorkflowDriver {
    requests: Mutex<Vec<WorkflowRequest>>,
    agent_restart: bool,
    fail: AtomicBool,
}

impl RecordingWorkflowDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A driver that also exposes a generic agent restart.
    pub fn with_agent_restart() -> Self {
        Self {
            agent_restart: true,
            ..Self::default()
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<WorkflowRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, request: WorkflowRequest) -> Result<(), CollaboratorError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Workflow {
                message: format!("{request:?} rejected"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowDriver for RecordingWorkflowDriver {
    async fn request_analysis(&self, incident_id: &str) -> Result<(), CollaboratorError> {
        self.record(WorkflowRequest::Analysis(incident_id.to_string()))
    }

    async fn request_remediation(&self, incident_id: &str) -> Result<(), CollaboratorError> {
        self.record(WorkflowRequest::Remediation(incident_id.to_string()))
    }

    async fn restart_agent(
        &self,
        incident_id: Option<&str>,
    ) -> Option<Result<(), CollaboratorError>> {
        if !self.agent_restart {
            return None;
        }
        Some(self.record(WorkflowRequest::AgentRestart(
            incident_id.map(str::to_string),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_update_creates_and_patches() {
        let store = InMemoryIncidentStore::new();
        store
            .update("inc-1", IncidentPatch::status("failed").with_field("reason", "boom"))
            .await
            .unwrap();
        store
            .update("inc-1", IncidentPatch::note("skipped enrichment"))
            .await
            .unwrap();

        let record = store.get("inc-1").await.unwrap().unwrap();
        assert_eq!(record.status, "failed");
        assert_eq!(record.notes, vec!["skipped enrichment".to_string()]);
        assert_eq!(record.fields["reason"], "boom");
    }

    #[tokio::test]
    async fn test_store_write_failure() {
        let store = InMemoryIncidentStore::new();
        store.set_fail_writes(true);
        let err = store
            .update("inc-1", IncidentPatch::status("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Store { .. }));
    }

    #[tokio::test]
    async fn test_driver_without_agent_restart() {
        let driver = RecordingWorkflowDriver::new();
        assert!(driver.restart_agent(Some("inc-1")).await.is_none());
        let driver = RecordingWorkflowDriver::with_agent_restart();
        assert!(matches!(driver.restart_agent(Some("inc-1")).await, Some(Ok(()))));
        assert_eq!(
            driver.requests(),
            vec![WorkflowRequest::AgentRestart(Some("inc-1".into()))]
        );
    }
}
