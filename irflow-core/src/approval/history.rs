//! Bounded log of approval decisions.

use crate::types::IncidentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default number of decisions retained.
pub const DEFAULT_CAPACITY: usize = 1000;

/// One `can_auto_approve` verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub timestamp: DateTime<Utc>,
    pub incident_id: IncidentId,
    pub action_types: Vec<String>,
    pub approved: bool,
    pub reasons: Vec<String>,
    pub rules_evaluated_count: usize,
}

/// Aggregate view over the retained decisions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApprovalStatistics {
    pub total_decisions: usize,
    pub approved: usize,
    pub denied: usize,
    pub approval_rate: f64,
}

/// Ring buffer of decisions; the oldest is evicted once full.
#[derive(Debug)]
pub struct DecisionHistory {
    entries: VecDeque<ApprovalDecision>,
    capacity: usize,
}

impl DecisionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
        }
    }

    pub fn record(&mut self, decision: ApprovalDecision) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(decision);
    }

    /// The most recent `n` decisions, newest first.
    pub fn recent(&self, n: usize) -> Vec<ApprovalDecision> {
        self.entries.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn statistics(&self) -> ApprovalStatistics {
        let total = self.entries.len();
        let approved = self.entries.iter().filter(|d| d.approved).count();
        ApprovalStatistics {
            total_decisions: total,
            approved,
            denied: total - approved,
            approval_rate: if total == 0 {
                0.0
            } else {
                approved as f64 / total as f64
            },
        }
    }
}

impl Default for DecisionHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
