use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use sizeflow_core::OrderId;

/// Workflow states, stored as their upper-case names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    New,
    WaitingSizeInfo,
    WaitingConfirm,
    Confirmed,
    /// Gave up after repeated send failures.
    Failed,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 5] = [
        WorkflowState::New,
        WorkflowState::WaitingSizeInfo,
        WorkflowState::WaitingConfirm,
        WorkflowState::Confirmed,
        WorkflowState::Failed,
    ];

    /// States a tick scans.
    pub const ACTIVE: [WorkflowState; 3] = [
        WorkflowState::New,
        WorkflowState::WaitingSizeInfo,
        WorkflowState::WaitingConfirm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::New => "NEW",
            WorkflowState::WaitingSizeInfo => "WAITING_SIZE_INFO",
            WorkflowState::WaitingConfirm => "WAITING_CONFIRM",
            WorkflowState::Confirmed => "CONFIRMED",
            WorkflowState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Confirmed | WorkflowState::Failed)
    }
}

impl core::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown workflow state: {0:?}")]
pub struct ParseStateError(pub String);

impl core::str::FromStr for WorkflowState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseStateError(s.to_string()))
    }
}

/// One order's progress through the size-confirmation flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub order_id: OrderId,
    pub state: WorkflowState,
    /// When the order entered `state`.
    pub updated_at: DateTime<Utc>,
    pub store_name: Option<String>,
}

impl Workflow {
    /// A freshly enrolled order.
    pub fn new(order_id: OrderId, store_name: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            order_id,
            state: WorkflowState::New,
            updated_at: now,
            store_name,
        }
    }
}
