use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use sizeflow_core::{MessageId, OrderId, PhoneNumber};
use sizeflow_messaging::{ParsedReply, TemplateName};
use sizeflow_workflow::{Workflow, WorkflowState};

/// Persistence failure.
///
/// Any `StoreError` aborts the current tick: once a write has failed nothing
/// read afterwards can be trusted.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error in {operation}: {message}")]
    Database { operation: &'static str, message: String },

    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },

    #[error("migration failed: {0}")]
    Migration(String),
}

impl StoreError {
    pub fn database(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Database {
            operation,
            message: message.into(),
        }
    }

    pub fn corrupt(table: &'static str, message: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A customer, keyed by the order they placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: OrderId,
    pub phone: PhoneNumber,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An inbound customer message. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxRecord {
    /// `"<timestamp>:<from>"`; redeliveries of the same message collide here.
    pub id: String,
    pub order_id: Option<OrderId>,
    pub from_phone: PhoneNumber,
    pub text: String,
    pub parsed: ParsedReply,
    /// Vendor timestamp.
    pub sent_at: DateTime<Utc>,
    /// When we stored it.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    DryRun,
    Sent,
    Error,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::DryRun => "DRY_RUN",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRY_RUN" => Some(OutboxStatus::DryRun),
            "SENT" => Some(OutboxStatus::Sent),
            "ERROR" => Some(OutboxStatus::Error),
            _ => None,
        }
    }

    /// `SENT` and `DRY_RUN` rows block any further send of the same template.
    pub fn is_delivered(&self) -> bool {
        matches!(self, OutboxStatus::DryRun | OutboxStatus::Sent)
    }
}

/// One outbound send attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: MessageId,
    pub order_id: OrderId,
    pub to_phone: PhoneNumber,
    pub template: String,
    pub payload: JsonValue,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// A delivered workflow template: at most one such row per
    /// `(order, template)`. Session-reopen rows are not limited.
    pub fn is_once_only(&self) -> bool {
        self.status.is_delivered() && TemplateName::parse(&self.template).is_some()
    }
}

/// Recommendation snapshot; the newest row per order is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationRecord {
    pub order_id: OrderId,
    pub recommended_size: String,
    pub confidence: f64,
    pub height: u32,
    pub weight: u32,
    /// Set only on the snapshot written at confirmation.
    pub final_size: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit trail entry. Written by the engine and the webhook, never read by
/// the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub order_id: Option<OrderId>,
    pub kind: String,
    pub data: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(order_id: Option<OrderId>, kind: impl Into<String>, data: JsonValue, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            order_id,
            kind: kind.into(),
            data,
            created_at: at,
        }
    }
}

/// Everything one transition writes.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionCommit {
    pub order_id: OrderId,
    /// Compare-and-set guard: the update applies only if the order is
    /// still in this state.
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub at: DateTime<Utc>,
    /// Earlier vendor calls of the same unit (a send rejected for the
    /// session window, the reopen template), written before `outbox`.
    pub attempts: Vec<OutboxRecord>,
    pub outbox: Option<OutboxRecord>,
    pub recommendation: Option<RecommendationRecord>,
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Another tick moved the order first, or already recorded a delivered
    /// row for the same template. Nothing was written.
    LostRace,
}

#[async_trait::async_trait]
pub trait WorkflowRepo: Send + Sync {
    /// Insert a workflow; returns `false` if the order is already enrolled.
    async fn create_workflow(&self, workflow: &Workflow) -> StoreResult<bool>;

    async fn get_workflow(&self, order_id: &OrderId) -> StoreResult<Option<Workflow>>;

    /// Workflows in any of `states`, oldest first.
    async fn list_workflows(&self, states: &[WorkflowState]) -> StoreResult<Vec<Workflow>>;

    /// Number of workflows per state; every state is present.
    async fn count_by_state(&self) -> StoreResult<BTreeMap<WorkflowState, u64>>;
}

#[async_trait::async_trait]
pub trait CustomerRepo: Send + Sync {
    /// Insert or replace the phone (and name, if given) for a customer.
    async fn upsert_customer(&self, customer: &Customer) -> StoreResult<()>;

    async fn phone_for_order(&self, order_id: &OrderId) -> StoreResult<Option<PhoneNumber>>;
}

#[async_trait::async_trait]
pub trait InboxRepo: Send + Sync {
    /// Store an inbound message and its audit event together.
    ///
    /// Returns `false` (and writes nothing) if a message with the same id is
    /// already stored.
    async fn record_inbound(&self, message: &InboxRecord, event: &EventRecord) -> StoreResult<bool>;

    /// Messages from `phone` stored at or after `since`, newest first.
    async fn inbound_since(
        &self,
        phone: &PhoneNumber,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<InboxRecord>>;
}

#[async_trait::async_trait]
pub trait OutboxRepo: Send + Sync {
    /// The `SENT`/`DRY_RUN` row for `(order_id, template)`, if any.
    async fn delivered(&self, order_id: &OrderId, template: &str) -> StoreResult<Option<OutboxRecord>>;

    /// Record an attempt outside a transition (failed sends).
    async fn record_attempt(&self, record: &OutboxRecord) -> StoreResult<()>;

    /// Number of `ERROR` rows for `(order_id, template)`.
    async fn failed_attempts(&self, order_id: &OrderId, template: &str) -> StoreResult<u32>;

    /// All attempts for an order, oldest first.
    async fn outbox_for_order(&self, order_id: &OrderId) -> StoreResult<Vec<OutboxRecord>>;
}

#[async_trait::async_trait]
pub trait RecommendationRepo: Send + Sync {
    async fn latest_recommendation(&self, order_id: &OrderId) -> StoreResult<Option<RecommendationRecord>>;

    /// All snapshots for an order, oldest first.
    async fn recommendations_for(&self, order_id: &OrderId) -> StoreResult<Vec<RecommendationRecord>>;
}

#[async_trait::async_trait]
pub trait EventLogRepo: Send + Sync {
    async fn append_event(&self, event: &EventRecord) -> StoreResult<()>;

    async fn events_for(&self, order_id: &OrderId) -> StoreResult<Vec<EventRecord>>;
}

#[async_trait::async_trait]
pub trait TransitionStore: Send + Sync {
    /// Apply a transition atomically: state compare-and-set, outbox row,
    /// recommendation snapshot and audit events, all or nothing.
    async fn commit_transition(&self, commit: &TransitionCommit) -> StoreResult<CommitOutcome>;
}

/// Everything the engine and webhook need from persistence.
pub trait Store:
    WorkflowRepo + CustomerRepo + InboxRepo + OutboxRepo + RecommendationRepo + EventLogRepo + TransitionStore
{
}

impl<T> Store for T where
    T: WorkflowRepo
        + CustomerRepo
        + InboxRepo
        + OutboxRepo
        + RecommendationRepo
        + EventLogRepo
        + TransitionStore
{
}

/// Zero-filled per-state counter.
pub(crate) fn empty_counts() -> BTreeMap<WorkflowState, u64> {
    WorkflowState::ALL.into_iter().map(|s| (s, 0)).collect()
}
