use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use sizeflow_core::{OrderId, PhoneNumber};
use sizeflow_workflow::{Workflow, WorkflowState};

use super::r#trait::{
    empty_counts, CommitOutcome, Customer, CustomerRepo, EventLogRepo, EventRecord, InboxRecord,
    InboxRepo, OutboxRecord, OutboxRepo, OutboxStatus, RecommendationRecord, RecommendationRepo,
    StoreResult, TransitionCommit, TransitionStore, WorkflowRepo,
};

#[derive(Debug, Default)]
struct Tables {
    workflows: HashMap<OrderId, Workflow>,
    customers: HashMap<OrderId, Customer>,
    inbox: Vec<InboxRecord>,
    inbox_ids: HashSet<String>,
    outbox: Vec<OutboxRecord>,
    recommendations: Vec<RecommendationRecord>,
    events: Vec<EventRecord>,
}

impl Tables {
    fn delivered(&self, order_id: &OrderId, template: &str) -> Option<&OutboxRecord> {
        self.outbox
            .iter()
            .find(|r| &r.order_id == order_id && r.template == template && r.status.is_delivered())
    }
}

/// In-memory store for tests and local runs.
///
/// A single lock over all tables makes every transition trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Overwrite a workflow row as-is (test setup for arbitrary states).
    pub fn put_workflow(&self, workflow: Workflow) {
        let mut tables = self.tables.write().unwrap();
        tables.workflows.insert(workflow.order_id.clone(), workflow);
    }
}

#[async_trait::async_trait]
impl WorkflowRepo for InMemoryStore {
    async fn create_workflow(&self, workflow: &Workflow) -> StoreResult<bool> {
        let mut tables = self.tables.write().unwrap();
        if tables.workflows.contains_key(&workflow.order_id) {
            return Ok(false);
        }
        tables
            .workflows
            .insert(workflow.order_id.clone(), workflow.clone());
        Ok(true)
    }

    async fn get_workflow(&self, order_id: &OrderId) -> StoreResult<Option<Workflow>> {
        let tables = self.tables.read().unwrap();
        Ok(tables.workflows.get(order_id).cloned())
    }

    async fn list_workflows(&self, states: &[WorkflowState]) -> StoreResult<Vec<Workflow>> {
        let tables = self.tables.read().unwrap();
        let mut result: Vec<Workflow> = tables
            .workflows
            .values()
            .filter(|w| states.contains(&w.state))
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.order_id.cmp(&b.order_id))
        });
        Ok(result)
    }

    async fn count_by_state(&self) -> StoreResult<BTreeMap<WorkflowState, u64>> {
        let tables = self.tables.read().unwrap();
        let mut counts = empty_counts();
        for workflow in tables.workflows.values() {
            *counts.entry(workflow.state).or_default() += 1;
        }
        Ok(counts)
    }
}

#[async_trait::async_trait]
impl CustomerRepo for InMemoryStore {
    async fn upsert_customer(&self, customer: &Customer) -> StoreResult<()> {
        let mut tables = self.tables.write().unwrap();
        match tables.customers.get_mut(&customer.id) {
            Some(existing) => {
                existing.phone = customer.phone.clone();
                if customer.name.is_some() {
                    existing.name = customer.name.clone();
                }
            }
            None => {
                tables.customers.insert(customer.id.clone(), customer.clone());
            }
        }
        Ok(())
    }

    async fn phone_for_order(&self, order_id: &OrderId) -> StoreResult<Option<PhoneNumber>> {
        let tables = self.tables.read().unwrap();
        Ok(tables.customers.get(order_id).map(|c| c.phone.clone()))
    }
}

#[async_trait::async_trait]
impl InboxRepo for InMemoryStore {
    async fn record_inbound(&self, message: &InboxRecord, event: &EventRecord) -> StoreResult<bool> {
        let mut tables = self.tables.write().unwrap();
        if !tables.inbox_ids.insert(message.id.clone()) {
            return Ok(false);
        }
        tables.inbox.push(message.clone());
        tables.events.push(event.clone());
        Ok(true)
    }

    async fn inbound_since(
        &self,
        phone: &PhoneNumber,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<InboxRecord>> {
        let tables = self.tables.read().unwrap();
        // Insertion order breaks created_at ties: later inserts are newer.
        let result = tables
            .inbox
            .iter()
            .enumerate()
            .filter(|(_, m)| &m.from_phone == phone && m.created_at >= since)
            .map(|(i, m)| (m.created_at, i, m.clone()));
        let mut result: Vec<_> = result.collect();
        result.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        Ok(result.into_iter().map(|(_, _, m)| m).collect())
    }
}

#[async_trait::async_trait]
impl OutboxRepo for InMemoryStore {
    async fn delivered(&self, order_id: &OrderId, template: &str) -> StoreResult<Option<OutboxRecord>> {
        let tables = self.tables.read().unwrap();
        Ok(tables.delivered(order_id, template).cloned())
    }

    async fn record_attempt(&self, record: &OutboxRecord) -> StoreResult<()> {
        let mut tables = self.tables.write().unwrap();
        if record.is_once_only() && tables.delivered(&record.order_id, &record.template).is_some() {
            return Err(super::StoreError::database(
                "record_attempt",
                format!(
                    "duplicate delivered row for order {} template {}",
                    record.order_id, record.template
                ),
            ));
        }
        tables.outbox.push(record.clone());
        Ok(())
    }

    async fn failed_attempts(&self, order_id: &OrderId, template: &str) -> StoreResult<u32> {
        let tables = self.tables.read().unwrap();
        let count = tables
            .outbox
            .iter()
            .filter(|r| &r.order_id == order_id && r.template == template && r.status == OutboxStatus::Error)
            .count();
        Ok(count as u32)
    }

    async fn outbox_for_order(&self, order_id: &OrderId) -> StoreResult<Vec<OutboxRecord>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .outbox
            .iter()
            .filter(|r| &r.order_id == order_id)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl RecommendationRepo for InMemoryStore {
    async fn latest_recommendation(&self, order_id: &OrderId) -> StoreResult<Option<RecommendationRecord>> {
        let tables = self.tables.read().unwrap();
        // max_by_key keeps the last of equal keys, i.e. the latest insert.
        Ok(tables
            .recommendations
            .iter()
            .filter(|r| &r.order_id == order_id)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn recommendations_for(&self, order_id: &OrderId) -> StoreResult<Vec<RecommendationRecord>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .recommendations
            .iter()
            .filter(|r| &r.order_id == order_id)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl EventLogRepo for InMemoryStore {
    async fn append_event(&self, event: &EventRecord) -> StoreResult<()> {
        let mut tables = self.tables.write().unwrap();
        tables.events.push(event.clone());
        Ok(())
    }

    async fn events_for(&self, order_id: &OrderId) -> StoreResult<Vec<EventRecord>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .events
            .iter()
            .filter(|e| e.order_id.as_ref() == Some(order_id))
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl TransitionStore for InMemoryStore {
    async fn commit_transition(&self, commit: &TransitionCommit) -> StoreResult<CommitOutcome> {
        let mut tables = self.tables.write().unwrap();

        match tables.workflows.get(&commit.order_id) {
            Some(w) if w.state == commit.from => {}
            _ => return Ok(CommitOutcome::LostRace),
        }
        if let Some(row) = &commit.outbox {
            if row.is_once_only() && tables.delivered(&row.order_id, &row.template).is_some() {
                return Ok(CommitOutcome::LostRace);
            }
        }

        if let Some(workflow) = tables.workflows.get_mut(&commit.order_id) {
            workflow.state = commit.to;
            workflow.updated_at = commit.at;
        }
        tables.outbox.extend(commit.attempts.iter().cloned());
        if let Some(row) = &commit.outbox {
            tables.outbox.push(row.clone());
        }
        if let Some(rec) = &commit.recommendation {
            tables.recommendations.push(rec.clone());
        }
        tables.events.extend(commit.events.iter().cloned());
        Ok(CommitOutcome::Committed)
    }
}
