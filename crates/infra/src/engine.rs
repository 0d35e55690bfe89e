//! Workflow engine: one tick = one pass over every active order.
//!
//! Each order is an independent unit of work. Units run on a bounded pool of
//! tokio tasks; the per-order transaction in the store (state compare-and-set
//! plus the partial unique index on delivered outbox rows) keeps sends at
//! most once per template regardless of how many ticks overlap.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use sizeflow_core::{OrderId, PhoneNumber};
use sizeflow_messaging::{MessageTemplate, TemplateName};
use sizeflow_sizing::{Gender, RecommendationEngine};
use sizeflow_workflow::{decide, Facts, StayReason, Step, Workflow, WorkflowState};

use crate::dispatcher::{Dispatch, Dispatcher, OutboundRequest};
use crate::store::{
    CommitOutcome, Customer, CustomerRepo, EventRecord, InboxRepo, OutboxRecord, OutboxRepo,
    OutboxStatus, RecommendationRecord, RecommendationRepo, Store, StoreError, TransitionCommit, TransitionStore,
    WorkflowRepo,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Orders processed in parallel within one tick.
    pub max_concurrent: usize,
    /// `ERROR` attempts for the pending template before the order is FAILED.
    pub max_send_failures: u32,
    pub default_gender: Gender,
    pub default_product: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_send_failures: 5,
            default_gender: Gender::Men,
            default_product: "CL".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_max_send_failures(mut self, max: u32) -> Self {
        self.max_send_failures = max;
        self
    }

    pub fn with_default_gender(mut self, gender: Gender) -> Self {
        self.default_gender = gender;
        self
    }

    pub fn with_default_product(mut self, product: impl Into<String>) -> Self {
        self.default_product = product.into();
        self
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Fatal for the tick.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("order worker did not complete: {0}")]
    Worker(String),
}

/// What one unit of work did to its order.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Unchanged(StayReason),
    Advanced {
        from: WorkflowState,
        to: WorkflowState,
    },
    /// The send failed and was recorded; the next tick retries.
    SendFailed { template: TemplateName, attempts: u32 },
    /// The send failed permanently, or for the last allowed time; the
    /// order is now FAILED.
    Failed { template: TemplateName },
    /// Another tick moved the order first; nothing was written.
    LostRace,
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub processed: u64,
    pub advanced: u64,
    pub unchanged: u64,
    pub send_failures: u64,
    pub failed: u64,
    pub lost_races: u64,
    /// Orders per state after the tick.
    pub states: BTreeMap<WorkflowState, u64>,
}

impl TickReport {
    fn record(&mut self, outcome: &OrderOutcome) {
        self.processed += 1;
        match outcome {
            OrderOutcome::Unchanged(_) => self.unchanged += 1,
            OrderOutcome::Advanced { .. } => self.advanced += 1,
            OrderOutcome::SendFailed { .. } => self.send_failures += 1,
            OrderOutcome::Failed { .. } => self.failed += 1,
            OrderOutcome::LostRace => self.lost_races += 1,
        }
    }
}

#[derive(Clone)]
pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    recommender: Arc<RecommendationEngine>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Dispatcher,
        recommender: RecommendationEngine,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            dispatcher: Arc::new(dispatcher),
            recommender: Arc::new(recommender),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register an order for size confirmation. Idempotent: an enrolled
    /// order keeps its state, only the customer's contact details update.
    #[instrument(skip_all, fields(order_id = %order_id), err)]
    pub async fn enroll(
        &self,
        order_id: OrderId,
        phone: PhoneNumber,
        name: Option<String>,
        store_name: Option<String>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        self.store
            .upsert_customer(&Customer {
                id: order_id.clone(),
                phone,
                name,
                created_at: now,
            })
            .await?;
        let created = self
            .store
            .create_workflow(&Workflow::new(order_id, store_name, now))
            .await?;
        if created {
            info!("order enrolled");
        }
        Ok(created)
    }

    /// Process every active order once.
    ///
    /// Vendor failures are recorded and left for the next tick; a store
    /// failure aborts the tick and cancels the remaining units.
    pub async fn tick(&self) -> Result<TickReport, EngineError> {
        let orders = self.store.list_workflows(&WorkflowState::ACTIVE).await?;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        debug!(orders = orders.len(), "tick started");
        for workflow in orders {
            let engine = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let order_id = workflow.order_id.clone();
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => engine.process_order(workflow).await,
                    Err(e) => Err(StoreError::database("acquire_worker", e.to_string())),
                };
                (order_id, result)
            });
        }

        let mut report = TickReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => report.record(&outcome),
                Ok((order_id, Err(e))) => {
                    error!(order_id = %order_id, error = %e, "persistence failure; aborting tick");
                    tasks.abort_all();
                    return Err(e.into());
                }
                Err(e) => {
                    error!(error = %e, "order worker panicked; aborting tick");
                    tasks.abort_all();
                    return Err(EngineError::Worker(e.to_string()));
                }
            }
        }

        report.states = self.store.count_by_state().await?;
        info!(
            processed = report.processed,
            advanced = report.advanced,
            send_failures = report.send_failures,
            failed = report.failed,
            lost_races = report.lost_races,
            "tick finished"
        );
        Ok(report)
    }

    /// Evaluate and apply the rule for one order's current state.
    #[instrument(skip(self, workflow), fields(order_id = %workflow.order_id, state = %workflow.state), err)]
    pub async fn process_order(&self, workflow: Workflow) -> Result<OrderOutcome, StoreError> {
        // Captured before the inbox is read, so replies stored after the
        // read still qualify next time.
        let at = Utc::now();
        let phone = self.store.phone_for_order(&workflow.order_id).await?;

        let replies = match (&phone, workflow.state) {
            (Some(phone), WorkflowState::WaitingSizeInfo | WorkflowState::WaitingConfirm) => {
                self.store.inbound_since(phone, workflow.updated_at).await?
            }
            _ => Vec::new(),
        };
        // Every reply read here is consumed: the new updated_at must lie past
        // all of them, including one stored between `Utc::now()` and the read.
        let at = replies
            .iter()
            .map(|r| r.created_at + TimeDelta::microseconds(1))
            .fold(at, std::cmp::max);
        let facts = Facts::from_replies(phone.is_some(), replies.iter().map(|r| &r.parsed));
        let step = decide(workflow.state, &facts);
        debug!(?step, replies = replies.len(), "decided");

        let (Some(phone), Some(to)) = (phone, step.target()) else {
            return Ok(match step {
                Step::Stay(reason) => OrderOutcome::Unchanged(reason),
                _ => OrderOutcome::Unchanged(StayReason::NoPhone),
            });
        };

        match step {
            Step::AskForMeasurements(name) => {
                let message = match name {
                    TemplateName::SizeCheckAgain => MessageTemplate::SizeCheckAgain,
                    _ => MessageTemplate::SizeCheck,
                };
                self.send_and_commit(&workflow, to, at, phone, message, None, Vec::new())
                    .await
            }
            Step::ProposeSize {
                height_cm,
                weight_kg,
            } => {
                let gender = self.config.default_gender;
                let product = self.config.default_product.as_str();
                let rec = self
                    .recommender
                    .recommend(height_cm, weight_kg, gender, product, None);
                info!(
                    height_cm,
                    weight_kg,
                    size = %rec.recommended_size,
                    confidence = rec.confidence,
                    "size recommended"
                );

                let snapshot = RecommendationRecord {
                    order_id: workflow.order_id.clone(),
                    recommended_size: rec.recommended_size.clone(),
                    confidence: rec.confidence,
                    height: height_cm,
                    weight: weight_kg,
                    final_size: None,
                    created_at: at,
                };
                let event = EventRecord::new(
                    Some(workflow.order_id.clone()),
                    "size_recommended",
                    json!({
                        "height_cm": height_cm,
                        "weight_kg": weight_kg,
                        "gender": gender.as_str(),
                        "product_type": product,
                        "recommendation": rec,
                    }),
                    at,
                );
                let message = MessageTemplate::SizeConfirm {
                    size: rec.recommended_size,
                    alternatives: rec.alternatives,
                };
                self.send_and_commit(&workflow, to, at, phone, message, Some(snapshot), vec![event])
                    .await
            }
            Step::ConfirmSize => {
                let latest = self.store.latest_recommendation(&workflow.order_id).await?;
                let snapshot = latest.map(|rec| RecommendationRecord {
                    final_size: Some(rec.recommended_size.clone()),
                    created_at: at,
                    ..rec
                });
                let event = match &snapshot {
                    Some(s) => EventRecord::new(
                        Some(workflow.order_id.clone()),
                        "size_confirmed",
                        json!({ "final_size": s.final_size, "confidence": s.confidence }),
                        at,
                    ),
                    None => {
                        warn!("confirmation without a recommendation; no final size recorded");
                        EventRecord::new(
                            Some(workflow.order_id.clone()),
                            "size_confirmed",
                            json!({ "final_size": null }),
                            at,
                        )
                    }
                };
                self.commit(&workflow, to, at, Vec::new(), None, snapshot, vec![event]).await
            }
            Step::Stay(reason) => Ok(OrderOutcome::Unchanged(reason)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_and_commit(
        &self,
        workflow: &Workflow,
        to: WorkflowState,
        at: DateTime<Utc>,
        phone: PhoneNumber,
        message: MessageTemplate,
        recommendation: Option<RecommendationRecord>,
        events: Vec<EventRecord>,
    ) -> Result<OrderOutcome, StoreError> {
        let template = message.name();
        let request = OutboundRequest::new(workflow.order_id.clone(), phone, &message);

        match self.dispatcher.send(&request).await? {
            Dispatch::AlreadyDelivered(_) => {
                self.commit(workflow, to, at, Vec::new(), None, recommendation, events)
                    .await
            }
            Dispatch::Delivered { record, prior } => {
                let outcome = self
                    .commit(workflow, to, at, prior.clone(), Some(record), recommendation, events)
                    .await?;
                if outcome == OrderOutcome::LostRace {
                    warn!(template = %template, "message sent but another tick recorded the transition");
                    // The vendor calls happened; keep them in the audit trail.
                    for attempt in &prior {
                        self.store.record_attempt(attempt).await?;
                    }
                }
                Ok(outcome)
            }
            Dispatch::Failed {
                record,
                transient,
                prior,
                ..
            } => {
                self.send_failed(workflow, template, prior, record, transient, at)
                    .await
            }
        }
    }

    /// Record a failed send. Transient failures are retried on later ticks up
    /// to `max_send_failures`; a permanent failure fails the order at once.
    async fn send_failed(
        &self,
        workflow: &Workflow,
        template: TemplateName,
        prior: Vec<OutboxRecord>,
        record: OutboxRecord,
        transient: bool,
        at: DateTime<Utc>,
    ) -> Result<OrderOutcome, StoreError> {
        let earlier_errors = prior
            .iter()
            .filter(|r| r.template == template.as_str() && r.status == OutboxStatus::Error)
            .count() as u32;
        let attempts = self
            .store
            .failed_attempts(&workflow.order_id, template.as_str())
            .await?
            + earlier_errors
            + 1;

        if transient && attempts < self.config.max_send_failures {
            for attempt in prior.iter().chain(std::iter::once(&record)) {
                self.store.record_attempt(attempt).await?;
            }
            warn!(template = %template, attempts, "send failed; will retry next tick");
            return Ok(OrderOutcome::SendFailed { template, attempts });
        }

        let reason = if transient { "retry_cap" } else { "permanent_error" };
        let event = EventRecord::new(
            Some(workflow.order_id.clone()),
            "workflow_failed",
            json!({
                "template": template.as_str(),
                "attempts": attempts,
                "reason": reason,
                "transient": transient,
                "last_error": record.payload.get("error"),
            }),
            at,
        );
        let outcome = self
            .commit(workflow, WorkflowState::Failed, at, prior, Some(record), None, vec![event])
            .await?;
        Ok(match outcome {
            OrderOutcome::Advanced { .. } => {
                warn!(template = %template, attempts, reason, "order failed");
                OrderOutcome::Failed { template }
            }
            other => other,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        workflow: &Workflow,
        to: WorkflowState,
        at: DateTime<Utc>,
        attempts: Vec<OutboxRecord>,
        outbox: Option<OutboxRecord>,
        recommendation: Option<RecommendationRecord>,
        mut events: Vec<EventRecord>,
    ) -> Result<OrderOutcome, StoreError> {
        let from = workflow.state;
        events.push(EventRecord::new(
            Some(workflow.order_id.clone()),
            "workflow_transition",
            json!({
                "from": from.as_str(),
                "to": to.as_str(),
                "template": outbox.as_ref().map(|o| o.template.as_str()),
                "status": outbox.as_ref().map(|o| o.status.as_str()),
            }),
            at,
        ));

        let commit = TransitionCommit {
            order_id: workflow.order_id.clone(),
            from,
            to,
            at,
            attempts,
            outbox,
            recommendation,
            events,
        };
        match self.store.commit_transition(&commit).await? {
            CommitOutcome::Committed => {
                info!(from = %from, to = %to, "transition committed");
                Ok(OrderOutcome::Advanced { from, to })
            }
            CommitOutcome::LostRace => {
                warn!(from = %from, to = %to, "transition lost to a concurrent tick");
                Ok(OrderOutcome::LostRace)
            }
        }
    }
}
