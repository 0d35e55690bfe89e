//! End-to-end tick scenarios.
//!
//! Tests: enroll -> tick -> inbound reply -> tick ... against both stores.
//!
//! Verifies:
//! - Repeated ticks without new replies change nothing
//! - A template is delivered at most once per order, even with overlapping ticks
//! - Vendor failures are retried on later ticks and capped; permanent ones fail the order
//! - Every vendor call, including the session-window fallback, lands in the outbox

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::Value as JsonValue;
    use tempfile::TempDir;
    use tokio::task::JoinSet;

    use sizeflow_core::{OrderId, PhoneNumber};
    use sizeflow_messaging::{parse, InboundMessage};
    use sizeflow_sizing::RecommendationEngine;
    use sizeflow_workflow::{StayReason, Workflow, WorkflowState};

    use crate::dispatcher::{DispatchMode, Dispatcher, DispatcherConfig};
    use crate::engine::{EngineConfig, OrderOutcome, WorkflowEngine};
    use crate::inbox::ingest;
    use crate::store::{
        EventLogRepo, EventRecord, InMemoryStore, InboxRecord, InboxRepo, OutboxRepo, OutboxStatus,
        RecommendationRepo, SqliteStore, Store, TransitionCommit, TransitionStore, WorkflowRepo,
    };
    use crate::vendor::{Document, MessagingVendor, VendorError, VendorMessageId};

    struct Harness {
        store: Arc<dyn Store>,
        engine: WorkflowEngine,
        _artifacts: TempDir,
    }

    impl Harness {
        fn dry_run(store: Arc<dyn Store>) -> Self {
            let artifacts = tempfile::tempdir().unwrap();
            let mode = DispatchMode::dry_run(artifacts.path());
            Self::with_mode(store, mode, EngineConfig::default(), artifacts)
        }

        fn with_mode(store: Arc<dyn Store>, mode: DispatchMode, config: EngineConfig, artifacts: TempDir) -> Self {
            let dispatcher = Dispatcher::new(store.clone(), mode, DispatcherConfig::default());
            let engine = WorkflowEngine::new(store.clone(), dispatcher, RecommendationEngine::default(), config);
            Self {
                store,
                engine,
                _artifacts: artifacts,
            }
        }

        async fn enroll(&self, order: &str, phone: &str) {
            self.engine
                .enroll(order_id(order), PhoneNumber::parse(phone).unwrap(), None, None)
                .await
                .unwrap();
        }

        /// Store a reply; `seq` keeps vendor timestamps (and so inbox ids) distinct.
        async fn reply(&self, phone: &str, seq: i64, text: &str) {
            let message = InboundMessage {
                from: PhoneNumber::parse(phone).unwrap(),
                to: String::new(),
                text: text.to_string(),
                timestamp: vendor_ts(seq),
            };
            let ingested = ingest(self.store.as_ref(), &message, Utc::now()).await.unwrap();
            assert!(!ingested.duplicate);
        }

        async fn state(&self, order: &str) -> WorkflowState {
            self.store.get_workflow(&order_id(order)).await.unwrap().unwrap().state
        }

        async fn templates(&self, order: &str) -> Vec<(String, OutboxStatus)> {
            self.store
                .outbox_for_order(&order_id(order))
                .await
                .unwrap()
                .into_iter()
                .map(|r| (r.template, r.status))
                .collect()
        }
    }

    const PHONE: &str = "+77011234567";

    fn order_id(raw: &str) -> OrderId {
        OrderId::new(raw).unwrap()
    }

    fn vendor_ts(seq: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + ChronoDuration::seconds(seq)
    }

    async fn sqlite() -> Arc<dyn Store> {
        Arc::new(SqliteStore::in_memory().await.unwrap())
    }

    /// File-backed database with a real connection pool, so concurrent
    /// units hold separate connections.
    async fn sqlite_file(dir: &TempDir) -> Arc<dyn Store> {
        let url = format!("sqlite://{}", dir.path().join("sizeflow.db").display());
        let store = SqliteStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        Arc::new(store)
    }

    fn memory() -> Arc<dyn Store> {
        InMemoryStore::arc()
    }

    fn delivered_per_template(rows: &[(String, OutboxStatus)]) -> HashMap<&str, usize> {
        let mut counts = HashMap::new();
        for (template, status) in rows {
            if status.is_delivered() {
                *counts.entry(template.as_str()).or_insert(0) += 1;
            }
        }
        counts
    }

    // ---------------------------------------------------------------------
    // Full flow
    // ---------------------------------------------------------------------

    async fn full_flow_reaches_confirmed(store: Arc<dyn Store>) {
        let h = Harness::dry_run(store);
        h.enroll("607640463", "8 (701) 123-45-67").await;

        let report = h.engine.tick().await.unwrap();
        assert_eq!(report.advanced, 1);
        assert_eq!(h.state("607640463").await, WorkflowState::WaitingSizeInfo);
        assert_eq!(
            h.templates("607640463").await,
            vec![("size_check".to_string(), OutboxStatus::DryRun)]
        );

        // Nothing new from the customer: nothing happens.
        let report = h.engine.tick().await.unwrap();
        assert_eq!(report.advanced, 0);
        assert_eq!(report.unchanged, 1);
        assert_eq!(h.templates("607640463").await.len(), 1);

        h.reply(PHONE, 1, "Рост 175 см, вес 80 кг").await;
        h.engine.tick().await.unwrap();
        assert_eq!(h.state("607640463").await, WorkflowState::WaitingConfirm);

        let rec = h
            .store
            .latest_recommendation(&order_id("607640463"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.recommended_size, "L");
        assert_eq!((rec.height, rec.weight), (175, 80));
        assert!(rec.final_size.is_none());

        let outbox = h.store.outbox_for_order(&order_id("607640463")).await.unwrap();
        let confirm = outbox.iter().find(|r| r.template == "size_confirm").unwrap();
        assert_eq!(confirm.payload["variables"]["size"], "L");
        assert!(confirm.payload["text"].as_str().unwrap().contains("L"));

        h.reply(PHONE, 2, "Да, подходит").await;
        let report = h.engine.tick().await.unwrap();
        assert_eq!(h.state("607640463").await, WorkflowState::Confirmed);
        assert_eq!(report.states[&WorkflowState::Confirmed], 1);

        let rec = h
            .store
            .latest_recommendation(&order_id("607640463"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.final_size.as_deref(), Some("L"));

        // Terminal: later ticks skip the order entirely.
        h.reply(PHONE, 3, "нет").await;
        let report = h.engine.tick().await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(h.templates("607640463").await.len(), 2);

        let kinds: Vec<String> = h
            .store
            .events_for(&order_id("607640463"))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&"size_recommended".to_string()));
        assert!(kinds.contains(&"size_confirmed".to_string()));
        assert_eq!(kinds.iter().filter(|k| *k == "workflow_transition").count(), 3);
    }

    #[tokio::test]
    async fn full_flow_in_memory() {
        full_flow_reaches_confirmed(memory()).await;
    }

    #[tokio::test]
    async fn full_flow_sqlite() {
        full_flow_reaches_confirmed(sqlite().await).await;
    }

    // ---------------------------------------------------------------------
    // Single-rule scenarios
    // ---------------------------------------------------------------------

    async fn new_order_without_phone_stays_new(store: Arc<dyn Store>) {
        let h = Harness::dry_run(store);
        h.store
            .create_workflow(&Workflow::new(order_id("1"), None, Utc::now()))
            .await
            .unwrap();

        for _ in 0..2 {
            let report = h.engine.tick().await.unwrap();
            assert_eq!(report.unchanged, 1);
        }
        assert_eq!(h.state("1").await, WorkflowState::New);
        assert!(h.templates("1").await.is_empty());

        let wf = h.store.get_workflow(&order_id("1")).await.unwrap().unwrap();
        let outcome = h.engine.process_order(wf).await.unwrap();
        assert_eq!(outcome, OrderOutcome::Unchanged(StayReason::NoPhone));
    }

    #[tokio::test]
    async fn no_phone_in_memory() {
        new_order_without_phone_stays_new(memory()).await;
    }

    #[tokio::test]
    async fn no_phone_sqlite() {
        new_order_without_phone_stays_new(sqlite().await).await;
    }

    async fn refusal_asks_again_exactly_once(store: Arc<dyn Store>) {
        let h = Harness::dry_run(store);
        h.enroll("3", "+77012223344").await;
        // Put the order straight into WAITING_CONFIRM.
        let outcome = h
            .store
            .commit_transition(&TransitionCommit {
                order_id: order_id("3"),
                from: WorkflowState::New,
                to: WorkflowState::WaitingConfirm,
                at: Utc::now(),
                attempts: vec![],
                outbox: None,
                recommendation: None,
                events: vec![],
            })
            .await
            .unwrap();
        assert_eq!(outcome, crate::store::CommitOutcome::Committed);

        h.reply("+77012223344", 1, "Нет, не подходит").await;
        h.engine.tick().await.unwrap();

        assert_eq!(h.state("3").await, WorkflowState::WaitingSizeInfo);
        assert_eq!(
            h.templates("3").await,
            vec![("size_check_again".to_string(), OutboxStatus::DryRun)]
        );

        // The refusal carries no measurements; the order waits.
        h.engine.tick().await.unwrap();
        h.engine.tick().await.unwrap();
        assert_eq!(h.state("3").await, WorkflowState::WaitingSizeInfo);
        assert_eq!(h.templates("3").await.len(), 1);
    }

    #[tokio::test]
    async fn refusal_in_memory() {
        refusal_asks_again_exactly_once(memory()).await;
    }

    #[tokio::test]
    async fn refusal_sqlite() {
        refusal_asks_again_exactly_once(sqlite().await).await;
    }

    #[tokio::test]
    async fn state_decides_which_rule_a_reply_triggers() {
        let h = Harness::dry_run(memory());
        h.enroll("4", PHONE).await;
        h.engine.tick().await.unwrap();

        h.reply(PHONE, 1, "175 см 80 кг да").await;
        h.engine.tick().await.unwrap();
        assert_eq!(h.state("4").await, WorkflowState::WaitingConfirm);

        // The same message does not also confirm.
        h.engine.tick().await.unwrap();
        assert_eq!(h.state("4").await, WorkflowState::WaitingConfirm);
    }

    async fn reply_stored_mid_unit_is_consumed_once(store: Arc<dyn Store>) {
        let h = Harness::dry_run(store);
        h.enroll("8", PHONE).await;
        h.engine.tick().await.unwrap();
        assert_eq!(h.state("8").await, WorkflowState::WaitingSizeInfo);

        // Stored after the unit took its clock reading but before it read
        // the inbox: created_at is later than the unit's own timestamp.
        let created_at = Utc::now() + ChronoDuration::seconds(30);
        let text = "175 см 80 кг да";
        let record = InboxRecord {
            id: format!("late:{PHONE}"),
            order_id: None,
            from_phone: PhoneNumber::parse(PHONE).unwrap(),
            text: text.to_string(),
            parsed: parse(text),
            sent_at: vendor_ts(1),
            created_at,
        };
        let event = EventRecord::new(None, "wa_inbound", serde_json::json!({}), created_at);
        assert!(h.store.record_inbound(&record, &event).await.unwrap());

        h.engine.tick().await.unwrap();
        assert_eq!(h.state("8").await, WorkflowState::WaitingConfirm);
        let wf = h.store.get_workflow(&order_id("8")).await.unwrap().unwrap();
        assert!(wf.updated_at > created_at);

        // The "да" in the consumed message must not confirm as well.
        let report = h.engine.tick().await.unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(h.state("8").await, WorkflowState::WaitingConfirm);
    }

    #[tokio::test]
    async fn reply_stored_mid_unit_in_memory() {
        reply_stored_mid_unit_is_consumed_once(memory()).await;
    }

    #[tokio::test]
    async fn reply_stored_mid_unit_sqlite() {
        reply_stored_mid_unit_is_consumed_once(sqlite().await).await;
    }

    #[tokio::test]
    async fn second_cycle_records_new_snapshot_without_resending() {
        let h = Harness::dry_run(sqlite().await);
        h.enroll("5", PHONE).await;
        h.engine.tick().await.unwrap();
        h.reply(PHONE, 1, "175 см 80 кг").await;
        h.engine.tick().await.unwrap();
        h.reply(PHONE, 2, "нет").await;
        h.engine.tick().await.unwrap();
        assert_eq!(h.state("5").await, WorkflowState::WaitingSizeInfo);

        h.reply(PHONE, 3, "160 см 50 кг").await;
        h.engine.tick().await.unwrap();
        assert_eq!(h.state("5").await, WorkflowState::WaitingConfirm);

        let snapshots = h.store.recommendations_for(&order_id("5")).await.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[1].height, 160);

        let rows = h.templates("5").await;
        let delivered = delivered_per_template(&rows);
        assert_eq!(delivered.get("size_confirm"), Some(&1));
        assert_eq!(delivered.get("size_check_again"), Some(&1));
    }

    // ---------------------------------------------------------------------
    // Vendor failures
    // ---------------------------------------------------------------------

    /// Fails the first `failures` text sends with `error` (a 503 unless
    /// given), then succeeds.
    struct FlakyVendor {
        failures: AtomicU32,
        sent: AtomicU32,
        error: VendorError,
    }

    impl FlakyVendor {
        fn new(failures: u32) -> Arc<Self> {
            Self::failing_with(
                failures,
                VendorError::Api {
                    status: 503,
                    message: "service unavailable".into(),
                    code: None,
                    subcode: None,
                    title: None,
                },
            )
        }

        fn failing_with(failures: u32, error: VendorError) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(failures),
                sent: AtomicU32::new(0),
                error,
            })
        }
    }

    #[async_trait::async_trait]
    impl MessagingVendor for FlakyVendor {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn send_text(&self, _to: &PhoneNumber, _text: &str) -> Result<VendorMessageId, VendorError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(self.error.clone());
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(Some("wamid.ok".into()))
        }

        async fn send_template(
            &self,
            _to: &PhoneNumber,
            _name: &str,
            _language: &str,
            _components: Option<JsonValue>,
        ) -> Result<VendorMessageId, VendorError> {
            Ok(None)
        }

        async fn send_document(&self, _to: &PhoneNumber, _document: &Document) -> Result<VendorMessageId, VendorError> {
            Ok(None)
        }
    }

    fn live(store: Arc<dyn Store>, vendor: Arc<FlakyVendor>, max_send_failures: u32) -> Harness {
        Harness::with_mode(
            store,
            DispatchMode::live(vendor),
            EngineConfig::default().with_max_send_failures(max_send_failures),
            tempfile::tempdir().unwrap(),
        )
    }

    #[tokio::test]
    async fn transient_failure_is_retried_next_tick() {
        let vendor = FlakyVendor::new(1);
        let h = live(sqlite().await, vendor.clone(), 5);
        h.enroll("6", PHONE).await;

        let report = h.engine.tick().await.unwrap();
        assert_eq!(report.send_failures, 1);
        assert_eq!(h.state("6").await, WorkflowState::New);

        h.engine.tick().await.unwrap();
        assert_eq!(h.state("6").await, WorkflowState::WaitingSizeInfo);
        assert_eq!(
            h.templates("6").await,
            vec![
                ("size_check".to_string(), OutboxStatus::Error),
                ("size_check".to_string(), OutboxStatus::Sent),
            ]
        );
        assert_eq!(vendor.sent.load(Ordering::SeqCst), 1);
    }

    async fn failure_cap_marks_order_failed(store: Arc<dyn Store>) {
        let h = live(store, FlakyVendor::new(u32::MAX), 3);
        h.enroll("7", PHONE).await;

        for attempt in 1..=2u32 {
            let wf = h.store.get_workflow(&order_id("7")).await.unwrap().unwrap();
            let outcome = h.engine.process_order(wf).await.unwrap();
            assert!(matches!(outcome, OrderOutcome::SendFailed { attempts, .. } if attempts == attempt));
        }
        let report = h.engine.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(h.state("7").await, WorkflowState::Failed);

        let rows = h.templates("7").await;
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|(_, s)| *s == OutboxStatus::Error));

        let report = h.engine.tick().await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.states[&WorkflowState::Failed], 1);
    }

    #[tokio::test]
    async fn failure_cap_in_memory() {
        failure_cap_marks_order_failed(memory()).await;
    }

    #[tokio::test]
    async fn failure_cap_sqlite() {
        failure_cap_marks_order_failed(sqlite().await).await;
    }

    async fn permanent_failure_fails_order_at_once(store: Arc<dyn Store>) {
        let vendor = FlakyVendor::failing_with(
            u32::MAX,
            VendorError::Api {
                status: 400,
                message: "recipient phone number not valid".into(),
                code: Some(131026),
                subcode: None,
                title: Some("Message undeliverable".into()),
            },
        );
        let h = live(store, vendor, 5);
        h.enroll("9", PHONE).await;

        let report = h.engine.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.send_failures, 0);
        assert_eq!(h.state("9").await, WorkflowState::Failed);
        assert_eq!(
            h.templates("9").await,
            vec![("size_check".to_string(), OutboxStatus::Error)]
        );

        let outbox = h.store.outbox_for_order(&order_id("9")).await.unwrap();
        assert_eq!(outbox[0].payload["error"]["transient"], false);

        let events = h.store.events_for(&order_id("9")).await.unwrap();
        let failed = events.iter().find(|e| e.kind == "workflow_failed").unwrap();
        assert_eq!(failed.data["reason"], "permanent_error");
        assert_eq!(failed.data["attempts"], 1);
    }

    #[tokio::test]
    async fn permanent_failure_in_memory() {
        permanent_failure_fails_order_at_once(memory()).await;
    }

    #[tokio::test]
    async fn permanent_failure_sqlite() {
        permanent_failure_fails_order_at_once(sqlite().await).await;
    }

    /// Answers text sends from a script (then succeeds); templates succeed.
    #[derive(Default)]
    struct ScriptedVendor {
        texts: Mutex<VecDeque<Result<VendorMessageId, VendorError>>>,
    }

    impl ScriptedVendor {
        fn with(texts: Vec<Result<VendorMessageId, VendorError>>) -> Arc<Self> {
            Arc::new(Self {
                texts: Mutex::new(texts.into()),
            })
        }
    }

    #[async_trait::async_trait]
    impl MessagingVendor for ScriptedVendor {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn send_text(&self, _to: &PhoneNumber, _text: &str) -> Result<VendorMessageId, VendorError> {
            self.texts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Some("wamid.ok".into())))
        }

        async fn send_template(
            &self,
            _to: &PhoneNumber,
            _name: &str,
            _language: &str,
            _components: Option<JsonValue>,
        ) -> Result<VendorMessageId, VendorError> {
            Ok(Some("wamid.reopen".into()))
        }

        async fn send_document(&self, _to: &PhoneNumber, _document: &Document) -> Result<VendorMessageId, VendorError> {
            Ok(None)
        }
    }

    fn window_closed() -> VendorError {
        VendorError::Api {
            status: 400,
            message: "Re-engagement message".into(),
            code: Some(131047),
            subcode: Some(2018065),
            title: None,
        }
    }

    async fn session_window_attempts_are_all_recorded(store: Arc<dyn Store>) {
        let vendor = ScriptedVendor::with(vec![
            // tick 1: closed window, reopen, retry hits a 503
            Err(window_closed()),
            Err(VendorError::Api {
                status: 503,
                message: "service unavailable".into(),
                code: None,
                subcode: None,
                title: None,
            }),
            // tick 2: closed window again, reopen, retry succeeds
            Err(window_closed()),
        ]);
        let h = Harness::with_mode(
            store,
            DispatchMode::live(vendor),
            EngineConfig::default(),
            tempfile::tempdir().unwrap(),
        );
        h.enroll("10", PHONE).await;

        let wf = h.store.get_workflow(&order_id("10")).await.unwrap().unwrap();
        let outcome = h.engine.process_order(wf).await.unwrap();
        assert!(matches!(outcome, OrderOutcome::SendFailed { attempts: 2, .. }));
        assert_eq!(h.state("10").await, WorkflowState::New);
        assert_eq!(
            h.templates("10").await,
            vec![
                ("size_check".to_string(), OutboxStatus::Error),
                ("size_check_reopen".to_string(), OutboxStatus::Sent),
                ("size_check".to_string(), OutboxStatus::Error),
            ]
        );

        h.engine.tick().await.unwrap();
        assert_eq!(h.state("10").await, WorkflowState::WaitingSizeInfo);
        assert_eq!(
            h.templates("10").await,
            vec![
                ("size_check".to_string(), OutboxStatus::Error),
                ("size_check_reopen".to_string(), OutboxStatus::Sent),
                ("size_check".to_string(), OutboxStatus::Error),
                ("size_check".to_string(), OutboxStatus::Error),
                ("size_check_reopen".to_string(), OutboxStatus::Sent),
                ("size_check".to_string(), OutboxStatus::Sent),
            ]
        );

        let reopens = h
            .store
            .events_for(&order_id("10"))
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == "wa_session_reopen")
            .count();
        assert_eq!(reopens, 2);
    }

    #[tokio::test]
    async fn session_window_attempts_in_memory() {
        session_window_attempts_are_all_recorded(memory()).await;
    }

    #[tokio::test]
    async fn session_window_attempts_sqlite() {
        session_window_attempts_are_all_recorded(sqlite().await).await;
    }

    // ---------------------------------------------------------------------
    // Overlapping ticks
    // ---------------------------------------------------------------------

    async fn overlapping_ticks(h: &Harness, ticks: usize) {
        let mut tasks = JoinSet::new();
        for _ in 0..ticks {
            let engine = h.engine.clone();
            tasks.spawn(async move { engine.tick().await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }
    }

    fn customer_phone(i: usize) -> String {
        format!("+7701000{i:04}")
    }

    async fn race_scenario(store: Arc<dyn Store>, orders: usize, ticks: usize, workers: usize, confirm: bool) {
        let artifacts = tempfile::tempdir().unwrap();
        let h = Harness::with_mode(
            store,
            DispatchMode::dry_run(artifacts.path()),
            EngineConfig::default().with_max_concurrent(workers),
            artifacts,
        );
        for i in 0..orders {
            h.enroll(&i.to_string(), &customer_phone(i)).await;
        }

        overlapping_ticks(&h, ticks).await;
        for i in 0..orders {
            h.reply(&customer_phone(i), 1, "170 см 70 кг").await;
        }
        overlapping_ticks(&h, ticks).await;
        for i in 0..orders {
            h.reply(&customer_phone(i), 2, if confirm { "да" } else { "жоқ" }).await;
        }
        overlapping_ticks(&h, ticks).await;

        let expected = if confirm {
            WorkflowState::Confirmed
        } else {
            WorkflowState::WaitingSizeInfo
        };
        for i in 0..orders {
            let order = i.to_string();
            assert_eq!(h.state(&order).await, expected);
            let rows = h.templates(&order).await;
            let delivered = delivered_per_template(&rows);
            assert!(delivered.values().all(|&n| n == 1), "order {order}: {rows:?}");
            assert_eq!(delivered.len(), if confirm { 2 } else { 3 });
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_ticks_send_each_template_once_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        race_scenario(sqlite_file(&dir).await, 6, 4, 3, true).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_refusals_ask_again_once_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        race_scenario(sqlite_file(&dir).await, 4, 5, 4, false).await;
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn overlapping_ticks_never_double_send(
            orders in 1usize..6,
            ticks in 2usize..6,
            workers in 1usize..5,
            confirm in any::<bool>(),
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(race_scenario(memory(), orders, ticks, workers, confirm));
        }
    }
}
