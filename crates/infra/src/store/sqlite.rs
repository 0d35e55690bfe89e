//! SQLite-backed store.
//!
//! ## Timestamps
//!
//! Stored as RFC 3339 text with microsecond precision and a `Z` suffix, so
//! lexical order in SQL equals chronological order.
//!
//! ## Error mapping
//!
//! | sqlx error | StoreError |
//! |---|---|
//! | unique violation inside `commit_transition` | none: rolled back, reported as `CommitOutcome::LostRace` |
//! | any other `Database` error | `Database` |
//! | `PoolClosed`, IO, TLS, ... | `Database` |
//! | undecodable column | `Corrupt` |

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument, warn};

use sizeflow_core::{MessageId, OrderId, PhoneNumber};
use sizeflow_messaging::ParsedReply;
use sizeflow_workflow::{Workflow, WorkflowState};

use super::migrations;
use super::r#trait::{
    empty_counts, CommitOutcome, Customer, CustomerRepo, EventLogRepo, EventRecord, InboxRecord,
    InboxRepo, OutboxRecord, OutboxRepo, OutboxStatus, RecommendationRecord, RecommendationRepo,
    StoreError, StoreResult, TransitionCommit, TransitionStore, WorkflowRepo,
};

/// SQLite store. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("parse_url", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::database("create_dir", e.to_string()))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// A private in-memory database, already migrated.
    ///
    /// Limited to one connection: every connection to `:memory:` is a
    /// separate database.
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        migrations::migrate(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(table: &'static str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(table, format!("bad timestamp {raw:?}: {e}")))
}

fn col<T>(row: &SqliteRow, table: &'static str, name: &str) -> StoreResult<T>
where
    T: for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::corrupt(table, format!("column {name}: {e}")))
}

fn order_id(table: &'static str, raw: String) -> StoreResult<OrderId> {
    OrderId::new(&raw).map_err(|e| StoreError::corrupt(table, e.to_string()))
}

fn phone(table: &'static str, raw: &str) -> StoreResult<PhoneNumber> {
    PhoneNumber::parse(raw).map_err(|e| StoreError::corrupt(table, e.to_string()))
}

fn json(table: &'static str, raw: &str) -> StoreResult<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| StoreError::corrupt(table, format!("bad json: {e}")))
}

fn workflow_from_row(row: &SqliteRow) -> StoreResult<Workflow> {
    const T: &str = "workflows";
    let state: String = col(row, T, "state")?;
    let updated_at: String = col(row, T, "updated_at")?;
    Ok(Workflow {
        order_id: order_id(T, col(row, T, "order_id")?)?,
        state: state
            .parse::<WorkflowState>()
            .map_err(|e| StoreError::corrupt(T, e.to_string()))?,
        updated_at: parse_ts(T, &updated_at)?,
        store_name: col(row, T, "store_name")?,
    })
}

fn inbox_from_row(row: &SqliteRow) -> StoreResult<InboxRecord> {
    const T: &str = "wa_inbox";
    let from_phone: String = col(row, T, "from_phone")?;
    let parsed_json: String = col(row, T, "parsed_json")?;
    let sent_at: String = col(row, T, "sent_at")?;
    let created_at: String = col(row, T, "created_at")?;
    let order: Option<String> = col(row, T, "order_id")?;
    Ok(InboxRecord {
        id: col(row, T, "id")?,
        order_id: order.map(|o| order_id(T, o)).transpose()?,
        from_phone: phone(T, &from_phone)?,
        text: col(row, T, "text")?,
        parsed: serde_json::from_str::<ParsedReply>(&parsed_json)
            .map_err(|e| StoreError::corrupt(T, format!("bad parsed_json: {e}")))?,
        sent_at: parse_ts(T, &sent_at)?,
        created_at: parse_ts(T, &created_at)?,
    })
}

fn outbox_from_row(row: &SqliteRow) -> StoreResult<OutboxRecord> {
    const T: &str = "wa_outbox";
    let id: String = col(row, T, "id")?;
    let to_phone: String = col(row, T, "to_phone")?;
    let payload: String = col(row, T, "payload_json")?;
    let status: String = col(row, T, "status")?;
    let created_at: String = col(row, T, "created_at")?;
    Ok(OutboxRecord {
        id: id
            .parse::<MessageId>()
            .map_err(|e| StoreError::corrupt(T, e.to_string()))?,
        order_id: order_id(T, col(row, T, "order_id")?)?,
        to_phone: phone(T, &to_phone)?,
        template: col(row, T, "template")?,
        payload: json(T, &payload)?,
        status: OutboxStatus::parse(&status)
            .ok_or_else(|| StoreError::corrupt(T, format!("unknown status {status:?}")))?,
        created_at: parse_ts(T, &created_at)?,
    })
}

fn recommendation_from_row(row: &SqliteRow) -> StoreResult<RecommendationRecord> {
    const T: &str = "size_recommendations";
    let height: i64 = col(row, T, "height")?;
    let weight: i64 = col(row, T, "weight")?;
    let created_at: String = col(row, T, "created_at")?;
    Ok(RecommendationRecord {
        order_id: order_id(T, col(row, T, "order_id")?)?,
        recommended_size: col(row, T, "recommended_size")?,
        confidence: col(row, T, "confidence")?,
        height: u32::try_from(height).map_err(|e| StoreError::corrupt(T, e.to_string()))?,
        weight: u32::try_from(weight).map_err(|e| StoreError::corrupt(T, e.to_string()))?,
        final_size: col(row, T, "final_size")?,
        created_at: parse_ts(T, &created_at)?,
    })
}

fn event_from_row(row: &SqliteRow) -> StoreResult<EventRecord> {
    const T: &str = "events_log";
    let order: Option<String> = col(row, T, "order_id")?;
    let data: String = col(row, T, "data_json")?;
    let created_at: String = col(row, T, "created_at")?;
    Ok(EventRecord {
        id: col(row, T, "id")?,
        order_id: order.map(|o| order_id(T, o)).transpose()?,
        kind: col(row, T, "kind")?,
        data: json(T, &data)?,
        created_at: parse_ts(T, &created_at)?,
    })
}

async fn insert_outbox<'e, E>(executor: E, record: &OutboxRecord) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO wa_outbox (id, order_id, to_phone, template, payload_json, status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(record.id.to_string())
    .bind(record.order_id.as_str())
    .bind(record.to_phone.as_str())
    .bind(&record.template)
    .bind(record.payload.to_string())
    .bind(record.status.as_str())
    .bind(ts(record.created_at))
    .execute(executor)
    .await
    .map(|_| ())
}

async fn insert_event<'e, E>(executor: E, event: &EventRecord) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO events_log (id, order_id, kind, data_json, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&event.id)
    .bind(event.order_id.as_ref().map(OrderId::as_str))
    .bind(&event.kind)
    .bind(event.data.to_string())
    .bind(ts(event.created_at))
    .execute(executor)
    .await
    .map(|_| ())
}

#[async_trait::async_trait]
impl WorkflowRepo for SqliteStore {
    #[instrument(skip(self, workflow), fields(order_id = %workflow.order_id), err)]
    async fn create_workflow(&self, workflow: &Workflow) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO workflows (order_id, state, updated_at, store_name)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(workflow.order_id.as_str())
        .bind(workflow.state.as_str())
        .bind(ts(workflow.updated_at))
        .bind(workflow.store_name.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_workflow", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_workflow(&self, order_id: &OrderId) -> StoreResult<Option<Workflow>> {
        let row = sqlx::query(
            "SELECT order_id, state, updated_at, store_name FROM workflows WHERE order_id = ?1",
        )
        .bind(order_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_workflow", e))?;
        row.as_ref().map(workflow_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_workflows(&self, states: &[WorkflowState]) -> StoreResult<Vec<Workflow>> {
        let mut result = Vec::new();
        for state in states {
            let rows = sqlx::query(
                r#"
                SELECT order_id, state, updated_at, store_name
                FROM workflows
                WHERE state = ?1
                "#,
            )
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_workflows", e))?;
            for row in &rows {
                result.push(workflow_from_row(row)?);
            }
        }
        result.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.order_id.cmp(&b.order_id))
        });
        Ok(result)
    }

    async fn count_by_state(&self) -> StoreResult<BTreeMap<WorkflowState, u64>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM workflows GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_by_state", e))?;

        let mut counts = empty_counts();
        for row in &rows {
            let state: String = col(row, "workflows", "state")?;
            let n: i64 = col(row, "workflows", "n")?;
            match state.parse::<WorkflowState>() {
                Ok(state) => {
                    counts.insert(state, n.max(0) as u64);
                }
                Err(_) => warn!(state = %state, rows = n, "ignoring unknown workflow state"),
            }
        }
        Ok(counts)
    }
}

#[async_trait::async_trait]
impl CustomerRepo for SqliteStore {
    #[instrument(skip(self, customer), fields(customer_id = %customer.id), err)]
    async fn upsert_customer(&self, customer: &Customer) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO customers (id, phone, name, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (id) DO UPDATE SET
                phone = excluded.phone,
                name = COALESCE(excluded.name, customers.name)
            "#,
        )
        .bind(customer.id.as_str())
        .bind(customer.phone.as_str())
        .bind(customer.name.as_deref())
        .bind(ts(customer.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_customer", e))?;
        Ok(())
    }

    async fn phone_for_order(&self, order_id: &OrderId) -> StoreResult<Option<PhoneNumber>> {
        let row = sqlx::query("SELECT phone FROM customers WHERE id = ?1")
            .bind(order_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("phone_for_order", e))?;
        match row {
            None => Ok(None),
            Some(row) => {
                let raw: String = col(&row, "customers", "phone")?;
                if raw.trim().is_empty() {
                    return Ok(None);
                }
                phone("customers", &raw).map(Some)
            }
        }
    }
}

#[async_trait::async_trait]
impl InboxRepo for SqliteStore {
    #[instrument(skip(self, message, event), fields(inbox_id = %message.id), err)]
    async fn record_inbound(&self, message: &InboxRecord, event: &EventRecord) -> StoreResult<bool> {
        let parsed = serde_json::to_string(&message.parsed)
            .map_err(|e| StoreError::database("record_inbound", e.to_string()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO wa_inbox (id, order_id, from_phone, text, parsed_json, sent_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&message.id)
        .bind(message.order_id.as_ref().map(OrderId::as_str))
        .bind(message.from_phone.as_str())
        .bind(&message.text)
        .bind(parsed)
        .bind(ts(message.sent_at))
        .bind(ts(message.created_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_inbox", e))?
        .rows_affected()
            == 1;

        if !inserted {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            debug!("duplicate inbound message ignored");
            return Ok(false);
        }

        insert_event(&mut *tx, event)
            .await
            .map_err(|e| map_sqlx_error("insert_event", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(true)
    }

    async fn inbound_since(
        &self,
        phone_number: &PhoneNumber,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<InboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, from_phone, text, parsed_json, sent_at, created_at
            FROM wa_inbox
            WHERE from_phone = ?1 AND created_at >= ?2
            ORDER BY created_at DESC, rowid DESC
            "#,
        )
        .bind(phone_number.as_str())
        .bind(ts(since))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("inbound_since", e))?;
        rows.iter().map(inbox_from_row).collect()
    }
}

#[async_trait::async_trait]
impl OutboxRepo for SqliteStore {
    async fn delivered(&self, order_id: &OrderId, template: &str) -> StoreResult<Option<OutboxRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, order_id, to_phone, template, payload_json, status, created_at
            FROM wa_outbox
            WHERE order_id = ?1 AND template = ?2 AND status IN ('SENT', 'DRY_RUN')
            LIMIT 1
            "#,
        )
        .bind(order_id.as_str())
        .bind(template)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("delivered", e))?;
        row.as_ref().map(outbox_from_row).transpose()
    }

    #[instrument(
        skip(self, record),
        fields(order_id = %record.order_id, template = %record.template, status = record.status.as_str()),
        err
    )]
    async fn record_attempt(&self, record: &OutboxRecord) -> StoreResult<()> {
        insert_outbox(&self.pool, record)
            .await
            .map_err(|e| map_sqlx_error("record_attempt", e))
    }

    async fn failed_attempts(&self, order_id: &OrderId, template: &str) -> StoreResult<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM wa_outbox WHERE order_id = ?1 AND template = ?2 AND status = 'ERROR'",
        )
        .bind(order_id.as_str())
        .bind(template)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("failed_attempts", e))?;
        let n: i64 = col(&row, "wa_outbox", "n")?;
        Ok(n.max(0) as u32)
    }

    async fn outbox_for_order(&self, order_id: &OrderId) -> StoreResult<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, to_phone, template, payload_json, status, created_at
            FROM wa_outbox
            WHERE order_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(order_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox_for_order", e))?;
        rows.iter().map(outbox_from_row).collect()
    }
}

#[async_trait::async_trait]
impl RecommendationRepo for SqliteStore {
    async fn latest_recommendation(&self, order_id: &OrderId) -> StoreResult<Option<RecommendationRecord>> {
        let row = sqlx::query(
            r#"
            SELECT order_id, recommended_size, confidence, height, weight, final_size, created_at
            FROM size_recommendations
            WHERE order_id = ?1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(order_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_recommendation", e))?;
        row.as_ref().map(recommendation_from_row).transpose()
    }

    async fn recommendations_for(&self, order_id: &OrderId) -> StoreResult<Vec<RecommendationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, recommended_size, confidence, height, weight, final_size, created_at
            FROM size_recommendations
            WHERE order_id = ?1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(order_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("recommendations_for", e))?;
        rows.iter().map(recommendation_from_row).collect()
    }
}

#[async_trait::async_trait]
impl EventLogRepo for SqliteStore {
    async fn append_event(&self, event: &EventRecord) -> StoreResult<()> {
        insert_event(&self.pool, event)
            .await
            .map_err(|e| map_sqlx_error("append_event", e))
    }

    async fn events_for(&self, order_id: &OrderId) -> StoreResult<Vec<EventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, kind, data_json, created_at
            FROM events_log
            WHERE order_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(order_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("events_for", e))?;
        rows.iter().map(event_from_row).collect()
    }
}

#[async_trait::async_trait]
impl TransitionStore for SqliteStore {
    #[instrument(
        skip(self, commit),
        fields(
            order_id = %commit.order_id,
            from = %commit.from,
            to = %commit.to,
        ),
        err
    )]
    async fn commit_transition(&self, commit: &TransitionCommit) -> StoreResult<CommitOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Compare-and-set; also takes the write lock for the rest of the unit.
        let updated = sqlx::query(
            "UPDATE workflows SET state = ?1, updated_at = ?2 WHERE order_id = ?3 AND state = ?4",
        )
        .bind(commit.to.as_str())
        .bind(ts(commit.at))
        .bind(commit.order_id.as_str())
        .bind(commit.from.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_workflow", e))?
        .rows_affected();

        if updated == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(CommitOutcome::LostRace);
        }

        for record in commit.attempts.iter().chain(commit.outbox.as_ref()) {
            if let Err(e) = insert_outbox(&mut *tx, record).await {
                if is_unique_violation(&e) {
                    tx.rollback()
                        .await
                        .map_err(|e| map_sqlx_error("rollback", e))?;
                    return Ok(CommitOutcome::LostRace);
                }
                return Err(map_sqlx_error("insert_outbox", e));
            }
        }

        if let Some(rec) = &commit.recommendation {
            sqlx::query(
                r#"
                INSERT INTO size_recommendations
                    (order_id, recommended_size, confidence, height, weight, final_size, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(rec.order_id.as_str())
            .bind(&rec.recommended_size)
            .bind(rec.confidence)
            .bind(i64::from(rec.height))
            .bind(i64::from(rec.weight))
            .bind(rec.final_size.as_deref())
            .bind(ts(rec.created_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_recommendation", e))?;
        }

        for event in &commit.events {
            insert_event(&mut *tx, event)
                .await
                .map_err(|e| map_sqlx_error("insert_event", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(CommitOutcome::Committed)
    }
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::database(
            operation,
            match db_err.code() {
                Some(code) => format!("{} (code {code})", db_err.message()),
                None => db_err.message().to_string(),
            },
        ),
        sqlx::Error::PoolClosed => StoreError::database(operation, "connection pool closed"),
        sqlx::Error::ColumnDecode { index, source } => {
            StoreError::corrupt("unknown", format!("column {index}: {source}"))
        }
        other => StoreError::database(operation, other.to_string()),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
