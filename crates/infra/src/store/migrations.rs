//! Idempotent schema setup for the SQLite store.

use sqlx::SqlitePool;
use tracing::{info, instrument};

use super::StoreError;

/// Applied in order; every statement is safe to re-run.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "customers",
        r#"
        CREATE TABLE IF NOT EXISTS customers (
            id          TEXT PRIMARY KEY,
            phone       TEXT NOT NULL,
            name        TEXT NULL,
            created_at  TEXT NOT NULL
        )
        "#,
    ),
    (
        "workflows",
        r#"
        CREATE TABLE IF NOT EXISTS workflows (
            order_id    TEXT PRIMARY KEY,
            state       TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            store_name  TEXT NULL
        )
        "#,
    ),
    (
        "wa_inbox",
        r#"
        CREATE TABLE IF NOT EXISTS wa_inbox (
            id           TEXT PRIMARY KEY,
            order_id     TEXT NULL,
            from_phone   TEXT NOT NULL,
            text         TEXT NOT NULL,
            parsed_json  TEXT NOT NULL,
            sent_at      TEXT NOT NULL,
            created_at   TEXT NOT NULL
        )
        "#,
    ),
    (
        "wa_outbox",
        r#"
        CREATE TABLE IF NOT EXISTS wa_outbox (
            id            TEXT PRIMARY KEY,
            order_id      TEXT NOT NULL,
            to_phone      TEXT NOT NULL,
            template      TEXT NOT NULL,
            payload_json  TEXT NOT NULL,
            status        TEXT NOT NULL CHECK (status IN ('DRY_RUN', 'SENT', 'ERROR')),
            created_at    TEXT NOT NULL
        )
        "#,
    ),
    (
        "size_recommendations",
        r#"
        CREATE TABLE IF NOT EXISTS size_recommendations (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id          TEXT NOT NULL,
            recommended_size  TEXT NOT NULL,
            confidence        REAL NOT NULL,
            height            INTEGER NOT NULL,
            weight            INTEGER NOT NULL,
            final_size        TEXT NULL,
            created_at        TEXT NOT NULL
        )
        "#,
    ),
    (
        "events_log",
        r#"
        CREATE TABLE IF NOT EXISTS events_log (
            id          TEXT PRIMARY KEY,
            order_id    TEXT NULL,
            kind        TEXT NOT NULL,
            data_json   TEXT NOT NULL,
            created_at  TEXT NOT NULL
        )
        "#,
    ),
    (
        "idx_customers_phone",
        "CREATE INDEX IF NOT EXISTS idx_customers_phone ON customers(phone)",
    ),
    (
        "idx_workflows_state",
        "CREATE INDEX IF NOT EXISTS idx_workflows_state ON workflows(state)",
    ),
    (
        "idx_wa_inbox_from_phone",
        "CREATE INDEX IF NOT EXISTS idx_wa_inbox_from_phone ON wa_inbox(from_phone, created_at)",
    ),
    (
        "idx_wa_outbox_to_phone",
        "CREATE INDEX IF NOT EXISTS idx_wa_outbox_to_phone ON wa_outbox(to_phone)",
    ),
    (
        "idx_wa_outbox_order_template",
        "CREATE INDEX IF NOT EXISTS idx_wa_outbox_order_template ON wa_outbox(order_id, template, status)",
    ),
    // At most one delivered workflow template per order; a racing second
    // commit fails here and rolls back. Session-reopen rows repeat freely.
    (
        "ux_wa_outbox_delivered",
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS ux_wa_outbox_delivered
            ON wa_outbox(order_id, template)
            WHERE status IN ('SENT', 'DRY_RUN')
              AND template IN ('size_check', 'size_confirm', 'size_check_again')
        "#,
    ),
    (
        "idx_size_recommendations_order",
        "CREATE INDEX IF NOT EXISTS idx_size_recommendations_order ON size_recommendations(order_id, created_at)",
    ),
    (
        "idx_events_log_order",
        "CREATE INDEX IF NOT EXISTS idx_events_log_order ON events_log(order_id)",
    ),
];

/// Create all tables and indexes.
#[instrument(skip(pool), err)]
pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| StoreError::Migration(format!("begin: {e}")))?;

    for (name, sql) in MIGRATIONS {
        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
    }

    tx.commit()
        .await
        .map_err(|e| StoreError::Migration(format!("commit: {e}")))?;

    info!(steps = MIGRATIONS.len(), "schema up to date");
    Ok(())
}

/// Names of the migration steps, in order.
pub fn steps() -> impl Iterator<Item = &'static str> {
    MIGRATIONS.iter().map(|(name, _)| *name)
}
