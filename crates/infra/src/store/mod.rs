//! Persistence store.
//!
//! One repository trait per table, plus [`TransitionStore`] for the atomic
//! "advance state + record what was done" unit. The engine and the webhook
//! depend on [`Store`], which every backend implements.

pub mod in_memory;
pub mod migrations;
pub mod sqlite;
pub mod r#trait;

pub use in_memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use r#trait::{
    CommitOutcome, Customer, CustomerRepo, EventLogRepo, EventRecord, InboxRecord, InboxRepo,
    OutboxRecord, OutboxRepo, OutboxStatus, RecommendationRecord, RecommendationRepo, Store,
    StoreError, StoreResult, TransitionCommit, TransitionStore, WorkflowRepo,
};
