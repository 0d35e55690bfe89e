//! Infrastructure layer: persistence, vendor client, dispatcher, workflow
//! engine and configuration.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod inbox;
pub mod store;
pub mod vendor;

pub use config::{Config, ConfigError, SizingDefaults};
pub use dispatcher::{Dispatch, DispatchMode, Dispatcher, DispatcherConfig, OutboundRequest};
pub use engine::{EngineConfig, EngineError, OrderOutcome, TickReport, WorkflowEngine};
pub use inbox::{ingest, Ingested};
pub use store::{InMemoryStore, SqliteStore, Store, StoreError};

#[cfg(test)]
mod integration_tests;
