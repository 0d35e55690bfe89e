//! `sizeflow-core`: shared building blocks for the size-confirmation workflow.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod phone;

pub use error::{DomainError, DomainResult};
pub use id::{MessageId, OrderId};
pub use phone::PhoneNumber;
