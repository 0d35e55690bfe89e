//! Size-confirmation state machine.
//!
//! This crate decides *what* should happen to an order given its current
//! state and what the customer has said since. It performs no IO; the tick in
//! `sizeflow-infra` gathers the facts, carries out the step and commits it.

pub mod state;
pub mod transition;

pub use state::{ParseStateError, Workflow, WorkflowState};
pub use transition::{decide, Facts, StayReason, Step};
