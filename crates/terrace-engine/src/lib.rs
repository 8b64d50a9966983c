//! Reconciliation engine shared by Terrace controllers
//!
//! A controller expresses one reconciliation cycle as an ordered list of
//! [`pipeline::Step`]s. The engine runs them against a per-cycle
//! [`pipeline::Cycle`], tracks condition transitions, persists status once at
//! the end and publishes the buffered events.
//!
//! The remaining modules answer questions about execution units (Kubernetes
//! Jobs): which stage and generation a unit belongs to, whether it finished,
//! and which one is the latest for a resource.

#![deny(missing_docs)]

pub mod backoff;
pub mod conditions;
pub mod filter;
pub mod finalizer;
pub mod pipeline;
pub mod unit;

pub use conditions::{ConditionEvent, ConditionTracker};
pub use filter::UnitFilter;
pub use pipeline::{Cycle, Directive, Pipeline, Step, StepOutcome};
pub use unit::{Stage, UnitState};
