//! Revision controller
//!
//! Keeps every `Revision` listed in its `Plan`, counts the `CloudResource`s
//! built from it and, when expiration is enabled, deletes old revisions
//! nobody uses that are not their plan's latest.

#![deny(missing_docs)]

mod client;
mod context;
mod controller;
mod expiration;
mod steps;

pub use client::{KubeRevisionClient, RevisionClient};
pub use context::{Context, ContextBuilder, CONTROLLER_NAME};
pub use controller::{error_policy, reconcile};
pub use expiration::reconcile_expiration;
