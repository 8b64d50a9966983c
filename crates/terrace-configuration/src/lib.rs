//! Configuration controller
//!
//! Drives a `Configuration` through plan, policy check and apply by creating
//! execution units (Jobs) in the controller namespace and watching them to
//! completion. On deletion it runs a destroy unit unless the resource is
//! orphaned or never produced state, removes the generated artifacts and
//! releases the finalizer.

#![deny(missing_docs)]

mod client;
mod context;
mod controller;
mod render;
mod steps;

pub use client::{ConfigurationClient, KubeConfigurationClient};
pub use context::{Context, ContextBuilder, CONTROLLER_NAME};
pub use controller::{configuration_for_unit, error_policy, reconcile};
pub use render::{DefaultJobRenderer, JobRenderer, UnitRequest};
