//! Finalizer steps
//!
//! The finalizer keeps the object around until the deletion pipeline has
//! destroyed what it manages. Releasing it lets the API server remove the
//! object immediately, so [`EnsureFinalizerRemoved`] reports
//! `releases_finalizer()` and the pipeline builder only accepts it last.

use async_trait::async_trait;
use kube::Resource;
use terrace_common::crd::HasConditions;
use terrace_common::Result;
use tracing::{debug, info};

use crate::pipeline::{Cycle, Step, StepOutcome};

/// Adds and removes finalizers on a resource kind
#[async_trait]
pub trait FinalizerStore<R>: Send + Sync {
    /// Add `finalizer` to the object if absent
    async fn add_finalizer(&self, resource: &R, finalizer: &str) -> Result<()>;

    /// Remove `finalizer` from the object if present
    async fn remove_finalizer(&self, resource: &R, finalizer: &str) -> Result<()>;
}

/// Check if the object carries `finalizer`
pub fn has_finalizer<R: Resource>(resource: &R, finalizer: &str) -> bool {
    resource
        .meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// True when the object is being deleted and still holds `finalizer`
pub fn is_deletion_candidate<R: Resource>(resource: &R, finalizer: &str) -> bool {
    resource.meta().deletion_timestamp.is_some() && has_finalizer(resource, finalizer)
}

/// Adds the finalizer, then requeues so the next cycle sees the updated object
pub struct EnsureFinalizer {
    finalizer: &'static str,
}

impl EnsureFinalizer {
    /// Step ensuring `finalizer` is present
    pub fn new(finalizer: &'static str) -> Self {
        Self { finalizer }
    }
}

#[async_trait]
impl<C, R, S> Step<C, R, S> for EnsureFinalizer
where
    C: FinalizerStore<R> + Sync,
    R: Resource + HasConditions + Send + Sync,
    S: Send,
{
    fn name(&self) -> &'static str {
        "EnsureFinalizer"
    }

    async fn run(&self, ctx: &C, cycle: &mut Cycle<R, S>) -> StepOutcome {
        if has_finalizer(&cycle.resource, self.finalizer) {
            return StepOutcome::Continue;
        }
        match ctx.add_finalizer(&cycle.resource, self.finalizer).await {
            Ok(()) => {
                debug!(finalizer = self.finalizer, "added finalizer");
                StepOutcome::RequeueNow
            }
            Err(e) => StepOutcome::Stop(e),
        }
    }
}

/// Removes the finalizer; must be the last step of a deletion pipeline
pub struct EnsureFinalizerRemoved {
    finalizer: &'static str,
}

impl EnsureFinalizerRemoved {
    /// Step releasing `finalizer`
    pub fn new(finalizer: &'static str) -> Self {
        Self { finalizer }
    }
}

#[async_trait]
impl<C, R, S> Step<C, R, S> for EnsureFinalizerRemoved
where
    C: FinalizerStore<R> + Sync,
    R: Resource + HasConditions + Send + Sync,
    S: Send,
{
    fn name(&self) -> &'static str {
        "EnsureFinalizerRemoved"
    }

    fn releases_finalizer(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &C, cycle: &mut Cycle<R, S>) -> StepOutcome {
        if !has_finalizer(&cycle.resource, self.finalizer) {
            return StepOutcome::Continue;
        }
        match ctx.remove_finalizer(&cycle.resource, self.finalizer).await {
            Ok(()) => {
                info!(finalizer = self.finalizer, "released finalizer");
                StepOutcome::Continue
            }
            Err(e) if e.is_not_found() => StepOutcome::Continue,
            Err(e) => StepOutcome::Stop(e),
        }
    }
}
