//! Revision reconciliation
//!
//! Keeps every Revision listed in its Plan, the Plan's latest pointer
//! current and `status.inUse` equal to the number of CloudResources built
//! from the Revision.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use terrace_common::crd::{Revision, REVISION_CONDITIONS};
use terrace_common::{Error, Result, FINALIZER};
use terrace_engine::backoff::object_key;
use terrace_engine::conditions::register_defaults;
use terrace_engine::finalizer::{is_deletion_candidate, EnsureFinalizer, EnsureFinalizerRemoved};
use terrace_engine::pipeline::Sinks;
use terrace_engine::{Cycle, Pipeline};
use tracing::{debug, error, instrument};

use crate::context::Context;
use crate::steps::{
    EnsureInUseCount, EnsurePlanMembership, EnsurePlanMembershipRemoved, EnsureReady, Scratch,
};

type RevisionPipeline = Pipeline<Context, Revision, Scratch>;

pub(crate) fn provisioning_pipeline() -> Result<RevisionPipeline> {
    Pipeline::builder("revision")
        .step(EnsureFinalizer::new(FINALIZER))
        .step(EnsurePlanMembership)
        .step(EnsureInUseCount)
        .step(EnsureReady)
        .build()
}

pub(crate) fn deletion_pipeline() -> Result<RevisionPipeline> {
    Pipeline::builder("revision-deletion")
        .step(EnsurePlanMembershipRemoved)
        .step(EnsureFinalizerRemoved::new(FINALIZER))
        .build()
}

/// Reconcile a Revision
#[instrument(
    skip(revision, ctx),
    fields(
        revision = %revision.name_any(),
        plan = %revision.spec.plan.name,
        version = %revision.spec.plan.revision,
    )
)]
pub async fn reconcile(revision: Arc<Revision>, ctx: Arc<Context>) -> Result<Action> {
    let key = object_key(None, &revision.name_any());
    let deleting = revision.metadata.deletion_timestamp.is_some();

    if deleting && !is_deletion_candidate(revision.as_ref(), FINALIZER) {
        ctx.failures.reset(&key);
        return Ok(Action::await_change());
    }

    let mut cycle = Cycle::new(revision.as_ref().clone(), ctx.cancel.child_token());
    let pipeline = if deleting {
        deletion_pipeline()?
    } else {
        register_defaults(&mut cycle.resource, REVISION_CONDITIONS);
        provisioning_pipeline()?
    };
    debug!(steps = ?pipeline.step_names(), deleting, "reconciling revision");

    let sinks = Sinks {
        store: ctx.as_ref(),
        events: ctx.events.as_ref(),
        metrics: ctx.metrics.as_ref(),
    };
    let directive = pipeline.execute(ctx.as_ref(), &mut cycle, &sinks).await?;
    ctx.failures.reset(&key);

    // Consumers come and go without touching the Revision
    let resync = (!deleting).then_some(ctx.settings.resync_interval);
    Ok(directive.into_action(resync))
}

/// Error policy for the Revision controller
pub fn error_policy(revision: Arc<Revision>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = revision.name_any();
    let delay = ctx.failures.record_failure(&object_key(None, &name));

    if matches!(error, Error::Cancelled) {
        debug!(revision = %name, "reconciliation cancelled");
    } else {
        error!(
            ?error,
            revision = %name,
            retry_in_secs = delay.as_secs(),
            "reconciliation failed"
        );
    }
    Action::requeue(delay)
}
