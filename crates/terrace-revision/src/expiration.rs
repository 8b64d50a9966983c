//! Periodic expiry of unused Revisions
//!
//! A Revision is deleted once it is older than the configured threshold,
//! has at least one sibling in its Plan, is not the highest version among
//! them and no CloudResource is built from it. Every check that fails
//! pauses the cycle; the controller looks again after
//! `revision_check_interval`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use terrace_common::crd::Revision;
use terrace_common::events::{actions, reasons};
use terrace_common::Result;
use terrace_engine::pipeline::{Cycle, Pipeline, Step, StepOutcome};
use tracing::{debug, info, instrument};

use crate::context::Context;

/// Values passed between expiration checks
#[derive(Default)]
pub struct ExpiryScratch {
    /// Revisions of the same plan, this one included
    pub siblings: Vec<Revision>,
}

type ExpiryCycle = Cycle<Revision, ExpiryScratch>;

/// Pause unless the Revision is older than `max_age`
pub struct CheckExpiryAge {
    max_age: Duration,
}

#[async_trait]
impl Step<Context, Revision, ExpiryScratch> for CheckExpiryAge {
    fn name(&self) -> &'static str {
        "CheckExpiryAge"
    }

    async fn run(&self, _ctx: &Context, cycle: &mut ExpiryCycle) -> StepOutcome {
        let Some(created) = cycle.resource.creation_timestamp() else {
            return StepOutcome::Pause;
        };
        let age = (Utc::now() - created.0).to_std().unwrap_or_default();
        if age <= self.max_age {
            return StepOutcome::Pause;
        }
        StepOutcome::Continue
    }
}

/// Pause when the Revision is the only one in its Plan
pub struct CheckSiblings;

#[async_trait]
impl Step<Context, Revision, ExpiryScratch> for CheckSiblings {
    fn name(&self) -> &'static str {
        "CheckSiblings"
    }

    async fn run(&self, ctx: &Context, cycle: &mut ExpiryCycle) -> StepOutcome {
        let siblings = match ctx
            .kube
            .list_plan_revisions(&cycle.resource.spec.plan.name)
            .await
        {
            Ok(siblings) => siblings,
            Err(e) => return StepOutcome::Stop(e),
        };
        if siblings.len() < 2 {
            debug!(count = siblings.len(), "too few revisions to expire one");
            return StepOutcome::Pause;
        }
        cycle.scratch.siblings = siblings;
        StepOutcome::Continue
    }
}

/// Pause when the Revision holds the highest version of its Plan
///
/// An equal highest version also counts as latest. A Revision whose own
/// version does not parse is never expired.
pub struct CheckNotLatest;

#[async_trait]
impl Step<Context, Revision, ExpiryScratch> for CheckNotLatest {
    fn name(&self) -> &'static str {
        "CheckNotLatest"
    }

    async fn run(&self, _ctx: &Context, cycle: &mut ExpiryCycle) -> StepOutcome {
        let Some(own) = cycle.resource.version() else {
            return StepOutcome::Pause;
        };
        let highest = cycle
            .scratch
            .siblings
            .iter()
            .filter_map(Revision::version)
            .max();
        match highest {
            Some(highest) if own < highest => StepOutcome::Continue,
            _ => StepOutcome::Pause,
        }
    }
}

/// Pause while any CloudResource is built from the Revision
///
/// Counts consumers afresh rather than trusting `status.inUse`.
pub struct CheckNotInUse;

#[async_trait]
impl Step<Context, Revision, ExpiryScratch> for CheckNotInUse {
    fn name(&self) -> &'static str {
        "CheckNotInUse"
    }

    async fn run(&self, ctx: &Context, cycle: &mut ExpiryCycle) -> StepOutcome {
        let plan = &cycle.resource.spec.plan;
        match ctx.kube.count_consumers(&plan.name, &plan.revision).await {
            Ok(0) => StepOutcome::Continue,
            Ok(count) => {
                debug!(consumers = count, "revision still in use");
                StepOutcome::Pause
            }
            Err(e) => StepOutcome::Stop(e),
        }
    }
}

/// Delete the Revision and record why
pub struct DeleteRevision;

#[async_trait]
impl Step<Context, Revision, ExpiryScratch> for DeleteRevision {
    fn name(&self) -> &'static str {
        "DeleteRevision"
    }

    async fn run(&self, ctx: &Context, cycle: &mut ExpiryCycle) -> StepOutcome {
        let name = cycle.resource.name_any();
        let plan = cycle.resource.spec.plan.name.clone();
        if let Err(e) = ctx.kube.delete_revision(&name).await {
            return StepOutcome::Stop(e);
        }

        info!(revision = %name, %plan, "expired revision deleted");
        ctx.metrics.revision_expired(&plan);
        ctx.events
            .publish(
                &cycle.resource.object_ref(&()),
                EventType::Normal,
                reasons::REVISION_EXPIRED,
                actions::DELETE,
                Some(format!(
                    "revision {} of plan {plan} expired unused",
                    cycle.resource.spec.plan.revision
                )),
            )
            .await;
        StepOutcome::Continue
    }
}

fn expiration_pipeline(max_age: Duration) -> Result<Pipeline<Context, Revision, ExpiryScratch>> {
    Pipeline::builder("revision-expiration")
        .step(CheckExpiryAge { max_age })
        .step(CheckSiblings)
        .step(CheckNotLatest)
        .step(CheckNotInUse)
        .step(DeleteRevision)
        .build()
}

/// Check whether a Revision has expired and delete it if so
///
/// Disabled when no expiration threshold is configured.
#[instrument(skip(revision, ctx), fields(revision = %revision.name_any()))]
pub async fn reconcile_expiration(revision: Arc<Revision>, ctx: Arc<Context>) -> Result<Action> {
    let Some(max_age) = ctx.settings.revision_expiration.filter(|d| !d.is_zero()) else {
        return Ok(Action::await_change());
    };
    if revision.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let mut cycle = Cycle::new(revision.as_ref().clone(), ctx.cancel.child_token());
    expiration_pipeline(max_age)?
        .run(ctx.as_ref(), &mut cycle)
        .await?;
    Ok(Action::requeue(ctx.settings.revision_check_interval))
}
