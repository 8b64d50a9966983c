//! Steps keeping a Revision listed in its Plan and counting its consumers

use async_trait::async_trait;
use kube::ResourceExt;
use terrace_common::crd::{
    Plan, PlanRevision, PlanSpec, PlanStatus, Revision, CONDITION_READY, CONDITION_REVISION_PLAN,
};
use terrace_common::Result;
use terrace_engine::pipeline::{Cycle, Step, StepOutcome};
use tracing::{debug, info};

use crate::context::Context;

/// Values passed between the steps of one cycle
#[derive(Default)]
pub struct Scratch {
    /// Consumers counted by [`EnsureInUseCount`]
    pub in_use: Option<u32>,
}

/// Cycle type of the Revision pipelines
pub type RevisionCycle = Cycle<Revision, Scratch>;

/// Write the plan's latest revision when it changed
async fn sync_latest(ctx: &Context, plan: &Plan) -> Result<()> {
    let latest = plan.spec.latest().cloned();
    let current = plan.status.as_ref().and_then(|s| s.latest.clone());
    if latest == current {
        return Ok(());
    }
    debug!(plan = %plan.name_any(), latest = ?latest.as_ref().map(|r| &r.revision), "updating latest revision");
    ctx.kube
        .patch_plan_status(&plan.name_any(), &PlanStatus { latest })
        .await
}

/// Make sure the owning Plan lists this Revision
///
/// Creates the Plan when missing. An entry with the same name but another
/// version is replaced.
pub struct EnsurePlanMembership;

#[async_trait]
impl Step<Context, Revision, Scratch> for EnsurePlanMembership {
    fn name(&self) -> &'static str {
        "EnsurePlanMembership"
    }

    async fn run(&self, ctx: &Context, cycle: &mut RevisionCycle) -> StepOutcome {
        let name = cycle.resource.name_any();
        let plan_name = cycle.resource.spec.plan.name.clone();
        let version = cycle.resource.spec.plan.revision.clone();

        if cycle.resource.version().is_none() {
            cycle
                .condition(CONDITION_REVISION_PLAN)
                .failed(None, format!("{version} is not a semantic version"));
            return StepOutcome::Pause;
        }

        let entry = PlanRevision {
            name: name.clone(),
            revision: version.clone(),
        };
        let result = match ctx.kube.get_plan(&plan_name).await {
            Err(e) => Err(e),
            Ok(None) => {
                let plan = Plan::new(
                    &plan_name,
                    PlanSpec {
                        revisions: vec![entry],
                    },
                );
                info!(plan = %plan_name, revision = %version, "creating plan");
                match ctx.kube.create_plan(&plan).await {
                    Ok(()) => sync_latest(ctx, &plan).await,
                    Err(e) => Err(e),
                }
            }
            Ok(Some(plan)) if plan.spec.contains(&name, &version) => sync_latest(ctx, &plan).await,
            Ok(Some(mut plan)) => {
                plan.spec.revisions.retain(|r| r.name != name);
                plan.spec.revisions.push(entry);
                info!(plan = %plan_name, revision = %version, "adding revision to plan");
                match ctx.kube.patch_plan_revisions(&plan).await {
                    Ok(()) => sync_latest(ctx, &plan).await,
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Ok(()) => {
                cycle
                    .condition(CONDITION_REVISION_PLAN)
                    .success(format!("listed in plan {plan_name}"));
                StepOutcome::Continue
            }
            Err(e) => StepOutcome::Stop(e),
        }
    }
}

/// Count CloudResources built from this Revision into `status.inUse`
pub struct EnsureInUseCount;

#[async_trait]
impl Step<Context, Revision, Scratch> for EnsureInUseCount {
    fn name(&self) -> &'static str {
        "EnsureInUseCount"
    }

    async fn run(&self, ctx: &Context, cycle: &mut RevisionCycle) -> StepOutcome {
        let plan = &cycle.resource.spec.plan;
        let count = match ctx.kube.count_consumers(&plan.name, &plan.revision).await {
            Ok(count) => count,
            Err(e) => return StepOutcome::Stop(e),
        };

        let changed = {
            let status = cycle.resource.status.get_or_insert_with(Default::default);
            let changed = status.in_use != count;
            status.in_use = count;
            changed
        };
        if changed {
            cycle.mark_status_dirty();
        }
        cycle.scratch.in_use = Some(count);
        StepOutcome::Continue
    }
}

/// Mark the Revision Ready
pub struct EnsureReady;

#[async_trait]
impl Step<Context, Revision, Scratch> for EnsureReady {
    fn name(&self) -> &'static str {
        "EnsureReady"
    }

    async fn run(&self, _ctx: &Context, cycle: &mut RevisionCycle) -> StepOutcome {
        let message = match cycle.scratch.in_use {
            Some(n) if n > 0 => format!("in use by {n} resources"),
            _ => "not in use".to_string(),
        };
        cycle.condition(CONDITION_READY).success(message);
        StepOutcome::Continue
    }
}

/// Remove this Revision from its Plan; a missing Plan is fine
pub struct EnsurePlanMembershipRemoved;

#[async_trait]
impl Step<Context, Revision, Scratch> for EnsurePlanMembershipRemoved {
    fn name(&self) -> &'static str {
        "EnsurePlanMembershipRemoved"
    }

    async fn run(&self, ctx: &Context, cycle: &mut RevisionCycle) -> StepOutcome {
        let name = cycle.resource.name_any();
        let plan_name = &cycle.resource.spec.plan.name;

        let mut plan = match ctx.kube.get_plan(plan_name).await {
            Ok(Some(plan)) => plan,
            Ok(None) => return StepOutcome::Continue,
            Err(e) => return StepOutcome::Stop(e),
        };
        if !plan.spec.revisions.iter().any(|r| r.name == name) {
            return StepOutcome::Continue;
        }

        plan.spec.revisions.retain(|r| r.name != name);
        info!(plan = %plan_name, revision = %name, "removing revision from plan");
        let result = match ctx.kube.patch_plan_revisions(&plan).await {
            Ok(()) => sync_latest(ctx, &plan).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => StepOutcome::Continue,
            Err(e) if e.is_not_found() => StepOutcome::Continue,
            Err(e) => StepOutcome::Stop(e),
        }
    }
}
