//! Steps of the Configuration pipelines
//!
//! Provisioning walks plan, policy check and apply in order, each stage
//! backed by one execution unit per generation. Deletion runs destroy and
//! then removes everything generated for the resource.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use terrace_common::crd::{
    Configuration, Policy, Provider, CONDITION_PROVIDER_READY, CONDITION_READY,
    CONDITION_TERRAFORM_APPLY, CONDITION_TERRAFORM_DESTROY, CONDITION_TERRAFORM_PLAN,
    CONDITION_TERRAFORM_POLICY,
};
use terrace_common::events::reasons;
use terrace_common::{
    Error, Result, ANNOTATION_RETRY, LABEL_MANAGED_BY, LABEL_MANAGED_BY_TERRACE, LABEL_OWNER_NAME,
    LABEL_OWNER_UID,
};
use terrace_engine::pipeline::{Cycle, Step, StepOutcome};
use terrace_engine::unit::{self, Stage, UnitState};
use terrace_engine::UnitFilter;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::render::{
    config_secret_name, outputs_secret_name, policy_secret_name, render_job_configuration,
    state_secret_name, UnitRequest, RESOURCE_COUNT_KEY,
};

/// Delay before re-checking a missing or unready dependency
pub const DEPENDENCY_REQUEUE: Duration = Duration::from_secs(30);

/// Delay after creating an execution unit
pub const UNIT_CREATED_REQUEUE: Duration = Duration::from_secs(5);

/// Delay while an execution unit is running
pub const UNIT_ACTIVE_REQUEUE: Duration = Duration::from_secs(10);

/// Delay while waiting for apply outputs
pub const OUTPUTS_REQUEUE: Duration = Duration::from_secs(10);

/// Values passed between the steps of one cycle
#[derive(Default)]
pub struct Scratch {
    /// Provider resolved by [`EnsureProviderReady`]
    pub provider: Option<Provider>,
    /// Policy selected by [`EnsurePolicies`]
    pub policy: Option<Policy>,
    /// Execution units owned by the resource
    pub units: Vec<Job>,
    /// Set once generated artifacts are gone
    pub cleaned_up: bool,
}

/// Cycle type of the Configuration pipelines
pub type ConfigurationCycle = Cycle<Configuration, Scratch>;

fn owner_uid(configuration: &Configuration) -> Result<String> {
    configuration
        .uid()
        .ok_or_else(|| Error::validation_for(configuration.name_any(), "configuration has no uid"))
}

/// Retry marker from the `terrace.dev/retry` annotation
pub fn retry_marker(configuration: &Configuration) -> Option<DateTime<Utc>> {
    configuration
        .annotations()
        .get(ANNOTATION_RETRY)
        .and_then(|v| unit::parse_retry_marker(v))
}

/// Guard against units of an older generation still running
///
/// Currently a no-op: stage lookups are keyed by generation, so units left
/// over from an older generation are ignored rather than waited on.
pub struct EnsureNoPreviousGeneration;

#[async_trait]
impl Step<Context, Configuration, Scratch> for EnsureNoPreviousGeneration {
    fn name(&self) -> &'static str {
        "EnsureNoPreviousGeneration"
    }

    async fn run(&self, _ctx: &Context, _cycle: &mut ConfigurationCycle) -> StepOutcome {
        StepOutcome::Continue
    }
}

/// Resolve the referenced Provider and wait for it to be ready
pub struct EnsureProviderReady;

#[async_trait]
impl Step<Context, Configuration, Scratch> for EnsureProviderReady {
    fn name(&self) -> &'static str {
        "EnsureProviderReady"
    }

    async fn run(&self, ctx: &Context, cycle: &mut ConfigurationCycle) -> StepOutcome {
        let name = cycle.resource.spec.provider_ref.name.clone();
        match ctx.kube.get_provider(&name).await {
            Err(e) => StepOutcome::Stop(e),
            Ok(None) => {
                cycle
                    .condition(CONDITION_PROVIDER_READY)
                    .action_required(format!("provider {name} not found"));
                StepOutcome::Requeue(DEPENDENCY_REQUEUE)
            }
            Ok(Some(provider)) if !provider.is_ready() => {
                cycle
                    .condition(CONDITION_PROVIDER_READY)
                    .warning(format!("provider {name} is not ready"));
                StepOutcome::Requeue(DEPENDENCY_REQUEUE)
            }
            Ok(Some(provider)) => {
                cycle
                    .condition(CONDITION_PROVIDER_READY)
                    .success(format!("provider {name} is ready"));
                cycle.scratch.provider = Some(provider);
                StepOutcome::Continue
            }
        }
    }
}

/// Select the Policy that applies to the resource
///
/// The first policy whose selector matches wins.
pub struct EnsurePolicies;

#[async_trait]
impl Step<Context, Configuration, Scratch> for EnsurePolicies {
    fn name(&self) -> &'static str {
        "EnsurePolicies"
    }

    async fn run(&self, ctx: &Context, cycle: &mut ConfigurationCycle) -> StepOutcome {
        let policies = match ctx.kube.list_policies().await {
            Ok(p) => p,
            Err(e) => return StepOutcome::Stop(e),
        };
        let labels = cycle.resource.metadata.labels.as_ref();
        cycle.scratch.policy = policies.into_iter().find(|p| p.matches(labels));
        if let Some(policy) = &cycle.scratch.policy {
            debug!(policy = %policy.name_any(), "policy applies");
        }
        StepOutcome::Continue
    }
}

/// Load the execution units owned by the resource
pub struct EnsureUnitListing;

#[async_trait]
impl Step<Context, Configuration, Scratch> for EnsureUnitListing {
    fn name(&self) -> &'static str {
        "EnsureUnitListing"
    }

    async fn run(&self, ctx: &Context, cycle: &mut ConfigurationCycle) -> StepOutcome {
        let uid = match owner_uid(&cycle.resource) {
            Ok(uid) => uid,
            Err(e) => return StepOutcome::Stop(e),
        };
        match ctx.kube.list_units(&ctx.settings.namespace, &uid).await {
            Ok(units) => {
                cycle.scratch.units = units;
                StepOutcome::Continue
            }
            Err(e) => StepOutcome::Stop(e),
        }
    }
}

/// Render the configuration Secret units mount; create or update it
pub struct EnsureJobConfiguration;

#[async_trait]
impl Step<Context, Configuration, Scratch> for EnsureJobConfiguration {
    fn name(&self) -> &'static str {
        "EnsureJobConfiguration"
    }

    async fn run(&self, ctx: &Context, cycle: &mut ConfigurationCycle) -> StepOutcome {
        let Some(provider) = cycle.scratch.provider.as_ref() else {
            return StepOutcome::Stop(Error::internal_with_context(
                "EnsureJobConfiguration",
                "provider not resolved",
            ));
        };
        let desired =
            match render_job_configuration(&cycle.resource, provider, &ctx.settings.namespace) {
                Ok(secret) => secret,
                Err(e) => return StepOutcome::Stop(e),
            };
        match ensure_secret(ctx, desired).await {
            Ok(()) => StepOutcome::Continue,
            Err(e) => StepOutcome::Stop(e),
        }
    }
}

/// Create `desired` if absent, patch its data if it differs
async fn ensure_secret(ctx: &Context, desired: Secret) -> Result<()> {
    let name = desired.name_any();
    let namespace = desired
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "secret has no namespace"))?;
    let data = desired.data.clone().unwrap_or_default();

    match ctx.kube.get_secret(&name, &namespace).await? {
        None => {
            debug!(secret = %name, namespace = %namespace, "creating secret");
            ctx.kube.create_secret(&desired).await
        }
        Some(existing) if existing.data.as_ref() != Some(&data) => {
            debug!(secret = %name, namespace = %namespace, "updating secret data");
            ctx.kube.patch_secret_data(&name, &namespace, &data).await
        }
        Some(_) => Ok(()),
    }
}

/// Drive one stage to completion through its execution unit
pub struct RunStage {
    stage: Stage,
    condition: &'static str,
    gated: bool,
}

impl RunStage {
    /// `terraform plan` tracked by `TerraformPlan`
    pub fn plan() -> Self {
        Self {
            stage: Stage::Plan,
            condition: CONDITION_TERRAFORM_PLAN,
            gated: false,
        }
    }

    /// Policy check tracked by `TerraformPolicy`
    pub fn verify() -> Self {
        Self {
            stage: Stage::Verify,
            condition: CONDITION_TERRAFORM_POLICY,
            gated: false,
        }
    }

    /// `terraform apply` tracked by `TerraformApply`, waiting for approval
    pub fn apply() -> Self {
        Self {
            stage: Stage::Apply,
            condition: CONDITION_TERRAFORM_APPLY,
            gated: true,
        }
    }

    /// `terraform destroy` tracked by `TerraformDestroy`
    pub fn destroy() -> Self {
        Self {
            stage: Stage::Destroy,
            condition: CONDITION_TERRAFORM_DESTROY,
            gated: false,
        }
    }

    async fn create_unit(&self, ctx: &Context, cycle: &mut ConfigurationCycle) -> StepOutcome {
        let provider = match cycle.scratch.provider.clone() {
            Some(provider) => provider,
            None => {
                let name = cycle.resource.spec.provider_ref.name.clone();
                match ctx.kube.get_provider(&name).await {
                    Ok(Some(provider)) => provider,
                    Ok(None) => {
                        cycle
                            .condition(self.condition)
                            .action_required(format!("provider {name} not found"));
                        return StepOutcome::Requeue(DEPENDENCY_REQUEUE);
                    }
                    Err(e) => return StepOutcome::Stop(e),
                }
            }
        };

        let rendered = {
            let request = UnitRequest {
                configuration: &cycle.resource,
                provider: &provider,
                policy: cycle.scratch.policy.as_ref(),
                stage: self.stage,
                generation: cycle.generation(),
                retry: retry_marker(&cycle.resource),
                settings: &ctx.settings,
            };
            ctx.renderer.render_unit(&request).map(|unit| {
                let watcher = ctx
                    .settings
                    .enable_watchers
                    .then(|| ctx.renderer.render_watcher(&request, &unit));
                (unit, watcher)
            })
        };
        let (unit, watcher) = match rendered {
            Ok(rendered) => rendered,
            Err(e) => {
                cycle
                    .condition(self.condition)
                    .failed(Some(&e), format!("cannot render {} unit", self.stage));
                return StepOutcome::Pause;
            }
        };

        // Watcher failures are reported but never block the unit
        let watcher_error = match watcher {
            Some(Ok(watcher)) => ctx.kube.create_job(&watcher).await.err(),
            Some(Err(e)) => Some(e),
            None => None,
        };
        if let Some(e) = watcher_error {
            warn!(error = %e, stage = %self.stage, "failed to start log watcher");
            ctx.events
                .publish(
                    &cycle.resource.object_ref(&()),
                    EventType::Warning,
                    reasons::WATCHER_FAILED,
                    self.condition,
                    Some(format!("cannot start log watcher for {} unit: {e}", self.stage)),
                )
                .await;
        }

        if let Err(e) = ctx.kube.create_job(&unit).await {
            return StepOutcome::Stop(e);
        }

        let unit_name = unit.name_any();
        info!(
            configuration = %cycle.resource.name_any(),
            stage = %self.stage,
            unit = %unit_name,
            "created execution unit"
        );
        ctx.metrics
            .unit_created(&Configuration::kind(&()), self.stage.as_str());
        ctx.events
            .publish(
                &cycle.resource.object_ref(&()),
                EventType::Normal,
                reasons::UNIT_CREATED,
                self.condition,
                Some(format!("created {} unit {unit_name}", self.stage)),
            )
            .await;
        cycle
            .condition(self.condition)
            .in_progress(format!("{} unit {unit_name} created", self.stage));
        StepOutcome::Requeue(UNIT_CREATED_REQUEUE)
    }
}

#[async_trait]
impl Step<Context, Configuration, Scratch> for RunStage {
    fn name(&self) -> &'static str {
        match self.stage {
            Stage::Plan => "RunPlan",
            Stage::Verify => "RunPolicyCheck",
            Stage::Apply => "RunApply",
            Stage::Destroy => "RunDestroy",
        }
    }

    async fn run(&self, ctx: &Context, cycle: &mut ConfigurationCycle) -> StepOutcome {
        if cycle.is_complete(self.condition) {
            return StepOutcome::Continue;
        }
        if self.stage == Stage::Verify && cycle.scratch.policy.is_none() {
            cycle.condition(self.condition).disabled("no policy applies");
            return StepOutcome::Continue;
        }

        let uid = match owner_uid(&cycle.resource) {
            Ok(uid) => uid,
            Err(e) => return StepOutcome::Stop(e),
        };
        let latest = UnitFilter::new(&cycle.scratch.units)
            .namespace(&ctx.settings.namespace)
            .stage(self.stage)
            .generation(cycle.generation())
            .owner_uid(&uid)
            .retry(retry_marker(&cycle.resource))
            .latest()
            .cloned();

        let Some(unit) = latest else {
            if self.gated && !cycle.resource.apply_approved() {
                cycle.condition(self.condition).action_required(format!(
                    "waiting for approval: set annotation {}=true",
                    terrace_common::ANNOTATION_APPLY_APPROVAL
                ));
                return StepOutcome::Pause;
            }
            return self.create_unit(ctx, cycle).await;
        };

        let unit_name = unit.name_any();
        match unit::classify(&unit) {
            UnitState::Complete => {
                cycle
                    .condition(self.condition)
                    .success(format!("{} unit {unit_name} succeeded", self.stage));
                StepOutcome::Continue
            }
            UnitState::Failed => {
                let detail = unit::failure_message(&unit);
                cycle.condition(self.condition).failed(
                    detail.as_ref().map(|d| d as &dyn Display),
                    format!("{} unit {unit_name} failed", self.stage),
                );
                StepOutcome::Pause
            }
            UnitState::Active => {
                cycle
                    .condition(self.condition)
                    .in_progress(format!("{} unit {unit_name} is running", self.stage));
                StepOutcome::Requeue(UNIT_ACTIVE_REQUEUE)
            }
        }
    }
}

/// Resource count the apply unit left in its outputs, if readable
fn resource_count(outputs: &Secret) -> Option<u32> {
    let raw = outputs.data.as_ref()?.get(RESOURCE_COUNT_KEY)?;
    std::str::from_utf8(&raw.0).ok()?.trim().parse().ok()
}

/// Record the number of managed resources reported by the last apply
///
/// Outputs that are missing or carry no count leave the status untouched.
pub struct EnsureResourceCount;

#[async_trait]
impl Step<Context, Configuration, Scratch> for EnsureResourceCount {
    fn name(&self) -> &'static str {
        "EnsureResourceCount"
    }

    async fn run(&self, ctx: &Context, cycle: &mut ConfigurationCycle) -> StepOutcome {
        let uid = match owner_uid(&cycle.resource) {
            Ok(uid) => uid,
            Err(e) => return StepOutcome::Stop(e),
        };
        let outputs = match ctx
            .kube
            .get_secret(&outputs_secret_name(&uid), &ctx.settings.namespace)
            .await
        {
            Ok(outputs) => outputs,
            Err(e) => return StepOutcome::Stop(e),
        };
        let Some(count) = outputs.as_ref().and_then(resource_count) else {
            return StepOutcome::Continue;
        };

        let status = cycle.resource.status.get_or_insert_with(Default::default);
        if status.resources != Some(count) {
            debug!(resources = count, "managed resource count changed");
            status.resources = Some(count);
            cycle.mark_status_dirty();
        }
        StepOutcome::Continue
    }
}

/// Copy apply outputs into the Secret named by `writeConnectionSecretToRef`
pub struct EnsureConnectionSecret;

#[async_trait]
impl Step<Context, Configuration, Scratch> for EnsureConnectionSecret {
    fn name(&self) -> &'static str {
        "EnsureConnectionSecret"
    }

    async fn run(&self, ctx: &Context, cycle: &mut ConfigurationCycle) -> StepOutcome {
        let Some(target) = cycle.resource.spec.write_connection_secret_to_ref.clone() else {
            return StepOutcome::Continue;
        };
        let uid = match owner_uid(&cycle.resource) {
            Ok(uid) => uid,
            Err(e) => return StepOutcome::Stop(e),
        };

        let outputs_name = outputs_secret_name(&uid);
        let outputs = match ctx.kube.get_secret(&outputs_name, &ctx.settings.namespace).await {
            Ok(Some(secret)) => secret,
            Ok(None) => {
                cycle
                    .condition(CONDITION_READY)
                    .warning(format!("waiting for outputs secret {outputs_name}"));
                return StepOutcome::Requeue(OUTPUTS_REQUEUE);
            }
            Err(e) => return StepOutcome::Stop(e),
        };

        let namespace = target
            .namespace
            .clone()
            .or_else(|| cycle.resource.namespace())
            .unwrap_or_default();
        let mut data = outputs.data.unwrap_or_default();
        data.remove(RESOURCE_COUNT_KEY);
        let desired = connection_secret(&cycle.resource, &target.name, &namespace, data);
        match ensure_secret(ctx, desired).await {
            Ok(()) => StepOutcome::Continue,
            Err(e) => StepOutcome::Stop(e),
        }
    }
}

fn connection_secret(
    configuration: &Configuration,
    name: &str,
    namespace: &str,
    data: BTreeMap<String, ByteString>,
) -> Secret {
    let mut labels = BTreeMap::new();
    labels.insert(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_TERRACE.to_string(),
    );
    labels.insert(LABEL_OWNER_NAME.to_string(), configuration.name_any());
    if let Some(uid) = configuration.uid() {
        labels.insert(LABEL_OWNER_UID.to_string(), uid);
    }

    // Owner references cannot cross namespaces
    let owner_references = (configuration.namespace().as_deref() == Some(namespace))
        .then(|| configuration.controller_owner_ref(&()))
        .flatten()
        .map(|owner| vec![owner]);

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references,
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Mark the resource Ready once every stage has completed
pub struct EnsureReady;

#[async_trait]
impl Step<Context, Configuration, Scratch> for EnsureReady {
    fn name(&self) -> &'static str {
        "EnsureReady"
    }

    async fn run(&self, _ctx: &Context, cycle: &mut ConfigurationCycle) -> StepOutcome {
        cycle
            .condition(CONDITION_READY)
            .success("configuration is up to date");
        StepOutcome::Continue
    }
}

/// Run `terraform destroy` unless the resource is orphaned or has no state
pub struct EnsureDestroy;

#[async_trait]
impl Step<Context, Configuration, Scratch> for EnsureDestroy {
    fn name(&self) -> &'static str {
        "EnsureDestroy"
    }

    async fn run(&self, ctx: &Context, cycle: &mut ConfigurationCycle) -> StepOutcome {
        if cycle.resource.is_orphaned() {
            info!(configuration = %cycle.resource.name_any(), "orphaned, skipping destroy");
            return StepOutcome::Continue;
        }
        let uid = match owner_uid(&cycle.resource) {
            Ok(uid) => uid,
            Err(e) => return StepOutcome::Stop(e),
        };
        match ctx
            .kube
            .get_secret(&state_secret_name(&uid), &ctx.settings.namespace)
            .await
        {
            Ok(Some(_)) => RunStage::destroy().run(ctx, cycle).await,
            Ok(None) => {
                debug!("no terraform state, nothing to destroy");
                StepOutcome::Continue
            }
            Err(e) => StepOutcome::Stop(e),
        }
    }
}

/// Delete generated Secrets and execution units
pub struct EnsureConfigurationRemoved;

#[async_trait]
impl Step<Context, Configuration, Scratch> for EnsureConfigurationRemoved {
    fn name(&self) -> &'static str {
        "EnsureConfigurationRemoved"
    }

    async fn run(&self, ctx: &Context, cycle: &mut ConfigurationCycle) -> StepOutcome {
        let uid = match owner_uid(&cycle.resource) {
            Ok(uid) => uid,
            Err(e) => return StepOutcome::Stop(e),
        };
        let namespace = &ctx.settings.namespace;
        for name in [
            config_secret_name(&uid),
            policy_secret_name(&uid),
            outputs_secret_name(&uid),
        ] {
            match ctx.kube.delete_secret(&name, namespace).await {
                Ok(true) => debug!(secret = %name, "deleted secret"),
                Ok(false) => {}
                Err(e) => return StepOutcome::Stop(e),
            }
        }
        if let Err(e) = ctx.kube.delete_units(namespace, &uid).await {
            return StepOutcome::Stop(e);
        }
        cycle.scratch.cleaned_up = true;
        StepOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockConfigurationClient;
    use std::sync::{Arc, Mutex};
    use terrace_common::crd::{
        CheckConstraint, ConditionReason, ConditionStatus, ConfigurationSpec, HasConditions,
        PolicySpec, ProviderRef, SecretRef,
    };
    use tokio_util::sync::CancellationToken;

    fn configuration() -> Configuration {
        let mut cfg = Configuration::new(
            "bucket",
            ConfigurationSpec {
                module: "git::https://github.com/acme/terraform-aws-bucket".to_string(),
                provider_ref: ProviderRef {
                    name: "aws".to_string(),
                },
                variables: None,
                write_connection_secret_to_ref: None,
                enable_auto_approval: true,
                enable_drift_detection: false,
                terraform_version: None,
            },
        );
        cfg.metadata.namespace = Some("apps".to_string());
        cfg.metadata.uid = Some("uid-1".to_string());
        cfg.metadata.generation = Some(1);
        cfg
    }

    fn cycle(cfg: Configuration) -> ConfigurationCycle {
        Cycle::new(cfg, CancellationToken::new())
    }

    fn policy(name: &str, selector: &[(&str, &str)]) -> Policy {
        Policy::new(
            name,
            PolicySpec {
                constraint: CheckConstraint {
                    selector: selector
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    ..Default::default()
                },
            },
        )
    }

    #[tokio::test]
    async fn missing_provider_requires_action() {
        let mut mock = MockConfigurationClient::new();
        mock.expect_get_provider().returning(|_| Ok(None));
        let ctx = Context::for_testing(Arc::new(mock));
        let mut cycle = cycle(configuration());

        let outcome = EnsureProviderReady.run(&ctx, &mut cycle).await;

        assert!(matches!(outcome, StepOutcome::Requeue(d) if d == DEPENDENCY_REQUEUE));
        let condition = cycle.resource.condition(CONDITION_PROVIDER_READY).unwrap();
        assert_eq!(condition.reason, ConditionReason::ActionRequired);
        assert_eq!(condition.status, ConditionStatus::False);
        assert!(cycle.scratch.provider.is_none());
    }

    #[tokio::test]
    async fn first_matching_policy_is_selected() {
        let mut mock = MockConfigurationClient::new();
        mock.expect_list_policies().returning(|| {
            Ok(vec![
                policy("payments-only", &[("team", "payments")]),
                policy("storage", &[("tier", "storage")]),
                policy("baseline", &[]),
            ])
        });
        let ctx = Context::for_testing(Arc::new(mock));
        let mut cfg = configuration();
        cfg.metadata.labels = Some(BTreeMap::from([(
            "tier".to_string(),
            "storage".to_string(),
        )]));
        let mut cycle = cycle(cfg);

        EnsurePolicies.run(&ctx, &mut cycle).await;

        assert_eq!(
            cycle.scratch.policy.as_ref().map(|p| p.name_any()).as_deref(),
            Some("storage")
        );
    }

    #[tokio::test]
    async fn unchanged_job_configuration_is_left_alone() {
        let provider = Provider::new(
            "aws",
            terrace_common::crd::ProviderSpec {
                provider: terrace_common::crd::ProviderType::Aws,
                source: Default::default(),
                secret_ref: None,
                service_account: None,
            },
        );
        let existing = render_job_configuration(&configuration(), &provider, "terrace-system")
            .unwrap();

        let mut mock = MockConfigurationClient::new();
        mock.expect_get_secret()
            .returning(move |_, _| Ok(Some(existing.clone())));
        mock.expect_create_secret().never();
        mock.expect_patch_secret_data().never();
        let ctx = Context::for_testing(Arc::new(mock));
        let mut cycle = cycle(configuration());
        cycle.scratch.provider = Some(provider);

        let outcome = EnsureJobConfiguration.run(&ctx, &mut cycle).await;
        assert!(matches!(outcome, StepOutcome::Continue));
    }

    #[tokio::test]
    async fn changed_job_configuration_is_patched() {
        let provider = Provider::new(
            "aws",
            terrace_common::crd::ProviderSpec {
                provider: terrace_common::crd::ProviderType::Aws,
                source: Default::default(),
                secret_ref: None,
                service_account: None,
            },
        );
        let mut stale = render_job_configuration(&configuration(), &provider, "terrace-system")
            .unwrap();
        stale.data = Some(BTreeMap::new());

        let patched = Arc::new(Mutex::new(Vec::new()));
        let patched_clone = patched.clone();
        let mut mock = MockConfigurationClient::new();
        mock.expect_get_secret()
            .returning(move |_, _| Ok(Some(stale.clone())));
        mock.expect_patch_secret_data()
            .returning(move |name, _, data| {
                patched_clone
                    .lock()
                    .unwrap()
                    .push((name.to_string(), data.len()));
                Ok(())
            });
        let ctx = Context::for_testing(Arc::new(mock));
        let mut cycle = cycle(configuration());
        cycle.scratch.provider = Some(provider);

        EnsureJobConfiguration.run(&ctx, &mut cycle).await;

        assert_eq!(
            *patched.lock().unwrap(),
            vec![(config_secret_name("uid-1"), 3)]
        );
    }

    #[tokio::test]
    async fn missing_outputs_hold_readiness() {
        let mut mock = MockConfigurationClient::new();
        mock.expect_get_secret().returning(|_, _| Ok(None));
        let ctx = Context::for_testing(Arc::new(mock));
        let mut cfg = configuration();
        cfg.spec.write_connection_secret_to_ref = Some(SecretRef {
            name: "bucket-conn".to_string(),
            namespace: None,
        });
        let mut cycle = cycle(cfg);

        let outcome = EnsureConnectionSecret.run(&ctx, &mut cycle).await;

        assert!(matches!(outcome, StepOutcome::Requeue(d) if d == OUTPUTS_REQUEUE));
        assert_eq!(
            cycle.resource.condition(CONDITION_READY).unwrap().reason,
            ConditionReason::Warning
        );
    }

    #[tokio::test]
    async fn outputs_are_copied_next_to_the_resource() {
        let created = Arc::new(Mutex::new(Vec::<Secret>::new()));
        let created_clone = created.clone();
        let mut mock = MockConfigurationClient::new();
        mock.expect_get_secret().returning(|name, _| {
            if name == outputs_secret_name("uid-1") {
                let mut data = BTreeMap::new();
                data.insert("bucket_arn".to_string(), ByteString(b"arn:aws:s3:::logs".to_vec()));
                data.insert(RESOURCE_COUNT_KEY.to_string(), ByteString(b"4".to_vec()));
                Ok(Some(Secret {
                    data: Some(data),
                    ..Default::default()
                }))
            } else {
                Ok(None)
            }
        });
        mock.expect_create_secret().returning(move |secret| {
            created_clone.lock().unwrap().push(secret.clone());
            Ok(())
        });
        let ctx = Context::for_testing(Arc::new(mock));
        let mut cfg = configuration();
        cfg.spec.write_connection_secret_to_ref = Some(SecretRef {
            name: "bucket-conn".to_string(),
            namespace: None,
        });
        let mut cycle = cycle(cfg);

        let outcome = EnsureConnectionSecret.run(&ctx, &mut cycle).await;

        assert!(matches!(outcome, StepOutcome::Continue));
        let created = created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].metadata.namespace.as_deref(), Some("apps"));
        let data = created[0].data.as_ref().unwrap();
        assert!(data.contains_key("bucket_arn"));
        assert!(!data.contains_key(RESOURCE_COUNT_KEY));
        assert_eq!(
            created[0].metadata.owner_references.as_ref().unwrap()[0].kind,
            "Configuration"
        );
    }

    fn outputs_with(entries: &[(&str, &str)]) -> Secret {
        Secret {
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resource_count_from_apply_outputs_is_recorded() {
        let mut mock = MockConfigurationClient::new();
        mock.expect_get_secret().returning(|name, ns| {
            assert_eq!((name, ns), (outputs_secret_name("uid-1").as_str(), "terrace-system"));
            Ok(Some(outputs_with(&[(RESOURCE_COUNT_KEY, "7\n")])))
        });
        let ctx = Context::for_testing(Arc::new(mock));
        let mut cycle = cycle(configuration());

        let outcome = EnsureResourceCount.run(&ctx, &mut cycle).await;

        assert!(matches!(outcome, StepOutcome::Continue));
        assert_eq!(cycle.resource.status.as_ref().unwrap().resources, Some(7));
        assert!(cycle.status_changed());
    }

    #[tokio::test]
    async fn unchanged_resource_count_is_not_a_status_change() {
        let mut mock = MockConfigurationClient::new();
        mock.expect_get_secret()
            .returning(|_, _| Ok(Some(outputs_with(&[(RESOURCE_COUNT_KEY, "7")]))));
        let ctx = Context::for_testing(Arc::new(mock));
        let mut cfg = configuration();
        cfg.status = Some(terrace_common::crd::ConfigurationStatus {
            resources: Some(7),
            ..Default::default()
        });
        let mut cycle = cycle(cfg);

        EnsureResourceCount.run(&ctx, &mut cycle).await;

        assert!(!cycle.status_changed());
    }

    #[tokio::test]
    async fn outputs_without_a_count_leave_status_alone() {
        let mut mock = MockConfigurationClient::new();
        mock.expect_get_secret()
            .returning(|_, _| Ok(Some(outputs_with(&[("bucket_arn", "arn")]))));
        let ctx = Context::for_testing(Arc::new(mock));
        let mut cycle = cycle(configuration());

        let outcome = EnsureResourceCount.run(&ctx, &mut cycle).await;

        assert!(matches!(outcome, StepOutcome::Continue));
        assert_eq!(cycle.resource.status.as_ref().and_then(|s| s.resources), None);
    }

    #[tokio::test]
    async fn cleanup_tolerates_missing_secrets() {
        let mut mock = MockConfigurationClient::new();
        mock.expect_delete_secret()
            .times(3)
            .returning(|name, _| Ok(name.starts_with("config-")));
        mock.expect_delete_units().times(1).returning(|ns, uid| {
            assert_eq!((ns, uid), ("terrace-system", "uid-1"));
            Ok(())
        });
        let ctx = Context::for_testing(Arc::new(mock));
        let mut cycle = cycle(configuration());

        let outcome = EnsureConfigurationRemoved.run(&ctx, &mut cycle).await;

        assert!(matches!(outcome, StepOutcome::Continue));
        assert!(cycle.scratch.cleaned_up);
    }

    #[test]
    fn retry_marker_reads_the_annotation() {
        let mut cfg = configuration();
        assert!(retry_marker(&cfg).is_none());

        cfg.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_RETRY.to_string(),
            "2024-05-01T10:00:00Z".to_string(),
        )]));
        assert_eq!(retry_marker(&cfg).unwrap().timestamp(), 1_714_557_600);
    }
}
