//! Configuration reconciliation
//!
//! Each cycle picks the provisioning or the deletion pipeline, runs it on a
//! private copy of the object and lets the engine persist status once.

use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use terrace_common::crd::{Configuration, CONDITION_TERRAFORM_DESTROY, CONFIGURATION_CONDITIONS};
use terrace_common::events::{actions, reasons};
use terrace_common::{
    Error, Result, COMPONENT_EXECUTOR, FINALIZER, LABEL_COMPONENT, LABEL_OWNER_NAME,
    LABEL_OWNER_NAMESPACE,
};
use terrace_engine::backoff::object_key;
use terrace_engine::conditions::register_defaults;
use terrace_engine::finalizer::{is_deletion_candidate, EnsureFinalizer, EnsureFinalizerRemoved};
use terrace_engine::pipeline::Sinks;
use terrace_engine::{Cycle, Directive, Pipeline};
use tracing::{debug, error, info, instrument};

use crate::context::Context;
use crate::steps::{
    EnsureConfigurationRemoved, EnsureConnectionSecret, EnsureDestroy, EnsureJobConfiguration,
    EnsureNoPreviousGeneration, EnsurePolicies, EnsureProviderReady, EnsureReady,
    EnsureResourceCount, EnsureUnitListing, RunStage, Scratch,
};

type ConfigurationPipeline = Pipeline<Context, Configuration, Scratch>;

/// Steps run while the resource exists
pub(crate) fn provisioning_pipeline() -> Result<ConfigurationPipeline> {
    Pipeline::builder("configuration")
        .step(EnsureFinalizer::new(FINALIZER))
        .step(EnsureNoPreviousGeneration)
        .step(EnsureProviderReady)
        .step(EnsurePolicies)
        .step(EnsureUnitListing)
        .step(EnsureJobConfiguration)
        .step(RunStage::plan())
        .step(RunStage::verify())
        .step(RunStage::apply())
        .step(EnsureResourceCount)
        .step(EnsureConnectionSecret)
        .step(EnsureReady)
        .build()
}

/// Steps run once the resource is marked for deletion
pub(crate) fn deletion_pipeline() -> Result<ConfigurationPipeline> {
    Pipeline::builder("configuration-deletion")
        .step(EnsureUnitListing)
        .step(EnsureDestroy)
        .step(EnsureConfigurationRemoved)
        .step(EnsureFinalizerRemoved::new(FINALIZER))
        .build()
}

/// Reconcile a Configuration
#[instrument(
    skip(configuration, ctx),
    fields(
        configuration = %configuration.name_any(),
        namespace = ?configuration.namespace(),
        generation = configuration.metadata.generation.unwrap_or_default(),
    )
)]
pub async fn reconcile(configuration: Arc<Configuration>, ctx: Arc<Context>) -> Result<Action> {
    let name = configuration.name_any();
    let key = object_key(configuration.namespace().as_deref(), &name);
    let deleting = configuration.metadata.deletion_timestamp.is_some();

    if deleting && !is_deletion_candidate(configuration.as_ref(), FINALIZER) {
        debug!("deleted without finalizer, nothing to clean up");
        ctx.failures.reset(&key);
        return Ok(Action::await_change());
    }

    let mut cycle = Cycle::new(configuration.as_ref().clone(), ctx.cancel.child_token());
    let pipeline = if deleting {
        register_defaults(&mut cycle.resource, &[CONDITION_TERRAFORM_DESTROY]);
        deletion_pipeline()?
    } else {
        register_defaults(&mut cycle.resource, CONFIGURATION_CONDITIONS);
        provisioning_pipeline()?
    };
    debug!(steps = ?pipeline.step_names(), deleting, "reconciling configuration");

    let sinks = Sinks {
        store: ctx.as_ref(),
        events: ctx.events.as_ref(),
        metrics: ctx.metrics.as_ref(),
    };
    let directive = pipeline.execute(ctx.as_ref(), &mut cycle, &sinks).await?;
    ctx.failures.reset(&key);

    if deleting {
        if directive == Directive::Done && cycle.scratch.cleaned_up {
            info!("cleanup complete, finalizer released");
            ctx.events
                .publish(
                    &configuration.object_ref(&()),
                    EventType::Normal,
                    reasons::CLEANUP_COMPLETE,
                    actions::DELETE,
                    Some(format!("removed everything generated for {name}")),
                )
                .await;
        }
        return Ok(directive.into_action(None));
    }

    let resync = configuration
        .spec
        .enable_drift_detection
        .then_some(ctx.settings.resync_interval);
    Ok(directive.into_action(resync))
}

/// Error policy for the Configuration controller
///
/// Requeues with a delay that doubles per consecutive failure of the same
/// object, from 5 seconds up to 5 minutes.
pub fn error_policy(configuration: Arc<Configuration>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = configuration.name_any();
    let key = object_key(configuration.namespace().as_deref(), &name);
    let delay = ctx.failures.record_failure(&key);

    if matches!(error, Error::Cancelled) {
        debug!(configuration = %name, "reconciliation cancelled");
    } else {
        error!(
            ?error,
            configuration = %name,
            retry_in_secs = delay.as_secs(),
            "reconciliation failed"
        );
    }
    Action::requeue(delay)
}

/// Map an execution unit to the Configuration it works for
///
/// Units live in the controller namespace without owner references; the
/// owner is recovered from its labels. Watchers and foreign Jobs map to
/// nothing.
pub fn configuration_for_unit(job: Job) -> Option<ObjectRef<Configuration>> {
    let labels = job.metadata.labels.as_ref()?;
    if labels.get(LABEL_COMPONENT).map(String::as_str) != Some(COMPONENT_EXECUTOR) {
        return None;
    }
    let name = labels.get(LABEL_OWNER_NAME)?;
    let namespace = labels.get(LABEL_OWNER_NAMESPACE)?;
    Some(ObjectRef::new(name).within(namespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockConfigurationClient;
    use crate::render::{state_secret_name, unit_name};
    use chrono::{DateTime, TimeZone, Utc};
    use k8s_openapi::api::batch::v1::JobStatus;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use rstest::rstest;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use terrace_common::crd::{
        Condition, ConditionReason, ConditionStatus, ConfigurationSpec, ConfigurationStatus,
        CredentialSource, HasConditions, Provider, ProviderRef, ProviderSpec, ProviderStatus,
        ProviderType, CONDITION_PROVIDER_READY, CONDITION_TERRAFORM_APPLY,
        CONDITION_READY, CONDITION_TERRAFORM_PLAN, CONDITION_TERRAFORM_POLICY,
    };
    use terrace_common::error::api_error;
    use terrace_common::events::RecordingEventPublisher;
    use terrace_common::{
        ANNOTATION_ORPHAN, ANNOTATION_RETRY, LABEL_GENERATION, LABEL_RETRY, LABEL_STAGE,
    };
    use terrace_engine::pipeline::{Step, StepOutcome};
    use terrace_engine::unit::{unit_labels, Stage};

    const UID: &str = "0b6f7c1e-5d1a-4c52-9a43-3f0e1d2c4b5a";

    // ===== Fixtures =====

    fn configuration() -> Configuration {
        let mut cfg = Configuration::new(
            "bucket",
            ConfigurationSpec {
                module: "git::https://github.com/acme/terraform-aws-bucket".to_string(),
                provider_ref: ProviderRef {
                    name: "aws".to_string(),
                },
                variables: Some(serde_json::json!({"bucket": "acme-logs"})),
                write_connection_secret_to_ref: None,
                enable_auto_approval: true,
                enable_drift_detection: false,
                terraform_version: None,
            },
        );
        cfg.metadata.namespace = Some("apps".to_string());
        cfg.metadata.uid = Some(UID.to_string());
        cfg.metadata.generation = Some(1);
        cfg.metadata.resource_version = Some("100".to_string());
        cfg.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        cfg
    }

    fn deleting(mut cfg: Configuration) -> Configuration {
        cfg.metadata.deletion_timestamp = Some(Time(Utc::now()));
        cfg
    }

    fn ready_provider() -> Provider {
        let mut provider = Provider::new(
            "aws",
            ProviderSpec {
                provider: ProviderType::Aws,
                source: CredentialSource::Secret,
                secret_ref: None,
                service_account: None,
            },
        );
        provider.status = Some(ProviderStatus {
            conditions: vec![Condition::new(
                "Ready",
                ConditionStatus::True,
                ConditionReason::Ready,
                "",
                1,
            )],
        });
        provider
    }

    /// Unit for `stage` created five minutes ago
    fn unit(stage: Stage, generation: i64, succeeded: i32, failed: i32) -> Job {
        let owner = configuration().metadata;
        Job {
            metadata: ObjectMeta {
                name: Some(format!("{stage}-{generation}")),
                namespace: Some("terrace-system".to_string()),
                labels: Some(unit_labels(stage, generation, None, &owner)),
                creation_timestamp: Some(Time(Utc::now() - chrono::Duration::minutes(5))),
                ..Default::default()
            },
            status: Some(JobStatus {
                succeeded: Some(succeeded),
                failed: Some(failed),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Unit created in answer to `marker`, within the marker's own second
    fn retry_unit(stage: Stage, marker: DateTime<Utc>, succeeded: i32) -> Job {
        let owner = configuration().metadata;
        let created = Utc.timestamp_opt(marker.timestamp(), 0).unwrap();
        Job {
            metadata: ObjectMeta {
                name: Some(unit_name(stage, UID, 1, Some(marker))),
                namespace: Some("terrace-system".to_string()),
                labels: Some(unit_labels(stage, 1, Some(marker), &owner)),
                creation_timestamp: Some(Time(created)),
                ..Default::default()
            },
            status: Some(JobStatus {
                succeeded: Some(succeeded),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Configuration whose plan already succeeded at generation 1
    fn planned() -> Configuration {
        let mut cfg = configuration();
        cfg.status = Some(ConfigurationStatus {
            conditions: vec![Condition::new(
                CONDITION_TERRAFORM_PLAN,
                ConditionStatus::True,
                ConditionReason::Ready,
                "plan unit plan-1 succeeded",
                1,
            )],
            ..Default::default()
        });
        cfg
    }

    fn with_retry(mut cfg: Configuration, marker: &str) -> Configuration {
        cfg.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_RETRY.to_string(), marker.to_string());
        cfg
    }

    /// State of the cluster as the mock client sees it
    #[derive(Clone)]
    struct World {
        units: Vec<Job>,
        provider: Option<Provider>,
        state_exists: bool,
        watchers: bool,
        watcher_rejected: bool,
    }

    impl Default for World {
        fn default() -> Self {
            Self {
                units: Vec::new(),
                provider: Some(ready_provider()),
                state_exists: false,
                watchers: false,
                watcher_rejected: false,
            }
        }
    }

    /// Observable outcomes of a reconcile
    #[derive(Clone, Default)]
    struct Capture {
        statuses: Arc<Mutex<Vec<ConfigurationStatus>>>,
        jobs: Arc<Mutex<Vec<Job>>>,
        deleted_secrets: Arc<Mutex<Vec<String>>>,
        finalizer_removed: Arc<AtomicBool>,
    }

    impl Capture {
        fn last_condition(&self, type_: &str) -> Option<Condition> {
            self.statuses
                .lock()
                .unwrap()
                .last()
                .and_then(|s| s.conditions.iter().find(|c| c.type_ == type_).cloned())
        }

        fn created(&self) -> Vec<Job> {
            self.jobs.lock().unwrap().clone()
        }

        fn created_stages(&self) -> Vec<String> {
            self.created()
                .iter()
                .filter_map(|j| j.metadata.labels.as_ref()?.get(LABEL_STAGE).cloned())
                .collect()
        }
    }

    fn mock_client(world: World, capture: &Capture) -> MockConfigurationClient {
        let mut mock = MockConfigurationClient::new();

        let statuses = capture.statuses.clone();
        mock.expect_patch_configuration_status()
            .returning(move |cfg| {
                statuses
                    .lock()
                    .unwrap()
                    .push(cfg.status.clone().unwrap_or_default());
                Ok(())
            });
        mock.expect_get_configuration()
            .returning(|_, _| Ok(Some(configuration())));
        mock.expect_add_finalizer().returning(|_, _, _| Ok(()));
        let removed = capture.finalizer_removed.clone();
        mock.expect_remove_finalizer().returning(move |_, _, _| {
            removed.store(true, Ordering::SeqCst);
            Ok(())
        });

        let provider = world.provider.clone();
        mock.expect_get_provider()
            .returning(move |_| Ok(provider.clone()));
        mock.expect_list_policies().returning(|| Ok(Vec::new()));
        let units = world.units.clone();
        mock.expect_list_units()
            .returning(move |_, _| Ok(units.clone()));

        let jobs = capture.jobs.clone();
        let watcher_rejected = world.watcher_rejected;
        mock.expect_create_job().returning(move |job| {
            let is_watcher = job.name_any().starts_with("watch-");
            if watcher_rejected && is_watcher {
                return Err(api_error(403));
            }
            jobs.lock().unwrap().push(job.clone());
            Ok(())
        });
        mock.expect_delete_units().returning(|_, _| Ok(()));

        let state_exists = world.state_exists;
        mock.expect_get_secret().returning(move |name, _| {
            if state_exists && name == state_secret_name(UID) {
                Ok(Some(Secret::default()))
            } else {
                Ok(None)
            }
        });
        mock.expect_create_secret().returning(|_| Ok(()));
        mock.expect_patch_secret_data().returning(|_, _, _| Ok(()));
        let deleted = capture.deleted_secrets.clone();
        mock.expect_delete_secret().returning(move |name, _| {
            deleted.lock().unwrap().push(name.to_string());
            Ok(true)
        });

        mock
    }

    fn context(world: World) -> (Arc<Context>, Capture, Arc<RecordingEventPublisher>) {
        let capture = Capture::default();
        let events = Arc::new(RecordingEventPublisher::new());
        let mut ctx = Context::for_testing(Arc::new(mock_client(world.clone(), &capture)));
        ctx.events = events.clone();
        ctx.settings.enable_watchers = world.watchers;
        (Arc::new(ctx), capture, events)
    }

    // ===== Provisioning =====

    /// Story: a new resource gets a plan unit and is checked again shortly
    #[tokio::test]
    async fn story_new_resource_starts_planning() {
        let (ctx, capture, _) = context(World::default());

        let action = reconcile(Arc::new(configuration()), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        let jobs = capture.created();
        assert_eq!(jobs.len(), 1);
        let labels = jobs[0].metadata.labels.as_ref().unwrap();
        assert_eq!(labels[LABEL_STAGE], "plan");
        assert_eq!(labels[LABEL_GENERATION], "1");

        let plan = capture.last_condition(CONDITION_TERRAFORM_PLAN).unwrap();
        assert_eq!(plan.status, ConditionStatus::False);
        assert_eq!(plan.reason, ConditionReason::InProgress);
        assert_eq!(
            capture
                .last_condition(CONDITION_PROVIDER_READY)
                .unwrap()
                .status,
            ConditionStatus::True
        );
    }

    /// Story: a finished plan leads straight to apply in the same cycle
    #[tokio::test]
    async fn story_successful_plan_moves_on_to_apply() {
        let (ctx, capture, _) = context(World {
            units: vec![unit(Stage::Plan, 1, 1, 0)],
            ..Default::default()
        });

        let action = reconcile(Arc::new(configuration()), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        assert_eq!(capture.created_stages(), vec!["apply".to_string()]);
        let plan = capture.last_condition(CONDITION_TERRAFORM_PLAN).unwrap();
        assert_eq!(plan.status, ConditionStatus::True);
        assert_eq!(plan.reason, ConditionReason::Ready);
        assert_eq!(
            capture
                .last_condition(CONDITION_TERRAFORM_POLICY)
                .unwrap()
                .reason,
            ConditionReason::Disabled
        );
        assert_eq!(
            capture
                .last_condition(CONDITION_TERRAFORM_APPLY)
                .unwrap()
                .reason,
            ConditionReason::InProgress
        );
    }

    /// Story: a failed apply is recorded and nothing is retried at this generation
    #[tokio::test]
    async fn story_failed_apply_pauses_without_error() {
        let (ctx, capture, events) = context(World {
            units: vec![unit(Stage::Plan, 1, 1, 0), unit(Stage::Apply, 1, 0, 1)],
            ..Default::default()
        });

        let action = reconcile(Arc::new(configuration()), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(capture.created().is_empty());
        let apply = capture.last_condition(CONDITION_TERRAFORM_APPLY).unwrap();
        assert_eq!(apply.status, ConditionStatus::False);
        assert_eq!(apply.reason, ConditionReason::Error);
        assert!(events
            .events()
            .iter()
            .any(|e| e.action == CONDITION_TERRAFORM_APPLY && e.warning));
    }

    /// Story: a retry marker newer than the failed unit starts a fresh one
    #[tokio::test]
    async fn story_retry_marker_reruns_failed_stage() {
        let (ctx, capture, _) = context(World {
            units: vec![unit(Stage::Plan, 1, 1, 0), unit(Stage::Apply, 1, 0, 1)],
            ..Default::default()
        });
        let mut cfg = configuration();
        cfg.status = Some(ConfigurationStatus {
            conditions: vec![Condition::new(
                CONDITION_TERRAFORM_PLAN,
                ConditionStatus::True,
                ConditionReason::Ready,
                "plan unit plan-1 succeeded",
                1,
            )],
            ..Default::default()
        });
        let marker = Utc::now().timestamp().to_string();
        let cfg = with_retry(cfg, &marker);

        reconcile(Arc::new(cfg), ctx).await.unwrap();

        let jobs = capture.created();
        assert_eq!(capture.created_stages(), vec!["apply".to_string()]);
        let name = jobs[0].metadata.name.clone().unwrap();
        assert!(name.starts_with("apply-0b6f7c1e5d1a4c529a433f0e1d2c4b5a-1-"));
        assert_eq!(jobs[0].metadata.labels.as_ref().unwrap()[LABEL_RETRY], marker);
    }

    /// Story: the retry unit is created in the same second the marker was set
    /// and is followed to completion instead of being created again
    #[rstest]
    #[case::unix_seconds(Utc.timestamp_opt(1_714_557_600, 0).unwrap(), "1714557600")]
    #[case::fractional_rfc3339(
        Utc.timestamp_opt(1_714_557_600, 750_000_000).unwrap(),
        "2024-05-01T10:00:00.750Z"
    )]
    #[tokio::test]
    async fn story_retry_unit_from_the_markers_second_is_followed(
        #[case] marker: DateTime<Utc>,
        #[case] annotation: &str,
    ) {
        let (ctx, capture, _) = context(World {
            units: vec![
                unit(Stage::Plan, 1, 1, 0),
                unit(Stage::Apply, 1, 0, 1),
                retry_unit(Stage::Apply, marker, 1),
            ],
            ..Default::default()
        });
        let cfg = Arc::new(with_retry(planned(), annotation));

        for _ in 0..3 {
            let action = reconcile(cfg.clone(), ctx.clone()).await.unwrap();
            assert_eq!(action, Action::await_change());
        }

        assert!(capture.created().is_empty());
        let apply = capture.last_condition(CONDITION_TERRAFORM_APPLY).unwrap();
        assert_eq!(apply.status, ConditionStatus::True);
        assert_eq!(
            capture.last_condition(CONDITION_READY).unwrap().status,
            ConditionStatus::True
        );
    }

    #[tokio::test]
    async fn retry_unit_still_running_is_waited_on() {
        let marker = Utc.timestamp_opt(1_714_557_600, 0).unwrap();
        let (ctx, capture, _) = context(World {
            units: vec![
                unit(Stage::Plan, 1, 1, 0),
                unit(Stage::Apply, 1, 0, 1),
                retry_unit(Stage::Apply, marker, 0),
            ],
            ..Default::default()
        });

        let action = reconcile(Arc::new(with_retry(planned(), "1714557600")), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        assert!(capture.created().is_empty());
    }

    /// Story: stages already complete for the generation never create units again
    #[tokio::test]
    async fn story_completed_stages_are_not_repeated() {
        let (ctx, capture, _) = context(World::default());
        let mut cfg = configuration();
        cfg.status = Some(ConfigurationStatus {
            conditions: vec![Condition::new(
                CONDITION_TERRAFORM_PLAN,
                ConditionStatus::True,
                ConditionReason::Ready,
                "plan unit plan-1 succeeded",
                1,
            )],
            ..Default::default()
        });

        reconcile(Arc::new(cfg), ctx).await.unwrap();

        assert_eq!(capture.created_stages(), vec!["apply".to_string()]);
    }

    /// Story: without auto-approval apply waits for the annotation
    #[tokio::test]
    async fn story_apply_waits_for_approval() {
        let (ctx, capture, _) = context(World {
            units: vec![unit(Stage::Plan, 1, 1, 0)],
            ..Default::default()
        });
        let mut cfg = configuration();
        cfg.spec.enable_auto_approval = false;

        let action = reconcile(Arc::new(cfg), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(capture.created().is_empty());
        assert_eq!(
            capture
                .last_condition(CONDITION_TERRAFORM_APPLY)
                .unwrap()
                .reason,
            ConditionReason::ActionRequired
        );
    }

    /// Story: an unready provider is a condition with a fixed retry cadence
    #[tokio::test]
    async fn story_unready_provider_is_reported_not_raised() {
        let mut provider = ready_provider();
        provider.status = None;
        let (ctx, capture, _) = context(World {
            provider: Some(provider),
            ..Default::default()
        });

        let action = reconcile(Arc::new(configuration()), ctx.clone()).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        assert!(capture.created().is_empty());
        assert_eq!(
            capture
                .last_condition(CONDITION_PROVIDER_READY)
                .unwrap()
                .reason,
            ConditionReason::Warning
        );
        assert_eq!(ctx.failures.failures("apps/bucket"), 0);
    }

    /// Story: a running unit is polled, everything complete turns Ready
    #[rstest]
    #[case::running(vec![unit(Stage::Plan, 1, 0, 0)], Action::requeue(Duration::from_secs(10)))]
    #[case::converged(
        vec![unit(Stage::Plan, 1, 1, 0), unit(Stage::Apply, 1, 1, 0)],
        Action::await_change()
    )]
    #[tokio::test]
    async fn story_unit_progress_drives_requeue(#[case] units: Vec<Job>, #[case] expected: Action) {
        let (ctx, capture, _) = context(World {
            units,
            ..Default::default()
        });

        let action = reconcile(Arc::new(configuration()), ctx).await.unwrap();

        assert_eq!(action, expected);
        assert!(capture.created().is_empty());
    }

    #[tokio::test]
    async fn drift_detection_requeues_converged_resources() {
        let (ctx, _, _) = context(World {
            units: vec![unit(Stage::Plan, 1, 1, 0), unit(Stage::Apply, 1, 1, 0)],
            ..Default::default()
        });
        let mut cfg = configuration();
        cfg.spec.enable_drift_detection = true;

        let action = reconcile(Arc::new(cfg), ctx.clone()).await.unwrap();

        assert_eq!(action, Action::requeue(ctx.settings.resync_interval));
    }

    #[tokio::test]
    async fn watcher_is_created_before_the_unit() {
        let (ctx, capture, _) = context(World {
            watchers: true,
            ..Default::default()
        });

        reconcile(Arc::new(configuration()), ctx).await.unwrap();

        let jobs = capture.created();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].metadata.namespace.as_deref(), Some("apps"));
        assert!(jobs[0].metadata.name.as_deref().unwrap().starts_with("watch-"));
        assert_eq!(jobs[1].metadata.namespace.as_deref(), Some("terrace-system"));
    }

    #[tokio::test]
    async fn rejected_watcher_is_reported_and_the_unit_still_runs() {
        let (ctx, capture, events) = context(World {
            watchers: true,
            watcher_rejected: true,
            ..Default::default()
        });

        let action = reconcile(Arc::new(configuration()), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        assert_eq!(capture.created_stages(), vec!["plan".to_string()]);
        let warning = events
            .events()
            .into_iter()
            .find(|e| e.reason == reasons::WATCHER_FAILED)
            .unwrap();
        assert!(warning.warning);
        assert_eq!(warning.action, CONDITION_TERRAFORM_PLAN);
    }

    // ===== Deletion =====

    /// Story: orphaned resources keep their infrastructure but lose generated artifacts
    #[tokio::test]
    async fn story_orphaned_resource_skips_destroy() {
        let (ctx, capture, events) = context(World {
            state_exists: true,
            ..Default::default()
        });
        let mut cfg = deleting(configuration());
        cfg.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_ORPHAN.to_string(),
            "true".to_string(),
        )]));

        let action = reconcile(Arc::new(cfg), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(capture.created().is_empty());
        assert_eq!(capture.deleted_secrets.lock().unwrap().len(), 3);
        assert!(capture.finalizer_removed.load(Ordering::SeqCst));
        assert!(events.has_reason(reasons::CLEANUP_COMPLETE));
    }

    #[tokio::test]
    async fn resource_without_state_has_nothing_to_destroy() {
        let (ctx, capture, _) = context(World::default());

        reconcile(Arc::new(deleting(configuration())), ctx)
            .await
            .unwrap();

        assert!(capture.created().is_empty());
        assert!(capture.finalizer_removed.load(Ordering::SeqCst));
    }

    /// Story: state on record means a destroy unit runs before anything is released
    #[tokio::test]
    async fn story_destroy_runs_before_finalizer_release() {
        let (ctx, capture, events) = context(World {
            state_exists: true,
            ..Default::default()
        });

        let action = reconcile(Arc::new(deleting(configuration())), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        assert_eq!(capture.created_stages(), vec!["destroy".to_string()]);
        assert!(!capture.finalizer_removed.load(Ordering::SeqCst));
        assert!(capture.deleted_secrets.lock().unwrap().is_empty());
        assert!(!events.has_reason(reasons::CLEANUP_COMPLETE));
    }

    #[tokio::test]
    async fn failed_destroy_keeps_the_finalizer() {
        let (ctx, capture, events) = context(World {
            units: vec![unit(Stage::Destroy, 1, 0, 1)],
            state_exists: true,
            ..Default::default()
        });

        let action = reconcile(Arc::new(deleting(configuration())), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert!(!capture.finalizer_removed.load(Ordering::SeqCst));
        assert!(!events.has_reason(reasons::CLEANUP_COMPLETE));
    }

    /// Story: releasing the finalizer before destroy lets the API server reap
    /// the object while its destroy unit is still running
    #[tokio::test]
    async fn story_finalizer_release_must_be_terminal() {
        let hazardous = Pipeline::<Context, Configuration, Scratch>::builder("hazard")
            .step(EnsureFinalizerRemoved::new(FINALIZER))
            .step(EnsureDestroy)
            .build();
        assert!(hazardous.is_err());

        // Run the same order by hand against a store that reaps on release
        let reaped = Arc::new(AtomicBool::new(false));
        let mut mock = MockConfigurationClient::new();
        let reaped_on_release = reaped.clone();
        mock.expect_remove_finalizer().returning(move |_, _, _| {
            reaped_on_release.store(true, Ordering::SeqCst);
            Ok(())
        });
        let reaped_on_get = reaped.clone();
        mock.expect_get_configuration().returning(move |_, _| {
            Ok((!reaped_on_get.load(Ordering::SeqCst)).then(configuration))
        });
        mock.expect_get_secret()
            .returning(|_, _| Ok(Some(Secret::default())));
        mock.expect_get_provider()
            .returning(|_| Ok(Some(ready_provider())));
        mock.expect_create_job().returning(|_| Ok(()));
        let ctx = Context::for_testing(Arc::new(mock));
        let mut cycle: Cycle<Configuration, Scratch> =
            Cycle::new(deleting(configuration()), ctx.cancel.child_token());

        let release = EnsureFinalizerRemoved::new(FINALIZER);
        let released =
            <EnsureFinalizerRemoved as Step<Context, Configuration, Scratch>>::run(
                &release, &ctx, &mut cycle,
            )
            .await;
        assert!(matches!(released, StepOutcome::Continue));

        let destroy = EnsureDestroy.run(&ctx, &mut cycle).await;
        assert!(matches!(destroy, StepOutcome::Requeue(_)));

        // The requeue can never be served: the object is gone
        assert!(ctx
            .kube
            .get_configuration("bucket", "apps")
            .await
            .unwrap()
            .is_none());
        assert_ne!(
            cycle
                .resource
                .condition(CONDITION_TERRAFORM_DESTROY)
                .map(|c| c.status),
            Some(ConditionStatus::True)
        );
    }

    #[tokio::test]
    async fn deletion_without_finalizer_is_ignored() {
        let (ctx, capture, _) = context(World::default());
        let mut cfg = deleting(configuration());
        cfg.metadata.finalizers = None;
        ctx.failures.record_failure("apps/bucket");

        let action = reconcile(Arc::new(cfg), ctx.clone()).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(capture.statuses.lock().unwrap().is_empty());
        assert_eq!(ctx.failures.failures("apps/bucket"), 0);
    }

    #[test]
    fn deletion_pipeline_releases_the_finalizer_last() {
        let names = deletion_pipeline().unwrap().step_names();
        assert_eq!(names.last(), Some(&"EnsureFinalizerRemoved"));
        assert_eq!(provisioning_pipeline().unwrap().step_names()[0], "EnsureFinalizer");
    }

    // ===== Error policy =====

    #[rstest]
    #[case(1, 5)]
    #[case(2, 10)]
    #[case(4, 40)]
    #[case(10, 300)]
    fn error_policy_backs_off_per_object(#[case] failures: u32, #[case] expected_secs: u64) {
        let ctx = Arc::new(Context::for_testing(Arc::new(MockConfigurationClient::new())));
        let cfg = Arc::new(configuration());
        let error = Error::internal("apiserver unavailable");

        let mut action = Action::await_change();
        for _ in 0..failures {
            action = error_policy(cfg.clone(), &error, ctx.clone());
        }

        assert_eq!(action, Action::requeue(Duration::from_secs(expected_secs)));
    }

    #[tokio::test]
    async fn successful_cycle_resets_backoff() {
        let (ctx, _, _) = context(World::default());
        let cfg = Arc::new(configuration());
        error_policy(cfg.clone(), &Error::internal("boom"), ctx.clone());
        error_policy(cfg.clone(), &Error::internal("boom"), ctx.clone());

        reconcile(cfg.clone(), ctx.clone()).await.unwrap();

        assert_eq!(ctx.failures.failures("apps/bucket"), 0);
    }

    // ===== Watch mapping =====

    #[test]
    fn units_map_back_to_their_configuration() {
        let job = unit(Stage::Apply, 1, 0, 0);
        let target = configuration_for_unit(job).unwrap();
        assert_eq!(target.name, "bucket");
        assert_eq!(target.namespace.as_deref(), Some("apps"));

        let mut watcher = unit(Stage::Apply, 1, 0, 0);
        watcher
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(LABEL_COMPONENT.to_string(), "watcher".to_string());
        assert!(configuration_for_unit(watcher).is_none());
        assert!(configuration_for_unit(Job::default()).is_none());
    }
}
