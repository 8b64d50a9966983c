//! Controller runner - builds controller futures for each resource kind
//!
//! Each `build_*` function returns boxed futures the caller joins, keeping
//! controller construction separate from process setup.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use terrace_common::config::OperatorSettings;
use terrace_common::crd::{Configuration, Revision};
use terrace_common::{COMPONENT_EXECUTOR, LABEL_COMPONENT};
use tokio_util::sync::CancellationToken;

/// Watcher timeout (seconds), below the client read timeout so idle watches
/// are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the Configuration controller
///
/// Executor units in the controller namespace re-trigger the Configuration
/// named by their owner labels.
pub fn build_configuration_controllers(
    client: Client,
    settings: &OperatorSettings,
    cancel: CancellationToken,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(
        terrace_configuration::Context::builder(client.clone())
            .settings(settings.clone())
            .cancellation(cancel)
            .build(),
    );
    let configurations: Api<Configuration> = Api::all(client.clone());
    let units: Api<Job> = Api::namespaced(client, &settings.namespace);
    let unit_selector = format!("{LABEL_COMPONENT}={COMPONENT_EXECUTOR}");

    tracing::info!(namespace = %settings.namespace, "- Configuration controller");

    vec![Box::pin(
        Controller::new(
            configurations,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .with_config(ControllerConfig::default().concurrency(settings.max_concurrency))
        .watches(
            units,
            WatcherConfig::default()
                .labels(&unit_selector)
                .timeout(WATCH_TIMEOUT_SECS),
            terrace_configuration::configuration_for_unit,
        )
        .shutdown_on_signal()
        .run(
            terrace_configuration::reconcile,
            terrace_configuration::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("Configuration")),
    )]
}

/// Build the Revision and revision-expiration controllers
///
/// Expiration only runs when a threshold is configured.
pub fn build_revision_controllers(
    client: Client,
    settings: &OperatorSettings,
    cancel: CancellationToken,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(
        terrace_revision::Context::builder(client.clone())
            .settings(settings.clone())
            .cancellation(cancel)
            .build(),
    );
    let revisions: Api<Revision> = Api::all(client);

    let revision_ctrl = Controller::new(
        revisions.clone(),
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .with_config(ControllerConfig::default().concurrency(settings.max_concurrency))
    .shutdown_on_signal()
    .run(
        terrace_revision::reconcile,
        terrace_revision::error_policy,
        ctx.clone(),
    )
    .for_each(log_reconcile_result("Revision"));

    tracing::info!("- Revision controller");
    let mut controllers: Vec<ControllerFuture> = vec![Box::pin(revision_ctrl)];

    if let Some(threshold) = settings.revision_expiration {
        let expiration_ctrl = Controller::new(
            revisions,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .with_config(ControllerConfig::default().concurrency(settings.max_concurrency))
        .shutdown_on_signal()
        .run(
            terrace_revision::reconcile_expiration,
            terrace_revision::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("RevisionExpiration"));

        tracing::info!(
            threshold_secs = threshold.as_secs(),
            "- Revision expiration controller"
        );
        controllers.push(Box::pin(expiration_ctrl));
    }

    controllers
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
