//! Shared context for the Configuration controller

use std::sync::Arc;

use async_trait::async_trait;
use kube::{Client, ResourceExt};
use terrace_common::config::OperatorSettings;
use terrace_common::crd::Configuration;
use terrace_common::events::{EventPublisher, KubeEventPublisher};
use terrace_common::metrics::{MetricsSink, OtelMetrics};
use terrace_common::{Error, Result};
use terrace_engine::backoff::FailureTracker;
use terrace_engine::finalizer::FinalizerStore;
use terrace_engine::pipeline::StatusStore;
use tokio_util::sync::CancellationToken;

use crate::client::{ConfigurationClient, KubeConfigurationClient};
use crate::render::{DefaultJobRenderer, JobRenderer};

/// Name reported on Events emitted by this controller
pub const CONTROLLER_NAME: &str = "terrace-configuration-controller";

/// Shared context for the Configuration controller
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .settings(settings)
///     .cancellation(shutdown.clone())
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn ConfigurationClient>,
    /// Execution unit renderer
    pub renderer: Arc<dyn JobRenderer>,
    /// Event publisher for condition transitions
    pub events: Arc<dyn EventPublisher>,
    /// Metrics sink
    pub metrics: Arc<dyn MetricsSink>,
    /// Operator-wide settings
    pub settings: OperatorSettings,
    /// Cancelled on shutdown; each cycle runs under a child token
    pub cancel: CancellationToken,
    /// Consecutive failures per object for error_policy
    pub failures: FailureTracker,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn ConfigurationClient>) -> Self {
        Self {
            kube,
            renderer: Arc::new(DefaultJobRenderer),
            events: Arc::new(terrace_common::events::NoopEventPublisher),
            metrics: Arc::new(terrace_common::metrics::NoopMetrics),
            settings: OperatorSettings {
                enable_watchers: false,
                ..Default::default()
            },
            cancel: CancellationToken::new(),
            failures: FailureTracker::new(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn ConfigurationClient>>,
    renderer: Option<Arc<dyn JobRenderer>>,
    events: Option<Arc<dyn EventPublisher>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    settings: OperatorSettings,
    cancel: CancellationToken,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            renderer: None,
            events: None,
            metrics: None,
            settings: OperatorSettings::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn ConfigurationClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the execution unit renderer
    pub fn renderer(mut self, renderer: Arc<dyn JobRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the metrics sink
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set operator settings
    pub fn settings(mut self, settings: OperatorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Tie every cycle to a shutdown token
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeConfigurationClient::new(self.client.clone()))),
            renderer: self.renderer.unwrap_or_else(|| Arc::new(DefaultJobRenderer)),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(OtelMetrics::global())),
            settings: self.settings,
            cancel: self.cancel,
            failures: FailureTracker::new(),
        }
    }
}

fn identity(configuration: &Configuration) -> Result<(String, String)> {
    let name = configuration.name_any();
    let namespace = configuration
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "configuration has no namespace"))?;
    Ok((name, namespace))
}

#[async_trait]
impl FinalizerStore<Configuration> for Context {
    async fn add_finalizer(&self, resource: &Configuration, finalizer: &str) -> Result<()> {
        let (name, namespace) = identity(resource)?;
        self.kube.add_finalizer(&name, &namespace, finalizer).await
    }

    async fn remove_finalizer(&self, resource: &Configuration, finalizer: &str) -> Result<()> {
        let (name, namespace) = identity(resource)?;
        self.kube.remove_finalizer(&name, &namespace, finalizer).await
    }
}

#[async_trait]
impl StatusStore<Configuration> for Context {
    async fn write_status(&self, resource: &Configuration) -> Result<()> {
        self.kube.patch_configuration_status(resource).await
    }

    async fn reload(&self, resource: &Configuration) -> Result<Option<Configuration>> {
        let (name, namespace) = identity(resource)?;
        self.kube.get_configuration(&name, &namespace).await
    }
}
