//! Shared context for the Revision controllers

use std::sync::Arc;

use async_trait::async_trait;
use kube::{Client, ResourceExt};
use terrace_common::config::OperatorSettings;
use terrace_common::crd::Revision;
use terrace_common::events::{EventPublisher, KubeEventPublisher};
use terrace_common::metrics::{MetricsSink, OtelMetrics};
use terrace_common::Result;
use terrace_engine::backoff::FailureTracker;
use terrace_engine::finalizer::FinalizerStore;
use terrace_engine::pipeline::StatusStore;
use tokio_util::sync::CancellationToken;

use crate::client::{KubeRevisionClient, RevisionClient};

/// Name reported on Events emitted by this controller
pub const CONTROLLER_NAME: &str = "terrace-revision-controller";

/// Shared context for the Revision and expiration controllers
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn RevisionClient>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Metrics sink
    pub metrics: Arc<dyn MetricsSink>,
    /// Operator-wide settings
    pub settings: OperatorSettings,
    /// Cancelled on shutdown
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
    pub fn for_testing(kube: Arc<dyn RevisionClient>) -> Self {
        Self {
            kube,
            events: Arc::new(terrace_common::events::NoopEventPublisher),
            metrics: Arc::new(terrace_common::metrics::NoopMetrics),
            settings: OperatorSettings::default(),
            cancel: CancellationToken::new(),
            failures: FailureTracker::new(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn RevisionClient>>,
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
            events: None,
            metrics: None,
            settings: OperatorSettings::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn RevisionClient>) -> Self {
        self.kube = Some(kube);
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
                .unwrap_or_else(|| Arc::new(KubeRevisionClient::new(self.client.clone()))),
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

#[async_trait]
impl FinalizerStore<Revision> for Context {
    async fn add_finalizer(&self, resource: &Revision, finalizer: &str) -> Result<()> {
        self.kube
            .add_finalizer(&resource.name_any(), finalizer)
            .await
    }

    async fn remove_finalizer(&self, resource: &Revision, finalizer: &str) -> Result<()> {
        self.kube
            .remove_finalizer(&resource.name_any(), finalizer)
            .await
    }
}

#[async_trait]
impl StatusStore<Revision> for Context {
    async fn write_status(&self, resource: &Revision) -> Result<()> {
        self.kube.patch_revision_status(resource).await
    }

    async fn reload(&self, resource: &Revision) -> Result<Option<Revision>> {
        self.kube.get_revision(&resource.name_any()).await
    }
}
