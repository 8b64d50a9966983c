//! Kubernetes Event recording for Terrace controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "Ready", "Error")
    /// * `action` - What the event is about (e.g. "TerraformPlan")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "terrace-configuration-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// An event captured by [`RecordingEventPublisher`]
#[cfg(any(test, feature = "testing"))]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Name of the object the event was attached to
    pub object: Option<String>,
    /// True for Warning events
    pub warning: bool,
    /// Reason string
    pub reason: String,
    /// Action string
    pub action: String,
    /// Note
    pub note: Option<String>,
}

/// Publisher that keeps events in memory so tests can assert on them
#[cfg(any(test, feature = "testing"))]
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: std::sync::Mutex<Vec<RecordedEvent>>,
}

#[cfg(any(test, feature = "testing"))]
impl RecordingEventPublisher {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Whether an event with this reason was recorded
    pub fn has_reason(&self, reason: &str) -> bool {
        self.events().iter().any(|e| e.reason == reason)
    }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                object: resource_ref.name.clone(),
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
                action: action.to_string(),
                note,
            });
        }
    }
}

/// Well-known event reason strings beyond condition reasons.
pub mod reasons {
    /// An execution unit was created
    pub const UNIT_CREATED: &str = "UnitCreated";
    /// A revision was removed after expiring
    pub const REVISION_EXPIRED: &str = "RevisionExpired";
    /// Deletion cleanup finished and the finalizer was released
    pub const CLEANUP_COMPLETE: &str = "CleanupComplete";
    /// The log watcher for an execution unit could not be started
    pub const WATCHER_FAILED: &str = "WatcherFailed";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Deleting resources
    pub const DELETE: &str = "Delete";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishers_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
        assert_send_sync::<RecordingEventPublisher>();
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Normal,
                "Ready",
                actions::RECONCILE,
                Some("test".to_string()),
            )
            .await;
    }

    #[tokio::test]
    async fn recording_publisher_captures_events() {
        let publisher = RecordingEventPublisher::new();
        let obj_ref = ObjectReference {
            name: Some("bucket".to_string()),
            ..Default::default()
        };
        publisher
            .publish(
                &obj_ref,
                EventType::Warning,
                "Error",
                "TerraformApply",
                Some("apply failed".to_string()),
            )
            .await;

        let events = publisher.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].warning);
        assert_eq!(events[0].object.as_deref(), Some("bucket"));
        assert!(publisher.has_reason("Error"));
    }
}
