//! Ordered step pipelines
//!
//! A reconciliation cycle runs a fixed list of [`Step`]s against one
//! [`Cycle`]. Each step returns a [`StepOutcome`]:
//!
//! - `Continue` moves on to the next step
//! - `Requeue`/`RequeueNow` stop the cycle and ask to run again
//! - `Pause` stops the cycle without an error: state is recorded and nothing
//!   more can happen until something external changes
//! - `Stop` stops the cycle with an error, which the controller turns into
//!   backoff
//!
//! Status is persisted once after the cycle stops, whatever the reason, then
//! the buffered condition events are published.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::Resource;
use terrace_common::crd::{Condition, HasConditions};
use terrace_common::events::EventPublisher;
use terrace_common::metrics::MetricsSink;
use terrace_common::retry::{retry_if, RetryConfig};
use terrace_common::{Error, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::conditions::{ConditionEvent, ConditionTracker};

/// Result of a single step
#[derive(Debug)]
pub enum StepOutcome {
    /// Run the next step
    Continue,
    /// Stop and run the cycle again after the delay
    ///
    /// A zero delay is treated as `Continue`.
    Requeue(Duration),
    /// Stop and run the cycle again immediately
    RequeueNow,
    /// Stop without error; wait for an external change
    Pause,
    /// Stop with an error
    Stop(Error),
}

/// What the controller should do after a cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Every step ran, or a step paused
    Done,
    /// Run again after the delay
    Requeue(Duration),
    /// Run again immediately
    RequeueNow,
}

impl Directive {
    /// Convert into a controller action
    ///
    /// `resync` forces a periodic re-run after `Done` (drift detection,
    /// expiry checks); without it the controller waits for a change.
    pub fn into_action(self, resync: Option<Duration>) -> Action {
        match self {
            Directive::Requeue(delay) => Action::requeue(delay),
            Directive::RequeueNow => Action::requeue(Duration::ZERO),
            Directive::Done => resync.map(Action::requeue).unwrap_or_else(Action::await_change),
        }
    }
}

/// State owned by one reconciliation cycle
///
/// `resource` is the cycle's private copy of the object; condition changes
/// are applied to it and written back once at the end. `scratch` carries
/// values between steps and is dropped with the cycle.
pub struct Cycle<R, S> {
    /// The object being reconciled
    pub resource: R,
    /// Values computed by earlier steps for later ones
    pub scratch: S,
    cancel: CancellationToken,
    events: Vec<ConditionEvent>,
    initial_conditions: Vec<Condition>,
    status_dirty: bool,
}

impl<R, S> Cycle<R, S>
where
    R: Resource + HasConditions,
    S: Default,
{
    /// Start a cycle for `resource`
    pub fn new(resource: R, cancel: CancellationToken) -> Self {
        let initial_conditions = resource.conditions().to_vec();
        Self {
            resource,
            scratch: S::default(),
            cancel,
            events: Vec::new(),
            initial_conditions,
            status_dirty: false,
        }
    }
}

impl<R, S> Cycle<R, S>
where
    R: Resource + HasConditions,
{
    /// Generation of the object as read at the start of the cycle
    pub fn generation(&self) -> i64 {
        self.resource.meta().generation.unwrap_or(0)
    }

    /// Tracker for one condition type at the current generation
    pub fn condition<'a>(&'a mut self, type_: &'a str) -> ConditionTracker<'a> {
        let generation = self.generation();
        ConditionTracker::new(
            self.resource.conditions_mut(),
            &mut self.events,
            type_,
            generation,
        )
    }

    /// True when `type_` is True for the current generation
    pub fn is_complete(&self, type_: &str) -> bool {
        let generation = self.generation();
        self.resource
            .condition(type_)
            .is_some_and(|c| c.is_complete(generation))
    }

    /// Flag a status change outside the conditions list
    pub fn mark_status_dirty(&mut self) {
        self.status_dirty = true;
    }

    /// Whether the status differs from what was read
    pub fn status_changed(&self) -> bool {
        self.status_dirty || self.resource.conditions() != self.initial_conditions.as_slice()
    }

    /// Whether the object is being deleted
    pub fn is_deleting(&self) -> bool {
        self.resource.meta().deletion_timestamp.is_some()
    }

    /// Cancellation token of this cycle
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Condition events recorded so far
    pub fn events(&self) -> &[ConditionEvent] {
        &self.events
    }

    fn take_events(&mut self) -> Vec<ConditionEvent> {
        std::mem::take(&mut self.events)
    }
}

/// One unit of work in a pipeline
#[async_trait]
pub trait Step<C, R, S>: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Whether this step releases the finalizer
    ///
    /// Such a step lets the API server delete the object, so it must be the
    /// last step of its pipeline.
    fn releases_finalizer(&self) -> bool {
        false
    }

    /// Run the step
    async fn run(&self, ctx: &C, cycle: &mut Cycle<R, S>) -> StepOutcome;
}

/// Writes the status of a resource back to the API server
#[async_trait]
pub trait StatusStore<R>: Send + Sync {
    /// Write `resource.status`, guarded by `metadata.resourceVersion`
    async fn write_status(&self, resource: &R) -> Result<()>;

    /// Read the current object to refresh its resourceVersion
    async fn reload(&self, resource: &R) -> Result<Option<R>>;
}

/// Collaborators used when finishing a cycle
pub struct Sinks<'a, R> {
    /// Status persistence
    pub store: &'a dyn StatusStore<R>,
    /// Event publishing for condition transitions
    pub events: &'a dyn EventPublisher,
    /// Cycle and transition metrics
    pub metrics: &'a dyn MetricsSink,
}

/// An ordered list of steps
pub struct Pipeline<C, R, S> {
    name: &'static str,
    steps: Vec<Box<dyn Step<C, R, S>>>,
}

/// Builder for [`Pipeline`]
pub struct PipelineBuilder<C, R, S> {
    name: &'static str,
    steps: Vec<Box<dyn Step<C, R, S>>>,
}

impl<C, R, S> PipelineBuilder<C, R, S>
where
    C: 'static,
    R: 'static,
    S: 'static,
{
    /// Append a step
    pub fn step(mut self, step: impl Step<C, R, S> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Validate ordering and build
    ///
    /// Fails when the pipeline is empty or a finalizer-releasing step is
    /// followed by another step.
    pub fn build(self) -> Result<Pipeline<C, R, S>> {
        if self.steps.is_empty() {
            return Err(Error::internal_with_context(
                "pipeline",
                format!("pipeline {} has no steps", self.name),
            ));
        }
        let last = self.steps.len() - 1;
        if let Some((_, step)) = self
            .steps
            .iter()
            .enumerate()
            .find(|(i, s)| s.releases_finalizer() && *i != last)
        {
            return Err(Error::internal_with_context(
                "pipeline",
                format!(
                    "pipeline {}: step {} releases the finalizer and must be last",
                    self.name,
                    step.name()
                ),
            ));
        }
        Ok(Pipeline {
            name: self.name,
            steps: self.steps,
        })
    }
}

impl<C, R, S> Pipeline<C, R, S>
where
    C: Sync + 'static,
    R: Resource<DynamicType = ()> + HasConditions + Clone + Send + Sync + 'static,
    S: Send + 'static,
{
    /// Start building a pipeline
    pub fn builder(name: &'static str) -> PipelineBuilder<C, R, S> {
        PipelineBuilder {
            name,
            steps: Vec::new(),
        }
    }

    /// Names of the steps in order
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run the steps until one stops the cycle
    ///
    /// Checks cancellation before every step and abandons a step that is
    /// still running when the cycle is cancelled.
    pub async fn run(&self, ctx: &C, cycle: &mut Cycle<R, S>) -> Result<Directive> {
        let cancel = cycle.cancel.clone();
        for step in &self.steps {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                outcome = step.run(ctx, cycle) => outcome,
            };

            match outcome {
                StepOutcome::Continue => {}
                StepOutcome::Requeue(delay) if delay.is_zero() => {}
                StepOutcome::Requeue(delay) => {
                    debug!(
                        pipeline = self.name,
                        step = step.name(),
                        delay_secs = delay.as_secs(),
                        "step requested requeue"
                    );
                    return Ok(Directive::Requeue(delay));
                }
                StepOutcome::RequeueNow => {
                    debug!(pipeline = self.name, step = step.name(), "step requested immediate requeue");
                    return Ok(Directive::RequeueNow);
                }
                StepOutcome::Pause => {
                    debug!(pipeline = self.name, step = step.name(), "step paused cycle");
                    return Ok(Directive::Done);
                }
                StepOutcome::Stop(e) => {
                    debug!(pipeline = self.name, step = step.name(), error = %e, "step failed");
                    return Err(e);
                }
            }
        }
        Ok(Directive::Done)
    }

    /// Run the steps, persist status and publish condition events
    ///
    /// The step error wins over a status write error.
    pub async fn execute(
        &self,
        ctx: &C,
        cycle: &mut Cycle<R, S>,
        sinks: &Sinks<'_, R>,
    ) -> Result<Directive> {
        let started = Instant::now();
        let kind = R::kind(&()).to_string();

        let outcome = self.run(ctx, cycle).await;

        let persisted = if cycle.status_changed() {
            let deleting = cycle.is_deleting();
            persist_status(sinks.store, &cycle.resource, deleting).await
        } else {
            Ok(())
        };

        if persisted.is_ok() {
            let object_ref = cycle.resource.object_ref(&());
            for event in cycle.take_events() {
                sinks
                    .metrics
                    .condition_transitioned(&kind, &event.condition, event.reason.as_str());
                let type_ = if event.is_warning() {
                    EventType::Warning
                } else {
                    EventType::Normal
                };
                sinks
                    .events
                    .publish(
                        &object_ref,
                        type_,
                        event.reason.as_str(),
                        &event.condition,
                        Some(event.message),
                    )
                    .await;
            }
        }

        let result = match (outcome, persisted) {
            (Err(e), Err(write_err)) => {
                warn!(pipeline = self.name, error = %write_err, "status write failed after step error");
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(_), Err(e)) => Err(e),
            (Ok(directive), Ok(())) => Ok(directive),
        };

        let label = match &result {
            Ok(Directive::Done) => "done",
            Ok(_) => "requeue",
            Err(_) => "error",
        };
        sinks
            .metrics
            .reconcile_finished(&kind, label, started.elapsed());

        result
    }
}

/// Write status with the resource's concurrency token, refreshing the token
/// and retrying on conflict
///
/// A missing object is fine while it is being deleted: the finalizer was
/// released and the API server already removed it.
async fn persist_status<R>(store: &dyn StatusStore<R>, resource: &R, deleting: bool) -> Result<()>
where
    R: Resource + Clone + Send + Sync,
{
    let token = Arc::new(Mutex::new(resource.meta().resource_version.clone()));
    let config = RetryConfig::status_write();

    let result = retry_if(
        &config,
        "write_status",
        |e: &Error| e.is_conflict(),
        move || {
            let token = token.clone();
            async move {
                let mut candidate = resource.clone();
                candidate.meta_mut().resource_version = token.lock().await.clone();
                match store.write_status(&candidate).await {
                    Err(e) if e.is_conflict() => {
                        if let Some(fresh) = store.reload(&candidate).await? {
                            *token.lock().await = fresh.meta().resource_version.clone();
                        }
                        Err(e)
                    }
                    other => other,
                }
            }
        },
    )
    .await;

    match result {
        Err(e) if deleting && e.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for engine tests

    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::sync::Mutex as StdMutex;
    use terrace_common::crd::{ConditionStatus, HasConditions};

    /// Minimal conditioned resource for engine tests
    #[derive(Clone, Debug)]
    pub struct Widget {
        pub inner: ConfigMap,
        pub conditions: Vec<Condition>,
    }

    impl Widget {
        pub fn new(name: &str, generation: i64) -> Self {
            let mut inner = ConfigMap::default();
            inner.metadata.name = Some(name.to_string());
            inner.metadata.namespace = Some("default".to_string());
            inner.metadata.generation = Some(generation);
            inner.metadata.resource_version = Some("1".to_string());
            Self {
                inner,
                conditions: Vec::new(),
            }
        }

        pub fn status_of(&self, type_: &str) -> Option<ConditionStatus> {
            self.condition(type_).map(|c| c.status)
        }
    }

    impl Resource for Widget {
        type DynamicType = ();
        type Scope = k8s_openapi::NamespaceResourceScope;

        fn kind(_: &()) -> std::borrow::Cow<'_, str> {
            "Widget".into()
        }
        fn group(_: &()) -> std::borrow::Cow<'_, str> {
            "test.terrace.dev".into()
        }
        fn version(_: &()) -> std::borrow::Cow<'_, str> {
            "v1".into()
        }
        fn plural(_: &()) -> std::borrow::Cow<'_, str> {
            "widgets".into()
        }
        fn meta(&self) -> &kube::api::ObjectMeta {
            &self.inner.metadata
        }
        fn meta_mut(&mut self) -> &mut kube::api::ObjectMeta {
            &mut self.inner.metadata
        }
    }

    impl HasConditions for Widget {
        fn conditions(&self) -> &[Condition] {
            &self.conditions
        }
        fn conditions_mut(&mut self) -> &mut Vec<Condition> {
            &mut self.conditions
        }
    }

    /// Status store recording every write
    #[derive(Default)]
    pub struct RecordingStore {
        pub writes: StdMutex<Vec<Widget>>,
        pub conflicts_remaining: StdMutex<u32>,
        pub not_found: bool,
    }

    #[async_trait]
    impl StatusStore<Widget> for RecordingStore {
        async fn write_status(&self, resource: &Widget) -> Result<()> {
            if self.not_found {
                return Err(terrace_common::error::api_error(404));
            }
            {
                let mut remaining = self.conflicts_remaining.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(terrace_common::error::api_error(409));
                }
            }
            self.writes.lock().unwrap().push(resource.clone());
            Ok(())
        }

        async fn reload(&self, resource: &Widget) -> Result<Option<Widget>> {
            let mut fresh = resource.clone();
            fresh.inner.metadata.resource_version = Some("2".to_string());
            Ok(Some(fresh))
        }
    }
}
