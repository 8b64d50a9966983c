//! Condition transitions on the in-memory resource
//!
//! All mutations land on the cycle's copy of the resource. Nothing is written
//! to the API server here: the pipeline driver persists status once when the
//! cycle stops and then publishes the buffered [`ConditionEvent`]s.

use std::fmt::Display;

use chrono::Utc;
use terrace_common::crd::{Condition, ConditionReason, ConditionStatus, HasConditions};

/// A condition transition waiting to be published as a Kubernetes Event
#[derive(Clone, Debug, PartialEq)]
pub struct ConditionEvent {
    /// Condition type that changed
    pub condition: String,
    /// New reason
    pub reason: ConditionReason,
    /// New message
    pub message: String,
}

impl ConditionEvent {
    /// Success transitions are Normal events, everything else is a Warning
    pub fn is_warning(&self) -> bool {
        self.reason != ConditionReason::Ready
    }
}

/// Handle for mutating one condition type of a resource
pub struct ConditionTracker<'a> {
    conditions: &'a mut Vec<Condition>,
    events: &'a mut Vec<ConditionEvent>,
    type_: &'a str,
    generation: i64,
}

impl<'a> ConditionTracker<'a> {
    pub(crate) fn new(
        conditions: &'a mut Vec<Condition>,
        events: &'a mut Vec<ConditionEvent>,
        type_: &'a str,
        generation: i64,
    ) -> Self {
        Self {
            conditions,
            events,
            type_,
            generation,
        }
    }

    /// Mark the condition True/Ready
    pub fn success(&mut self, message: impl Into<String>) -> bool {
        self.transition(ConditionStatus::True, ConditionReason::Ready, message.into())
    }

    /// Mark the condition False/Error, appending `err` to the message when given
    pub fn failed(&mut self, err: Option<&dyn Display>, message: impl Into<String>) -> bool {
        let message = message.into();
        let message = match err {
            Some(err) => format!("{message}: {err}"),
            None => message,
        };
        self.transition(ConditionStatus::False, ConditionReason::Error, message)
    }

    /// Mark the condition False/InProgress
    pub fn in_progress(&mut self, message: impl Into<String>) -> bool {
        self.transition(
            ConditionStatus::False,
            ConditionReason::InProgress,
            message.into(),
        )
    }

    /// Mark the condition False/Warning
    pub fn warning(&mut self, message: impl Into<String>) -> bool {
        self.transition(ConditionStatus::False, ConditionReason::Warning, message.into())
    }

    /// Mark the condition False/ActionRequired
    pub fn action_required(&mut self, message: impl Into<String>) -> bool {
        self.transition(
            ConditionStatus::False,
            ConditionReason::ActionRequired,
            message.into(),
        )
    }

    /// Mark the condition False/Disabled
    pub fn disabled(&mut self, message: impl Into<String>) -> bool {
        self.transition(
            ConditionStatus::False,
            ConditionReason::Disabled,
            message.into(),
        )
    }

    /// True when the condition is True for the tracked generation
    pub fn is_complete(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == self.type_ && c.is_complete(self.generation))
    }

    /// Apply a transition; returns true when status, reason or message changed
    fn transition(
        &mut self,
        status: ConditionStatus,
        reason: ConditionReason,
        message: String,
    ) -> bool {
        let generation = self.generation;
        match self.conditions.iter_mut().find(|c| c.type_ == self.type_) {
            Some(existing)
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message =>
            {
                existing.observed_generation = generation;
                false
            }
            Some(existing) => {
                existing.status = status;
                existing.reason = reason;
                existing.message = message.clone();
                existing.observed_generation = generation;
                existing.last_transition_time = Utc::now();
                self.record(reason, message);
                true
            }
            None => {
                self.conditions.push(Condition::new(
                    self.type_,
                    status,
                    reason,
                    message.clone(),
                    generation,
                ));
                self.record(reason, message);
                true
            }
        }
    }

    fn record(&mut self, reason: ConditionReason, message: String) {
        self.events.push(ConditionEvent {
            condition: self.type_.to_string(),
            reason,
            message,
        });
    }
}

/// Add placeholder conditions for any of `types` the resource lacks
///
/// Keeps the display order stable from the first reconcile on. Placeholders
/// do not produce events.
pub fn register_defaults<R: HasConditions>(resource: &mut R, types: &[&str]) {
    let conditions = resource.conditions_mut();
    for type_ in types {
        if !conditions.iter().any(|c| c.type_ == *type_) {
            conditions.push(Condition::registered(*type_));
        }
    }
}
