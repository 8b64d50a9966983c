//! Shared status types for Terrace CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Machine-readable reason attached to a condition
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionReason {
    /// The concern is satisfied
    Ready,
    /// Work is ongoing
    #[default]
    InProgress,
    /// Something needs attention but may resolve itself
    Warning,
    /// A human has to act before progress continues
    ActionRequired,
    /// The concern failed
    Error,
    /// The concern does not apply
    Disabled,
}

impl ConditionReason {
    /// String form used in status and events
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::InProgress => "InProgress",
            Self::Warning => "Warning",
            Self::ActionRequired => "ActionRequired",
            Self::Error => "Error",
            Self::Disabled => "Disabled",
        }
    }
}

impl std::fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes-style condition for status reporting
///
/// Conditions are only ever modified through the condition tracker in
/// `terrace-engine`, which keeps `last_transition_time` honest.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., TerraformPlan, Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: ConditionReason,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Generation of the resource this condition was computed for
    #[serde(default)]
    pub observed_generation: i64,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: ConditionReason,
        message: impl Into<String>,
        observed_generation: i64,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason,
            message: message.into(),
            observed_generation,
            last_transition_time: Utc::now(),
        }
    }

    /// Placeholder used when a condition type is first registered
    pub fn registered(type_: impl Into<String>) -> Self {
        Self::new(
            type_,
            ConditionStatus::Unknown,
            ConditionReason::InProgress,
            "",
            0,
        )
    }

    /// True when the condition holds for the given generation
    pub fn is_complete(&self, generation: i64) -> bool {
        self.status == ConditionStatus::True && self.observed_generation == generation
    }
}

/// Resources whose status carries an ordered list of conditions
pub trait HasConditions {
    /// Current conditions (empty when there is no status yet)
    fn conditions(&self) -> &[Condition];

    /// Mutable conditions, creating the status block if needed
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    /// Look up a condition by type
    fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions().iter().find(|c| c.type_ == type_)
    }
}

/// Implements [`HasConditions`] for a CRD whose status has a `conditions` field
#[macro_export]
macro_rules! impl_has_conditions {
    ($kind:ty) => {
        impl $crate::crd::HasConditions for $kind {
            fn conditions(&self) -> &[$crate::crd::Condition] {
                self.status
                    .as_ref()
                    .map(|s| s.conditions.as_slice())
                    .unwrap_or_default()
            }

            fn conditions_mut(&mut self) -> &mut Vec<$crate::crd::Condition> {
                &mut self.status.get_or_insert_with(Default::default).conditions
            }
        }
    };
}

/// Reference to a Secret in the resource's namespace
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretRef {
    /// Name of the secret
    pub name: String,
    /// Namespace of the secret (defaults to the referencing resource's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn story_conditions_follow_kubernetes_conventions() {
        let before = Utc::now();
        let condition = Condition::new(
            "TerraformPlan",
            ConditionStatus::True,
            ConditionReason::Ready,
            "plan complete",
            3,
        );

        assert_eq!(condition.type_, "TerraformPlan");
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.reason, ConditionReason::Ready);
        assert!(condition.last_transition_time >= before);
    }

    #[test]
    fn completion_requires_true_status_and_matching_generation() {
        let mut condition = Condition::new(
            "TerraformApply",
            ConditionStatus::True,
            ConditionReason::Ready,
            "",
            2,
        );
        assert!(condition.is_complete(2));
        assert!(!condition.is_complete(3));

        condition.status = ConditionStatus::False;
        assert!(!condition.is_complete(2));
    }

    #[test]
    fn registered_conditions_start_unknown() {
        let condition = Condition::registered("Ready");
        assert_eq!(condition.status, ConditionStatus::Unknown);
        assert_eq!(condition.reason, ConditionReason::InProgress);
        assert!(!condition.is_complete(0));
    }

    #[test]
    fn test_condition_serializes_with_kubernetes_field_names() {
        let condition = Condition::new(
            "Ready",
            ConditionStatus::False,
            ConditionReason::ActionRequired,
            "needs approval",
            1,
        );
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["reason"], "ActionRequired");
        assert_eq!(json["observedGeneration"], 1);
        assert!(json.get("lastTransitionTime").is_some());
    }
}
