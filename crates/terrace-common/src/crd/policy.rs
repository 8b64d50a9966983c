//! Policy CRD types
//!
//! Policies describe security checks run against a plan before apply.
//! Matching policies to configurations is done by label selector.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Checkov-style constraint run by the verify stage
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CheckConstraint {
    /// Checks to run (empty means all)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<String>,

    /// Checks to skip
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_checks: Vec<String>,

    /// Configurations this constraint applies to (empty matches all)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
}

/// Security policy evaluated against plans
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "terrace.dev",
    version = "v1alpha1",
    kind = "Policy",
    plural = "policies"
)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// Check constraint
    pub constraint: CheckConstraint,
}

impl Policy {
    /// Whether this policy applies to a resource with the given labels
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let selector = &self.spec.constraint.selector;
        if selector.is_empty() {
            return true;
        }
        let Some(labels) = labels else {
            return false;
        };
        selector.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}
