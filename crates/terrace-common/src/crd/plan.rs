//! Plan, Revision and CloudResource CRD types
//!
//! A Plan groups versioned Revisions of the same blueprint. CloudResources
//! consume a (plan, revision) pair; a Revision is in use while any
//! CloudResource references it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::configuration::ConfigurationSpec;
use super::types::Condition;

/// Condition tracking a revision's plan membership
pub const CONDITION_REVISION_PLAN: &str = "PlanReady";

/// Condition types registered on every Revision, in display order
pub const REVISION_CONDITIONS: &[&str] = &[CONDITION_REVISION_PLAN, "Ready"];

/// Reference from a Plan to one of its Revisions
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanRevision {
    /// Name of the Revision object
    pub name: String,
    /// Semantic version of the Revision
    pub revision: String,
}

/// A versioned family of revisions
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "terrace.dev",
    version = "v1alpha1",
    kind = "Plan",
    plural = "plans",
    status = "PlanStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PlanSpec {
    /// Revisions belonging to this plan
    #[serde(default)]
    pub revisions: Vec<PlanRevision>,
}

/// Observed state of a Plan
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PlanStatus {
    /// Most recent revision by semantic version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest: Option<PlanRevision>,
}

impl PlanSpec {
    /// Highest revision by semantic version; unparsable versions never win
    pub fn latest(&self) -> Option<&PlanRevision> {
        self.revisions
            .iter()
            .filter_map(|r| semver::Version::parse(&r.revision).ok().map(|v| (v, r)))
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, r)| r)
    }

    /// Whether the plan already lists this (name, version) pair
    pub fn contains(&self, name: &str, revision: &str) -> bool {
        self.revisions
            .iter()
            .any(|r| r.name == name && r.revision == revision)
    }
}

/// Plan metadata carried by a revision
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RevisionPlan {
    /// Name of the owning plan
    pub name: String,
    /// Semantic version of this revision
    pub revision: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One versioned blueprint of a plan
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "terrace.dev",
    version = "v1alpha1",
    kind = "Revision",
    plural = "revisions",
    status = "RevisionStatus",
    printcolumn = r#"{"name":"Plan","type":"string","jsonPath":".spec.plan.name"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.plan.revision"}"#,
    printcolumn = r#"{"name":"In Use","type":"integer","jsonPath":".status.inUse"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RevisionSpec {
    /// Plan membership
    pub plan: RevisionPlan,
    /// Configuration template rendered for consumers
    pub configuration: ConfigurationSpec,
}

/// Observed state of a Revision
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RevisionStatus {
    /// Conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Number of CloudResources referencing this revision
    #[serde(default)]
    pub in_use: u32,
}

crate::impl_has_conditions!(Revision);

impl Revision {
    /// Parsed semantic version, if valid
    pub fn version(&self) -> Option<semver::Version> {
        semver::Version::parse(&self.spec.plan.revision).ok()
    }
}

/// Plan reference held by a CloudResource
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct CloudResourcePlan {
    /// Plan name
    pub name: String,
    /// Revision version
    pub revision: String,
}

/// Consumer of a plan revision
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "terrace.dev",
    version = "v1alpha1",
    kind = "CloudResource",
    plural = "cloudresources",
    namespaced,
    status = "CloudResourceStatus"
)]
pub struct CloudResourceSpec {
    /// Plan and revision this resource is built from
    pub plan: CloudResourcePlan,
}

/// Observed state of a CloudResource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CloudResourceStatus {
    /// Conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(name: &str, version: &str) -> PlanRevision {
        PlanRevision {
            name: name.to_string(),
            revision: version.to_string(),
        }
    }

    #[test]
    fn latest_uses_semver_not_lexical_order() {
        let spec = PlanSpec {
            revisions: vec![rev("db-v1.9.0", "1.9.0"), rev("db-v1.10.0", "1.10.0")],
        };
        assert_eq!(spec.latest().map(|r| r.name.as_str()), Some("db-v1.10.0"));
    }

    #[test]
    fn latest_skips_invalid_versions() {
        let spec = PlanSpec {
            revisions: vec![rev("db-bad", "not-a-version"), rev("db-v0.1.0", "0.1.0")],
        };
        assert_eq!(spec.latest().map(|r| r.name.as_str()), Some("db-v0.1.0"));
        assert!(PlanSpec::default().latest().is_none());
    }

    #[test]
    fn contains_matches_name_and_version() {
        let spec = PlanSpec {
            revisions: vec![rev("db-v1", "1.0.0")],
        };
        assert!(spec.contains("db-v1", "1.0.0"));
        assert!(!spec.contains("db-v1", "1.0.1"));
    }
}
