//! Configuration CRD types
//!
//! A `Configuration` is a Terraform module plus inputs that the operator
//! drives through plan, policy check and apply, and destroys on deletion.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, SecretRef};

/// Condition tracking the referenced provider
pub const CONDITION_PROVIDER_READY: &str = "ProviderReady";
/// Condition tracking the plan stage
pub const CONDITION_TERRAFORM_PLAN: &str = "TerraformPlan";
/// Condition tracking the policy check stage
pub const CONDITION_TERRAFORM_POLICY: &str = "TerraformPolicy";
/// Condition tracking the apply stage
pub const CONDITION_TERRAFORM_APPLY: &str = "TerraformApply";
/// Condition tracking the destroy stage
pub const CONDITION_TERRAFORM_DESTROY: &str = "TerraformDestroy";
/// Overall readiness
pub const CONDITION_READY: &str = "Ready";

/// Condition types registered on every Configuration, in display order
pub const CONFIGURATION_CONDITIONS: &[&str] = &[
    CONDITION_PROVIDER_READY,
    CONDITION_TERRAFORM_PLAN,
    CONDITION_TERRAFORM_POLICY,
    CONDITION_TERRAFORM_APPLY,
    CONDITION_READY,
];

/// Reference to a cluster-scoped Provider
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ProviderRef {
    /// Name of the Provider
    pub name: String,
}

/// Terraform module driven to convergence by the operator
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "terrace.dev",
    version = "v1alpha1",
    kind = "Configuration",
    plural = "configurations",
    shortname = "tfc",
    namespaced,
    status = "ConfigurationStatus",
    printcolumn = r#"{"name":"Module","type":"string","jsonPath":".spec.module"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Resources","type":"integer","jsonPath":".status.resources"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationSpec {
    /// Terraform module source (git URL, registry address, ...)
    pub module: String,

    /// Provider supplying cloud credentials
    pub provider_ref: ProviderRef,

    /// Input variables passed to the module
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown")]
    pub variables: Option<serde_json::Value>,

    /// Secret receiving the module outputs after apply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_connection_secret_to_ref: Option<SecretRef>,

    /// Apply without waiting for the approval annotation
    #[serde(default)]
    pub enable_auto_approval: bool,

    /// Periodically re-run the workflow to detect drift
    #[serde(default)]
    pub enable_drift_detection: bool,

    /// Terraform image tag override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terraform_version: Option<String>,
}

fn preserve_unknown(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    }))
    .unwrap_or(schemars::schema::Schema::Bool(true))
}

/// Observed state of a Configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationStatus {
    /// Conditions in display order
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Resources in Terraform state after the last successful apply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<u32>,
}

crate::impl_has_conditions!(Configuration);

impl Configuration {
    /// Whether an apply may run without a human approving it
    pub fn apply_approved(&self) -> bool {
        self.spec.enable_auto_approval
            || crate::annotation_is_true(
                self.metadata.annotations.as_ref(),
                crate::ANNOTATION_APPLY_APPROVAL,
            )
    }

    /// Whether the user opted out of destroy-on-delete
    pub fn is_orphaned(&self) -> bool {
        crate::annotation_is_true(self.metadata.annotations.as_ref(), crate::ANNOTATION_ORPHAN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::HasConditions;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn sample() -> Configuration {
        Configuration {
            metadata: ObjectMeta {
                name: Some("bucket".to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            },
            spec: ConfigurationSpec {
                module: "https://github.com/terraform-aws-modules/terraform-aws-s3-bucket".into(),
                provider_ref: ProviderRef { name: "aws".into() },
                variables: Some(serde_json::json!({"bucket": "test"})),
                write_connection_secret_to_ref: None,
                enable_auto_approval: false,
                enable_drift_detection: false,
                terraform_version: None,
            },
            status: None,
        }
    }

    #[test]
    fn approval_requires_annotation_without_auto_approval() {
        let mut cfg = sample();
        assert!(!cfg.apply_approved());

        let mut annotations = BTreeMap::new();
        annotations.insert(crate::ANNOTATION_APPLY_APPROVAL.to_string(), "true".into());
        cfg.metadata.annotations = Some(annotations);
        assert!(cfg.apply_approved());

        let mut cfg = sample();
        cfg.spec.enable_auto_approval = true;
        assert!(cfg.apply_approved());
    }

    #[test]
    fn conditions_mut_creates_status() {
        let mut cfg = sample();
        assert!(cfg.conditions().is_empty());
        cfg.conditions_mut()
            .push(crate::crd::Condition::registered(CONDITION_READY));
        assert!(cfg.status.is_some());
        assert!(cfg.condition(CONDITION_READY).is_some());
    }

    #[test]
    fn spec_round_trips_camel_case() {
        let json = serde_json::to_value(&sample().spec).unwrap();
        assert_eq!(json["providerRef"]["name"], "aws");
        assert_eq!(json["enableAutoApproval"], false);
    }
}
