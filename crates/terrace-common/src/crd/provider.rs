//! Provider CRD types
//!
//! Providers hold the cloud credentials execution units run with. They are
//! cluster-scoped and referenced by name from a Configuration.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ConditionStatus, HasConditions, SecretRef};

/// Terraform provider family
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Amazon Web Services
    #[default]
    Aws,
    /// Microsoft Azure
    Azurerm,
    /// Google Cloud
    Google,
    /// Kubernetes
    Kubernetes,
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aws => write!(f, "aws"),
            Self::Azurerm => write!(f, "azurerm"),
            Self::Google => write!(f, "google"),
            Self::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Where credentials come from
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CredentialSource {
    /// Static credentials from a Secret
    #[default]
    Secret,
    /// Workload identity injected through a service account
    Injected,
}

/// Cloud credentials for execution units
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "terrace.dev",
    version = "v1alpha1",
    kind = "Provider",
    plural = "providers",
    status = "ProviderStatus",
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.provider"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Provider family
    pub provider: ProviderType,

    /// Credential source
    #[serde(default)]
    pub source: CredentialSource,

    /// Secret with static credentials (required when source is Secret)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,

    /// Service account executors run as (required when source is Injected)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
}

/// Observed state of a Provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ProviderStatus {
    /// Conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

crate::impl_has_conditions!(Provider);

impl Provider {
    /// Whether the provider reports itself ready
    pub fn is_ready(&self) -> bool {
        self.condition("Ready")
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}
