//! Custom Resource Definitions for Terrace
//!
//! This module contains all CRD definitions used by the Terrace operator.

mod configuration;
mod plan;
mod policy;
mod provider;
mod types;

pub use configuration::{
    Configuration, ConfigurationSpec, ConfigurationStatus, ProviderRef, CONDITION_PROVIDER_READY,
    CONDITION_READY, CONDITION_TERRAFORM_APPLY, CONDITION_TERRAFORM_DESTROY,
    CONDITION_TERRAFORM_PLAN, CONDITION_TERRAFORM_POLICY, CONFIGURATION_CONDITIONS,
};
pub use plan::{
    CloudResource, CloudResourcePlan, CloudResourceSpec, CloudResourceStatus, Plan, PlanRevision,
    PlanSpec, PlanStatus, Revision, RevisionPlan, RevisionSpec, RevisionStatus,
    CONDITION_REVISION_PLAN, REVISION_CONDITIONS,
};
pub use policy::{CheckConstraint, Policy, PolicySpec};
pub use provider::{CredentialSource, Provider, ProviderSpec, ProviderStatus, ProviderType};
pub use types::{Condition, ConditionReason, ConditionStatus, HasConditions, SecretRef};

/// Every CRD served by the operator, for `--crd` output
pub fn all_crds(
) -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    use kube::CustomResourceExt;

    vec![
        Configuration::crd(),
        Provider::crd(),
        Policy::crd(),
        Plan::crd(),
        Revision::crd(),
        CloudResource::crd(),
    ]
}
