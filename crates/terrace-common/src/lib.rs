//! Common types for Terrace: CRDs, errors, events, metrics and telemetry

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all Terrace CRDs
pub const API_GROUP: &str = "terrace.dev";

/// Default namespace for execution units and generated configuration
pub const TERRACE_SYSTEM_NAMESPACE: &str = "terrace-system";

/// Label carrying the workflow stage of an execution unit
pub const LABEL_STAGE: &str = "terrace.dev/stage";

/// Label carrying the resource generation an execution unit was created for
pub const LABEL_GENERATION: &str = "terrace.dev/generation";

/// Label carrying the retry marker (unix seconds) a unit was created for
pub const LABEL_RETRY: &str = "terrace.dev/retry";

/// Label naming the Plan a CloudResource is built from
pub const LABEL_PLAN: &str = "terrace.dev/plan";

/// Label naming the Revision version a CloudResource is built from
pub const LABEL_REVISION: &str = "terrace.dev/revision";

/// Label carrying the UID of the resource owning an execution unit
pub const LABEL_OWNER_UID: &str = "terrace.dev/owner-uid";

/// Label carrying the name of the resource owning an execution unit
pub const LABEL_OWNER_NAME: &str = "terrace.dev/owner-name";

/// Label carrying the namespace of the resource owning an execution unit
pub const LABEL_OWNER_NAMESPACE: &str = "terrace.dev/owner-namespace";

/// Label distinguishing executor units from watcher companions
pub const LABEL_COMPONENT: &str = "terrace.dev/component";

/// Component label value for execution units
pub const COMPONENT_EXECUTOR: &str = "executor";

/// Component label value for log-watcher companion units
pub const COMPONENT_WATCHER: &str = "watcher";

/// Standard managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Standard managed-by label value
pub const LABEL_MANAGED_BY_TERRACE: &str = "terrace";

/// Annotation approving an apply when auto-approval is disabled ("true"/"false")
pub const ANNOTATION_APPLY_APPROVAL: &str = "terrace.dev/apply";

/// Annotation opting out of destroy-on-delete
pub const ANNOTATION_ORPHAN: &str = "terrace.dev/orphan";

/// Annotation holding a timestamp that forces a failed stage to be retried
pub const ANNOTATION_RETRY: &str = "terrace.dev/retry";

/// Finalizer guarding Terrace-managed resources until cleanup completes
pub const FINALIZER: &str = "terrace.dev/cleanup";

/// Returns true if an annotation is present with a truthy value
pub fn annotation_is_true(
    annotations: Option<&std::collections::BTreeMap<String, String>>,
    key: &str,
) -> bool {
    annotations
        .and_then(|a| a.get(key))
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}
