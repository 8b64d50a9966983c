//! Operator settings shared by all controllers
//!
//! Parsed from the CLI/environment by the operator binary and handed to each
//! controller context.

use std::time::Duration;

/// Default executor image
pub const DEFAULT_EXECUTOR_IMAGE: &str = "ghcr.io/terrace-dev/terraform:1.9";

/// Default policy scanner image
pub const DEFAULT_POLICY_IMAGE: &str = "bridgecrew/checkov:3";

/// Default cost estimation image
pub const DEFAULT_INFRACOST_IMAGE: &str = "infracost/infracost:ci-0.10";

/// Settings shared by every controller
#[derive(Clone, Debug)]
pub struct OperatorSettings {
    /// Namespace holding execution units and generated configuration
    pub namespace: String,
    /// Image running terraform
    pub executor_image: String,
    /// Image running policy checks
    pub policy_image: String,
    /// Image running cost estimation
    pub infracost_image: String,
    /// Add cost estimation to plan units
    pub enable_cost_analysis: bool,
    /// Create a log-watcher companion next to each execution unit
    pub enable_watchers: bool,
    /// Maximum concurrent reconciliations per kind
    pub max_concurrency: u16,
    /// Forced re-check interval for drift detection
    pub resync_interval: Duration,
    /// Revisions older than this may expire (None disables expiration)
    pub revision_expiration: Option<Duration>,
    /// How often the expiration check runs per revision
    pub revision_check_interval: Duration,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            namespace: crate::TERRACE_SYSTEM_NAMESPACE.to_string(),
            executor_image: DEFAULT_EXECUTOR_IMAGE.to_string(),
            policy_image: DEFAULT_POLICY_IMAGE.to_string(),
            infracost_image: DEFAULT_INFRACOST_IMAGE.to_string(),
            enable_cost_analysis: false,
            enable_watchers: true,
            max_concurrency: 10,
            resync_interval: Duration::from_secs(300),
            revision_expiration: None,
            revision_check_interval: Duration::from_secs(3600),
        }
    }
}

impl OperatorSettings {
    /// Executor image for an optional terraform version override
    pub fn executor_image_for(&self, terraform_version: Option<&str>) -> String {
        match terraform_version {
            Some(version) => {
                let repo = self
                    .executor_image
                    .rsplit_once(':')
                    .map(|(repo, _)| repo)
                    .unwrap_or(&self.executor_image);
                format!("{repo}:{version}")
            }
            None => self.executor_image.clone(),
        }
    }
}
