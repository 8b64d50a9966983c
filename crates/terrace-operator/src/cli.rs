//! Command line and environment configuration

use std::time::Duration;

use clap::Parser;
use terrace_common::config::{
    OperatorSettings, DEFAULT_EXECUTOR_IMAGE, DEFAULT_INFRACOST_IMAGE, DEFAULT_POLICY_IMAGE,
};
use terrace_common::telemetry::LogFormat;
use terrace_common::TERRACE_SYSTEM_NAMESPACE;

/// Terrace - reconciles Terraform modules declared as Kubernetes resources
#[derive(Parser, Debug)]
#[command(name = "terrace", version, about, long_about = None)]
pub struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Namespace holding execution units and generated configuration
    #[arg(long, env = "TERRACE_NAMESPACE", default_value = TERRACE_SYSTEM_NAMESPACE)]
    pub namespace: String,

    /// Maximum concurrent reconciliations per kind
    #[arg(long, env = "TERRACE_MAX_CONCURRENCY", default_value_t = 10)]
    pub max_concurrency: u16,

    /// Image running terraform
    #[arg(long, env = "TERRACE_EXECUTOR_IMAGE", default_value = DEFAULT_EXECUTOR_IMAGE)]
    pub executor_image: String,

    /// Image running policy checks
    #[arg(long, env = "TERRACE_POLICY_IMAGE", default_value = DEFAULT_POLICY_IMAGE)]
    pub policy_image: String,

    /// Image running cost estimation
    #[arg(long, env = "TERRACE_INFRACOST_IMAGE", default_value = DEFAULT_INFRACOST_IMAGE)]
    pub infracost_image: String,

    /// Add cost estimation to plan units
    #[arg(long, env = "TERRACE_ENABLE_COST_ANALYSIS")]
    pub enable_cost_analysis: bool,

    /// Start a log watcher next to each execution unit
    #[arg(
        long,
        env = "TERRACE_ENABLE_WATCHERS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_watchers: bool,

    /// Forced re-check interval for drift detection, in seconds
    #[arg(long, env = "TERRACE_RESYNC_INTERVAL_SECS", default_value_t = 300)]
    pub resync_interval_secs: u64,

    /// Age after which unused revisions expire, in seconds (0 disables)
    #[arg(long, env = "TERRACE_REVISION_EXPIRATION_SECS", default_value_t = 0)]
    pub revision_expiration_secs: u64,

    /// How often each revision is checked for expiry, in seconds
    #[arg(long, env = "TERRACE_REVISION_CHECK_INTERVAL_SECS", default_value_t = 3600)]
    pub revision_check_interval_secs: u64,

    /// Log line format: json or text
    #[arg(long, env = "TERRACE_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,
}

impl Cli {
    /// Settings handed to every controller context
    pub fn settings(&self) -> OperatorSettings {
        OperatorSettings {
            namespace: self.namespace.clone(),
            executor_image: self.executor_image.clone(),
            policy_image: self.policy_image.clone(),
            infracost_image: self.infracost_image.clone(),
            enable_cost_analysis: self.enable_cost_analysis,
            enable_watchers: self.enable_watchers,
            max_concurrency: self.max_concurrency,
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            revision_expiration: (self.revision_expiration_secs > 0)
                .then(|| Duration::from_secs(self.revision_expiration_secs)),
            revision_check_interval: Duration::from_secs(self.revision_check_interval_secs),
        }
    }
}
