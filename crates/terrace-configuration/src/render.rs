//! Execution unit and configuration artifact rendering
//!
//! Units run in the controller namespace and find everything they need in
//! the `config-{uid}` Secret: the module's input variables, the state backend
//! and the provider block. Terraform state lives in the
//! `tfstate-default-{uid}` Secret written by the kubernetes backend.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvFromSource, EnvVar, PodSpec, PodTemplateSpec, Secret, SecretEnvSource,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use terrace_common::config::OperatorSettings;
use terrace_common::crd::{Configuration, CredentialSource, Policy, Provider};
use terrace_common::{
    Error, COMPONENT_WATCHER, LABEL_COMPONENT, LABEL_MANAGED_BY, LABEL_MANAGED_BY_TERRACE,
    LABEL_OWNER_NAME, LABEL_OWNER_NAMESPACE, LABEL_OWNER_UID,
};
use terrace_engine::unit::{self, Stage};

/// Mount path of the configuration Secret inside executor containers
pub const CONFIG_MOUNT_PATH: &str = "/run/terrace/config";

/// Key holding input variables
pub const KEY_VARIABLES: &str = "variables.tfvars.json";
/// Key holding the backend block
pub const KEY_BACKEND: &str = "backend.tf";
/// Key holding the provider block
pub const KEY_PROVIDER: &str = "provider.tf";

/// Service account executors run as with static credentials
const DEFAULT_EXECUTOR_SERVICE_ACCOUNT: &str = "terrace-executor";

/// Retries of a failed executor pod before the unit counts as failed
const EXECUTOR_BACKOFF_LIMIT: i32 = 2;

/// Name of the generated configuration Secret
pub fn config_secret_name(uid: &str) -> String {
    format!("config-{uid}")
}

/// Name of the Secret the verify stage writes its report to
pub fn policy_secret_name(uid: &str) -> String {
    format!("policy-{uid}")
}

/// Name of the Secret the apply stage writes module outputs to
pub fn outputs_secret_name(uid: &str) -> String {
    format!("outputs-{uid}")
}

/// Key of the outputs Secret holding the number of resources in state
///
/// Written by the apply unit next to the module outputs and never copied
/// into the connection secret.
pub const RESOURCE_COUNT_KEY: &str = "terrace.resources";

/// Name of the Secret the kubernetes backend keeps state in
pub fn state_secret_name(uid: &str) -> String {
    format!("tfstate-default-{uid}")
}

/// Deterministic unit name for (stage, owner, generation, retry marker)
///
/// Creating the same unit twice hits AlreadyExists instead of duplicating
/// work; a retry marker yields a fresh name.
pub fn unit_name(stage: Stage, uid: &str, generation: i64, retry: Option<DateTime<Utc>>) -> String {
    let compact: String = uid.chars().filter(|c| *c != '-').collect();
    match retry {
        Some(ts) => format!("{stage}-{compact}-{generation}-{}", ts.timestamp()),
        None => format!("{stage}-{compact}-{generation}"),
    }
}

/// Everything a renderer needs to build one execution unit
pub struct UnitRequest<'a> {
    /// Resource the unit works for
    pub configuration: &'a Configuration,
    /// Resolved credentials
    pub provider: &'a Provider,
    /// Policy for the verify stage
    pub policy: Option<&'a Policy>,
    /// Stage to run
    pub stage: Stage,
    /// Generation the unit is created for
    pub generation: i64,
    /// Retry marker the unit answers, if any
    pub retry: Option<DateTime<Utc>>,
    /// Operator settings (namespace, images)
    pub settings: &'a OperatorSettings,
}

impl UnitRequest<'_> {
    fn uid(&self) -> Result<String, Error> {
        self.configuration
            .uid()
            .ok_or_else(|| Error::render(self.stage.as_str(), "configuration has no uid"))
    }
}

/// Builds execution units and their watcher companions
pub trait JobRenderer: Send + Sync {
    /// Render the execution unit for a stage
    fn render_unit(&self, request: &UnitRequest<'_>) -> Result<Job, Error>;

    /// Render the watcher that follows `unit` from the resource namespace
    fn render_watcher(&self, request: &UnitRequest<'_>, unit: &Job) -> Result<Job, Error>;
}

/// Renderer producing terraform executor Jobs
#[derive(Clone, Debug, Default)]
pub struct DefaultJobRenderer;

impl DefaultJobRenderer {
    fn executor_env(&self, request: &UnitRequest<'_>, uid: &str) -> Vec<EnvVar> {
        let mut env = vec![
            env_var("TF_IN_AUTOMATION", "true"),
            env_var("TERRACE_STAGE", request.stage.as_str()),
            env_var("TERRACE_MODULE", &request.configuration.spec.module),
            env_var("TERRACE_CONFIG_DIR", CONFIG_MOUNT_PATH),
            env_var("TERRACE_NAMESPACE", &request.settings.namespace),
        ];
        match request.stage {
            Stage::Apply => {
                env.push(env_var("TERRACE_OUTPUTS_SECRET", &outputs_secret_name(uid)));
                env.push(env_var("TERRACE_RESOURCE_COUNT_KEY", RESOURCE_COUNT_KEY));
            }
            Stage::Verify => env.push(env_var("TERRACE_POLICY_SECRET", &policy_secret_name(uid))),
            Stage::Plan | Stage::Destroy => {}
        }
        env
    }

    fn executor_container(&self, request: &UnitRequest<'_>, uid: &str) -> Container {
        let configuration = request.configuration;
        let env_from = match (&request.provider.spec.source, &request.provider.spec.secret_ref) {
            (CredentialSource::Secret, Some(secret)) => Some(vec![EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: secret.name.clone(),
                    optional: Some(false),
                }),
                ..Default::default()
            }]),
            _ => None,
        };

        Container {
            name: "terraform".to_string(),
            image: Some(
                request
                    .settings
                    .executor_image_for(configuration.spec.terraform_version.as_deref()),
            ),
            command: Some(vec!["terraform-exec".to_string()]),
            args: Some(vec![request.stage.to_string()]),
            env: Some(self.executor_env(request, uid)),
            env_from,
            volume_mounts: Some(vec![VolumeMount {
                name: "config".to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn policy_container(&self, request: &UnitRequest<'_>, uid: &str) -> Container {
        let mut args = vec!["--directory".to_string(), CONFIG_MOUNT_PATH.to_string()];
        if let Some(policy) = request.policy {
            let constraint = &policy.spec.constraint;
            if !constraint.checks.is_empty() {
                args.push("--check".to_string());
                args.push(constraint.checks.join(","));
            }
            if !constraint.skip_checks.is_empty() {
                args.push("--skip-check".to_string());
                args.push(constraint.skip_checks.join(","));
            }
        }

        Container {
            name: "policy".to_string(),
            image: Some(request.settings.policy_image.clone()),
            args: Some(args),
            env: Some(self.executor_env(request, uid)),
            volume_mounts: Some(vec![VolumeMount {
                name: "config".to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn cost_container(&self, request: &UnitRequest<'_>) -> Container {
        Container {
            name: "infracost".to_string(),
            image: Some(request.settings.infracost_image.clone()),
            args: Some(vec![
                "breakdown".to_string(),
                "--path".to_string(),
                CONFIG_MOUNT_PATH.to_string(),
            ]),
            ..Default::default()
        }
    }
}

impl JobRenderer for DefaultJobRenderer {
    fn render_unit(&self, request: &UnitRequest<'_>) -> Result<Job, Error> {
        let uid = request.uid()?;
        let configuration = request.configuration;
        let labels = unit::unit_labels(
            request.stage,
            request.generation,
            request.retry,
            &configuration.metadata,
        );

        // Plan with cost analysis runs terraform first, then infracost on its output
        let (init_containers, containers) = match request.stage {
            Stage::Verify => (None, vec![self.policy_container(request, &uid)]),
            Stage::Plan if request.settings.enable_cost_analysis => (
                Some(vec![self.executor_container(request, &uid)]),
                vec![self.cost_container(request)],
            ),
            _ => (None, vec![self.executor_container(request, &uid)]),
        };

        let service_account = match request.provider.spec.source {
            CredentialSource::Injected => request
                .provider
                .spec
                .service_account
                .clone()
                .ok_or_else(|| {
                    Error::render(
                        request.stage.as_str(),
                        format!(
                            "provider {} uses injected credentials but names no service account",
                            request.provider.name_any()
                        ),
                    )
                })?,
            CredentialSource::Secret => DEFAULT_EXECUTOR_SERVICE_ACCOUNT.to_string(),
        };

        Ok(Job {
            metadata: ObjectMeta {
                name: Some(unit_name(request.stage, &uid, request.generation, request.retry)),
                namespace: Some(request.settings.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(EXECUTOR_BACKOFF_LIMIT),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        init_containers,
                        containers,
                        service_account_name: Some(service_account),
                        volumes: Some(vec![Volume {
                            name: "config".to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(config_secret_name(&uid)),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        restart_policy: Some("Never".to_string()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn render_watcher(&self, request: &UnitRequest<'_>, unit: &Job) -> Result<Job, Error> {
        let configuration = request.configuration;
        let uid = request.uid()?;
        let namespace = configuration
            .namespace()
            .ok_or_else(|| Error::render(request.stage.as_str(), "configuration has no namespace"))?;
        let unit_name = unit
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::render(request.stage.as_str(), "unit has no name"))?;

        let mut labels = BTreeMap::new();
        labels.insert(
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_TERRACE.to_string(),
        );
        labels.insert(LABEL_COMPONENT.to_string(), COMPONENT_WATCHER.to_string());
        labels.insert(LABEL_OWNER_UID.to_string(), uid.clone());
        labels.insert(LABEL_OWNER_NAME.to_string(), configuration.name_any());
        labels.insert(LABEL_OWNER_NAMESPACE.to_string(), namespace.clone());

        Ok(Job {
            metadata: ObjectMeta {
                name: Some(format!("watch-{unit_name}")),
                namespace: Some(namespace),
                labels: Some(labels.clone()),
                owner_references: Some(vec![OwnerReference {
                    api_version: Configuration::api_version(&()).to_string(),
                    kind: Configuration::kind(&()).to_string(),
                    name: configuration.name_any(),
                    uid,
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                ttl_seconds_after_finished: Some(3600),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "watch".to_string(),
                            image: Some(request.settings.executor_image.clone()),
                            command: Some(vec!["terraform-exec".to_string()]),
                            args: Some(vec![
                                "watch".to_string(),
                                "--namespace".to_string(),
                                request.settings.namespace.clone(),
                                "--job".to_string(),
                                unit_name,
                            ]),
                            ..Default::default()
                        }],
                        restart_policy: Some("Never".to_string()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Render the `config-{uid}` Secret for a configuration
pub fn render_job_configuration(
    configuration: &Configuration,
    provider: &Provider,
    namespace: &str,
) -> Result<Secret, Error> {
    let uid = configuration
        .uid()
        .ok_or_else(|| Error::validation_for(configuration.name_any(), "configuration has no uid"))?;

    let variables = match &configuration.spec.variables {
        Some(vars) => serde_json::to_vec_pretty(vars)?,
        None => b"{}".to_vec(),
    };
    let backend = format!(
        "terraform {{\n  backend \"kubernetes\" {{\n    in_cluster_config = true\n    namespace         = \"{namespace}\"\n    secret_suffix     = \"{uid}\"\n  }}\n}}\n"
    );
    let provider_block = format!("provider \"{}\" {{}}\n", provider.spec.provider);

    let mut data = BTreeMap::new();
    data.insert(KEY_VARIABLES.to_string(), ByteString(variables));
    data.insert(KEY_BACKEND.to_string(), ByteString(backend.into_bytes()));
    data.insert(KEY_PROVIDER.to_string(), ByteString(provider_block.into_bytes()));

    let mut labels = BTreeMap::new();
    labels.insert(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_TERRACE.to_string(),
    );
    labels.insert(LABEL_OWNER_UID.to_string(), uid.clone());
    labels.insert(LABEL_OWNER_NAME.to_string(), configuration.name_any());
    if let Some(ns) = configuration.namespace() {
        labels.insert(LABEL_OWNER_NAMESPACE.to_string(), ns);
    }

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(config_secret_name(&uid)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}
