//! API server access for the Configuration controller

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use terrace_common::crd::{Configuration, Policy, Provider};
use terrace_common::{Error, COMPONENT_EXECUTOR, LABEL_COMPONENT, LABEL_OWNER_UID};

/// Trait abstracting Kubernetes operations for Configurations
///
/// Getters return `Ok(None)` for objects that do not exist.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigurationClient: Send + Sync {
    /// Get a Configuration
    async fn get_configuration(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Configuration>, Error>;

    /// Write the status of a Configuration, guarded by its resourceVersion
    async fn patch_configuration_status(&self, configuration: &Configuration)
        -> Result<(), Error>;

    /// Add a finalizer to a Configuration
    async fn add_finalizer(&self, name: &str, namespace: &str, finalizer: &str)
        -> Result<(), Error>;

    /// Remove a finalizer from a Configuration
    async fn remove_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Get a cluster-scoped Provider
    async fn get_provider(&self, name: &str) -> Result<Option<Provider>, Error>;

    /// List all Policies
    async fn list_policies(&self) -> Result<Vec<Policy>, Error>;

    /// List execution units (not watchers) owned by the resource with `owner_uid`
    async fn list_units(&self, namespace: &str, owner_uid: &str) -> Result<Vec<Job>, Error>;

    /// Create a Job; an existing Job with the same name is not an error
    async fn create_job(&self, job: &Job) -> Result<(), Error>;

    /// Delete every execution unit owned by the resource with `owner_uid`
    async fn delete_units(&self, namespace: &str, owner_uid: &str) -> Result<(), Error>;

    /// Get a Secret
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// Create a Secret
    async fn create_secret(&self, secret: &Secret) -> Result<(), Error>;

    /// Merge data into an existing Secret
    async fn patch_secret_data(
        &self,
        name: &str,
        namespace: &str,
        data: &BTreeMap<String, ByteString>,
    ) -> Result<(), Error>;

    /// Delete a Secret; returns false when it did not exist
    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<bool, Error>;
}

fn unit_selector(owner_uid: &str) -> ListParams {
    ListParams::default().labels(&format!(
        "{LABEL_OWNER_UID}={owner_uid},{LABEL_COMPONENT}={COMPONENT_EXECUTOR}"
    ))
}

/// Real Kubernetes client implementation
pub struct KubeConfigurationClient {
    client: Client,
}

impl KubeConfigurationClient {
    /// Create a new client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn configurations(&self, namespace: &str) -> Api<Configuration> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ConfigurationClient for KubeConfigurationClient {
    async fn get_configuration(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Configuration>, Error> {
        Ok(self.configurations(namespace).get_opt(name).await?)
    }

    async fn patch_configuration_status(
        &self,
        configuration: &Configuration,
    ) -> Result<(), Error> {
        let name = configuration
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("configuration has no name"))?;
        let namespace = configuration
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::validation_for(name, "configuration has no namespace"))?;

        // resourceVersion in the patch makes the API server reject stale writes
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": configuration.metadata.resource_version },
            "status": configuration.status,
        });
        self.configurations(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api = self.configurations(namespace);
        let configuration = api.get(name).await?;

        let mut finalizers = configuration.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": configuration.metadata.resource_version,
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api = self.configurations(namespace);
        let Some(configuration) = api.get_opt(name).await? else {
            return Ok(());
        };

        let finalizers: Vec<String> = configuration
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": configuration.metadata.resource_version,
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_provider(&self, name: &str) -> Result<Option<Provider>, Error> {
        let api: Api<Provider> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_policies(&self) -> Result<Vec<Policy>, Error> {
        let api: Api<Policy> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_units(&self, namespace: &str, owner_uid: &str) -> Result<Vec<Job>, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&unit_selector(owner_uid)).await?.items)
    }

    async fn delete_units(&self, namespace: &str, owner_uid: &str) -> Result<(), Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.delete_collection(&DeleteParams::background(), &unit_selector(owner_uid))
            .await?;
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> Result<(), Error> {
        let namespace = job
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::validation("job has no namespace"))?;
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), job).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(job = ?job.metadata.name, "job already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = secret
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::validation("secret has no namespace"))?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), secret).await?;
        Ok(())
    }

    async fn patch_secret_data(
        &self,
        name: &str,
        namespace: &str,
        data: &BTreeMap<String, ByteString>,
    ) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "data": data });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<bool, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
