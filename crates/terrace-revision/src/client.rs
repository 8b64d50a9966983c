//! API server access for the Revision controller

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use terrace_common::crd::{CloudResource, Plan, PlanStatus, Revision};
use terrace_common::{Error, LABEL_PLAN, LABEL_REVISION};

/// Label selector matching the consumers of (plan, revision)
///
/// None when either value cannot be a label value (semver build metadata
/// carries a `+`); callers then list everything and filter on the spec.
pub fn consumer_selector(plan: &str, revision: &str) -> Option<String> {
    (is_label_value(plan) && is_label_value(revision))
        .then(|| format!("{LABEL_PLAN}={plan},{LABEL_REVISION}={revision}"))
}

fn is_label_value(value: &str) -> bool {
    let bytes = value.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Trait abstracting Kubernetes operations for Revisions and Plans
///
/// Revisions and Plans are cluster-scoped. Getters return `Ok(None)` for
/// objects that do not exist.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RevisionClient: Send + Sync {
    /// Get a Revision
    async fn get_revision(&self, name: &str) -> Result<Option<Revision>, Error>;

    /// Write the status of a Revision, guarded by its resourceVersion
    async fn patch_revision_status(&self, revision: &Revision) -> Result<(), Error>;

    /// Add a finalizer to a Revision
    async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error>;

    /// Remove a finalizer from a Revision
    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error>;

    /// List the Revisions belonging to `plan`
    async fn list_plan_revisions(&self, plan: &str) -> Result<Vec<Revision>, Error>;

    /// Delete a Revision; a missing Revision is not an error
    async fn delete_revision(&self, name: &str) -> Result<(), Error>;

    /// Get a Plan
    async fn get_plan(&self, name: &str) -> Result<Option<Plan>, Error>;

    /// Create a Plan
    async fn create_plan(&self, plan: &Plan) -> Result<(), Error>;

    /// Replace the revision list of a Plan, guarded by its resourceVersion
    async fn patch_plan_revisions(&self, plan: &Plan) -> Result<(), Error>;

    /// Write the status of a Plan
    async fn patch_plan_status(&self, name: &str, status: &PlanStatus) -> Result<(), Error>;

    /// Count CloudResources built from (plan, revision) across namespaces
    async fn count_consumers(&self, plan: &str, revision: &str) -> Result<u32, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeRevisionClient {
    client: Client,
}

impl KubeRevisionClient {
    /// Create a new client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn revisions(&self) -> Api<Revision> {
        Api::all(self.client.clone())
    }

    fn plans(&self) -> Api<Plan> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl RevisionClient for KubeRevisionClient {
    async fn get_revision(&self, name: &str) -> Result<Option<Revision>, Error> {
        Ok(self.revisions().get_opt(name).await?)
    }

    async fn patch_revision_status(&self, revision: &Revision) -> Result<(), Error> {
        let name = revision
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("revision has no name"))?;
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": revision.metadata.resource_version },
            "status": revision.status,
        });
        self.revisions()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        let api = self.revisions();
        let revision = api.get(name).await?;

        let mut finalizers = revision.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": revision.metadata.resource_version,
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        let api = self.revisions();
        let Some(revision) = api.get_opt(name).await? else {
            return Ok(());
        };

        let finalizers: Vec<String> = revision
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": revision.metadata.resource_version,
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_plan_revisions(&self, plan: &str) -> Result<Vec<Revision>, Error> {
        let revisions = self.revisions().list(&ListParams::default()).await?;
        Ok(revisions
            .items
            .into_iter()
            .filter(|r| r.spec.plan.name == plan)
            .collect())
    }

    async fn delete_revision(&self, name: &str) -> Result<(), Error> {
        match self.revisions().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(revision = %name, "revision already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_plan(&self, name: &str) -> Result<Option<Plan>, Error> {
        Ok(self.plans().get_opt(name).await?)
    }

    async fn create_plan(&self, plan: &Plan) -> Result<(), Error> {
        self.plans().create(&PostParams::default(), plan).await?;
        Ok(())
    }

    async fn patch_plan_revisions(&self, plan: &Plan) -> Result<(), Error> {
        let name = plan
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("plan has no name"))?;
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": plan.metadata.resource_version },
            "spec": { "revisions": plan.spec.revisions },
        });
        self.plans()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_plan_status(&self, name: &str, status: &PlanStatus) -> Result<(), Error> {
        let patch = serde_json::json!({ "status": status });
        self.plans()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn count_consumers(&self, plan: &str, revision: &str) -> Result<u32, Error> {
        let api: Api<CloudResource> = Api::all(self.client.clone());
        let params = match consumer_selector(plan, revision) {
            Some(selector) => ListParams::default().labels(&selector),
            None => ListParams::default(),
        };
        let consumers = api.list(&params).await?;
        // Labels come from admission; the spec stays authoritative
        let count = consumers
            .items
            .iter()
            .filter(|c| c.spec.plan.name == plan && c.spec.plan.revision == revision)
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}
