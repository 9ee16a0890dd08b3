//! `ClusterSource` backed by the Kubernetes API.
//!
//! Everything is read as `DynamicObject` so the policy reaches the sanitizer
//! exactly as the API server returned it, including fields a typed client
//! would drop.

use futures::FutureExt;
use futures::future::BoxFuture;
use k8s_openapi::api::admissionregistration::v1::ValidatingAdmissionPolicy;
use kube::api::{Api, ApiResource, DynamicObject, ListParams};
use kube::core::TypeMeta;
use kube::Client;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{ClusterError, ClusterSource, ParamsTarget};

/// API resource of ValidatingAdmissionPolicy (cluster-scoped).
pub fn policy_api_resource() -> ApiResource {
    ApiResource::erase::<ValidatingAdmissionPolicy>(&())
}

/// API resource of a params collection.
pub fn params_api_resource(target: &ParamsTarget) -> ApiResource {
    ApiResource {
        group: target.group.clone(),
        version: target.version.clone(),
        api_version: target.api_version(),
        kind: target.kind.clone(),
        plural: target.plural.clone(),
    }
}

/// Cluster reads over a kube client.
#[derive(Clone)]
pub struct KubeClusterSource {
    client: Client,
}

impl KubeClusterSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn policies(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &policy_api_resource())
    }

    #[instrument(skip(self))]
    async fn fetch_policy(&self, name: &str) -> Result<Value, ClusterError> {
        let policy = self.policies().get(name).await?;
        Ok(serde_json::to_value(policy)?)
    }

    #[instrument(skip(self))]
    async fn fetch_policies(&self) -> Result<Vec<Value>, ClusterError> {
        let list = self.policies().list(&ListParams::default()).await?;
        debug!(count = list.items.len(), "Listed policies");
        list.items
            .into_iter()
            .map(|p| serde_json::to_value(p).map_err(ClusterError::from))
            .collect()
    }

    #[instrument(skip(self, target), fields(target = %target))]
    async fn fetch_first(&self, target: &ParamsTarget) -> Result<Option<Value>, ClusterError> {
        let resource = params_api_resource(target);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let list = api.list(&ListParams::default().limit(1)).await?;

        let Some(mut item) = list.items.into_iter().next() else {
            return Ok(None);
        };
        // List items come back without apiVersion/kind
        item.types.get_or_insert_with(|| TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        Ok(Some(serde_json::to_value(item)?))
    }
}

impl ClusterSource for KubeClusterSource {
    fn get_policy<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Value, ClusterError>> {
        self.fetch_policy(name).boxed()
    }

    fn list_policies(&self) -> BoxFuture<'_, Result<Vec<Value>, ClusterError>> {
        self.fetch_policies().boxed()
    }

    fn first_item<'a>(
        &'a self,
        target: &'a ParamsTarget,
    ) -> BoxFuture<'a, Result<Option<Value>, ClusterError>> {
        self.fetch_first(target).boxed()
    }
}
