use crate::{
    core::{ApiError, EndpointApi, NamespaceApi, ResourceKey, Snapshot},
    k8s::{
        self, json_patch, Api, CiliumEndpoint, Client, DeleteParams, Namespace, Patch,
        PatchParams, PostParams,
    },
};
use std::sync::Arc;
use tracing::debug;

pub(crate) const FIELD_MANAGER: &str = "endpoint-controller";

/// Writes `CiliumEndpoint` resources through the Kubernetes API.
///
/// Reads are served from a watch cache so that adopting an existing endpoint
/// does not cost a request.
pub struct KubeEndpoints {
    client: Client,
    cache: Arc<dyn Snapshot<CiliumEndpoint>>,
}

impl KubeEndpoints {
    pub fn new(client: Client, cache: Arc<dyn Snapshot<CiliumEndpoint>>) -> Self {
        Self { client, cache }
    }

    fn api(&self, namespace: &str) -> Api<CiliumEndpoint> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl EndpointApi for KubeEndpoints {
    async fn get(&self, key: &ResourceKey) -> Result<Option<CiliumEndpoint>, ApiError> {
        Ok(self.cache.get(key).map(|ep| (*ep).clone()))
    }

    async fn create(&self, endpoint: CiliumEndpoint) -> Result<(), ApiError> {
        let key = ResourceKey::of(&endpoint);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api(&key.namespace)
            .create(&params, &endpoint)
            .await
            .map_err(|error| api_error(&key, "create", error))?;
        debug!(endpoint = %key, "Created");
        Ok(())
    }

    async fn patch(&self, key: &ResourceKey, patch: json_patch::Patch) -> Result<(), ApiError> {
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api(&key.namespace)
            .patch(&key.name, &params, &Patch::Json::<()>(patch))
            .await
            .map_err(|error| api_error(key, "patch", error))?;
        debug!(endpoint = %key, "Patched");
        Ok(())
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ApiError> {
        self.api(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map_err(|error| api_error(key, "delete", error))?;
        debug!(endpoint = %key, "Deleted");
        Ok(())
    }
}

#[async_trait::async_trait]
impl NamespaceApi for KubeEndpoints {
    async fn get_namespace(&self, name: &str) -> Result<Namespace, ApiError> {
        Api::<Namespace>::all(self.client.clone())
            .get(name)
            .await
            .map_err(|error| api_error(&ResourceKey::cluster(name), "get", error))
    }
}

fn api_error(key: &ResourceKey, op: &str, error: k8s::Error) -> ApiError {
    if k8s::is_not_found(&error) {
        return ApiError::NotFound(key.clone());
    }
    ApiError::Other(anyhow::Error::new(error).context(format!("failed to {op} {key}")))
}
