use endpoint_controller_k8s_api::{json_patch, CiliumEndpoint, Namespace, ResourceExt};
use std::fmt;

/// Identifies a namespaced resource. Cluster-scoped resources have an empty
/// namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(ResourceKey),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Reads and writes per-pod endpoint resources.
#[async_trait::async_trait]
pub trait EndpointApi: Send + Sync {
    /// Returns the endpoint's last observed state, if it exists.
    async fn get(&self, key: &ResourceKey) -> Result<Option<CiliumEndpoint>, ApiError>;

    async fn create(&self, endpoint: CiliumEndpoint) -> Result<(), ApiError>;

    /// Applies a JSON patch to the endpoint. Fails with `ApiError::NotFound`
    /// when the endpoint does not exist.
    async fn patch(&self, key: &ResourceKey, patch: json_patch::Patch) -> Result<(), ApiError>;

    /// Deletes the endpoint. Fails with `ApiError::NotFound` when the
    /// endpoint does not exist.
    async fn delete(&self, key: &ResourceKey) -> Result<(), ApiError>;
}

#[async_trait::async_trait]
pub trait NamespaceApi: Send + Sync {
    async fn get_namespace(&self, name: &str) -> Result<Namespace, ApiError>;
}

// === impl ResourceKey ===

impl ResourceKey {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn cluster(name: impl ToString) -> Self {
        Self::new("", name)
    }

    pub fn of<K: ResourceExt>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            return self.name.fmt(f);
        }
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
