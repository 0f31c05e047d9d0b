use crate::pod_endpoint::PodEndpoint;
use ahash::AHashMap as HashMap;
use endpoint_controller_core::ResourceKey;
use endpoint_controller_k8s_api::{Namespace, ResourceExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// The processed state of pods and namespaces.
///
/// Each operation is atomic. Callers that read, compare and then write must
/// provide their own serialization.
#[derive(Debug, Default)]
pub struct Store(RwLock<Inner>);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceRecord {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub resource_version: Option<String>,

    /// Set while a label change has not yet reached every pod.
    pub relabel_pending: bool,
}

#[derive(Debug, Default)]
struct Inner {
    pods: HashMap<ResourceKey, PodEndpoint>,
    namespaces: HashMap<String, NamespaceRecord>,
}

// === impl Store ===

impl Store {
    pub fn add_pod(&self, pod: PodEndpoint) {
        self.0.write().pods.insert(pod.key.clone(), pod);
    }

    pub fn get_pod(&self, key: &ResourceKey) -> Option<PodEndpoint> {
        self.0.read().pods.get(key).cloned()
    }

    /// Returns the pod, marking it as being deleted.
    pub fn get_to_delete_pod(&self, key: &ResourceKey) -> Option<PodEndpoint> {
        let mut inner = self.0.write();
        let pod = inner.pods.get_mut(key)?;
        pod.to_delete = true;
        Some(pod.clone())
    }

    pub fn delete_pod(&self, key: &ResourceKey) {
        self.0.write().pods.remove(key);
    }

    /// Returns the keys of all pods in `namespace`, sorted.
    pub fn list_pod_keys_by_namespace(&self, namespace: &str) -> Vec<ResourceKey> {
        let mut keys = self
            .0
            .read()
            .pods
            .keys()
            .filter(|k| k.namespace == namespace)
            .cloned()
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    pub fn pods_len(&self) -> usize {
        self.0.read().pods.len()
    }

    pub fn add_namespace(&self, namespace: NamespaceRecord) {
        self.0
            .write()
            .namespaces
            .insert(namespace.name.clone(), namespace);
    }

    pub fn get_namespace(&self, name: &str) -> Option<NamespaceRecord> {
        self.0.read().namespaces.get(name).cloned()
    }

    pub fn delete_namespace(&self, name: &str) {
        self.0.write().namespaces.remove(name);
    }
}

// === impl NamespaceRecord ===

impl From<&Namespace> for NamespaceRecord {
    fn from(ns: &Namespace) -> Self {
        Self {
            name: ns.name_any(),
            labels: ns.labels().clone(),
            resource_version: ns.resource_version(),
            relabel_pending: false,
        }
    }
}
