use anyhow::{Context, Result};
use endpoint_controller_core::{Labels, ResourceKey};
use endpoint_controller_k8s_api::{
    json_patch::{self, jsonptr::PointerBuf},
    AddressPair, CiliumEndpoint, EndpointIdentity, EndpointNetworking, EndpointStatus, Pod,
    ENDPOINT_STATE_READY,
};
use std::sync::Arc;

/// The desired endpoint state of a single pod.
#[derive(Clone, Debug, PartialEq)]
pub struct PodEndpoint {
    pub key: ResourceKey,

    /// Changes whenever the pod's networking changes.
    pub endpoint_id: i64,

    /// Zero when no identity has been assigned.
    pub identity_id: i64,

    pub labels: Labels,
    pub ipv4: String,
    pub node_ip: String,
    pub uid: Option<String>,

    /// Set while a delete is being processed.
    pub to_delete: bool,

    /// The pod as last observed. The snapshot is never mutated.
    pub pod: Option<Arc<Pod>>,
}

impl PodEndpoint {
    pub fn new(key: ResourceKey, labels: Labels, pod: Arc<Pod>) -> Self {
        let status = pod.status.as_ref();
        Self {
            key,
            endpoint_id: 0,
            identity_id: 0,
            labels,
            ipv4: status
                .and_then(|s| s.pod_ip.clone())
                .unwrap_or_default(),
            node_ip: status
                .and_then(|s| s.host_ip.clone())
                .unwrap_or_default(),
            uid: pod.metadata.uid.clone(),
            to_delete: false,
            pod: Some(pod),
        }
    }

    /// Recovers prior state from an existing endpoint resource. Endpoints
    /// without an IPv4 address can't be adopted.
    pub fn adopt(key: ResourceKey, endpoint: &CiliumEndpoint) -> Option<Self> {
        let ipv4 = endpoint.ipv4()?.to_string();
        let status = endpoint.status.as_ref()?;
        let node_ip = status
            .networking
            .as_ref()
            .map(|n| n.node_ip.clone())
            .unwrap_or_default();
        let (identity_id, labels) = match status.identity.as_ref() {
            Some(id) => (id.id, Labels::from_printable(&id.labels)),
            None => (0, Labels::default()),
        };
        Some(Self {
            key,
            endpoint_id: status.id,
            identity_id,
            labels,
            ipv4,
            node_ip,
            uid: None,
            to_delete: false,
            pod: None,
        })
    }

    pub fn same_networking(&self, other: &Self) -> bool {
        self.ipv4 == other.ipv4 && self.node_ip == other.node_ip
    }

    pub fn status(&self) -> EndpointStatus {
        EndpointStatus {
            id: self.endpoint_id,
            identity: Some(EndpointIdentity {
                id: self.identity_id,
                labels: self.labels.to_printable(),
            }),
            networking: Some(EndpointNetworking {
                node_ip: self.node_ip.clone(),
                addressing: vec![AddressPair {
                    ipv4: self.ipv4.clone(),
                    ipv6: None,
                }],
            }),
            state: ENDPOINT_STATE_READY.to_string(),
        }
    }

    /// A patch replacing the endpoint's entire status.
    pub fn status_patch(&self) -> Result<json_patch::Patch> {
        let value = serde_json::to_value(self.status()).context("failed to encode status")?;
        Ok(json_patch::Patch(vec![json_patch::PatchOperation::Replace(
            json_patch::ReplaceOperation {
                path: PointerBuf::from_tokens(["status"]),
                value,
            },
        )]))
    }

    pub fn to_endpoint(&self) -> CiliumEndpoint {
        CiliumEndpoint::new(&self.key.namespace, &self.key.name, self.status())
    }
}
