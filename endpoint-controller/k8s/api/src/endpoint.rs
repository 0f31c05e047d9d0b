use kube::core::{NamespaceResourceScope, ObjectMeta, Resource, TypeMeta};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

pub const GROUP: &str = "cilium.io";
pub const VERSION: &str = "v2";
pub const ENDPOINT_STATE_READY: &str = "ready";

const KIND: &str = "CiliumEndpoint";
const PLURAL: &str = "ciliumendpoints";

/// The per-pod networking resource mirrored into the cluster API.
///
/// The resource has no spec: all of its state lives in `status`, which is
/// replaced wholesale whenever the pod's identity or addressing changes.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CiliumEndpoint {
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,

    pub metadata: ObjectMeta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EndpointStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStatus {
    #[serde(default)]
    pub id: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<EndpointIdentity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking: Option<EndpointNetworking>,

    #[serde(default)]
    pub state: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct EndpointIdentity {
    #[serde(default)]
    pub id: i64,

    /// Printable `source:key=value` labels, sorted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointNetworking {
    #[serde(rename = "node", default)]
    pub node_ip: String,

    #[serde(default)]
    pub addressing: Vec<AddressPair>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AddressPair {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ipv4: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
}

// === impl CiliumEndpoint ===

impl CiliumEndpoint {
    pub fn new(namespace: impl ToString, name: impl ToString, status: EndpointStatus) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: format!("{GROUP}/{VERSION}"),
                kind: KIND.to_string(),
            }),
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(status),
        }
    }

    /// Returns the first IPv4 address recorded in the status, if any.
    pub fn ipv4(&self) -> Option<&str> {
        self.status
            .as_ref()?
            .networking
            .as_ref()?
            .addressing
            .first()
            .map(|a| a.ipv4.as_str())
            .filter(|ip| !ip.is_empty())
    }
}

impl Resource for CiliumEndpoint {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        KIND.into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        GROUP.into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        PLURAL.into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_wire_shape() {
        let status = EndpointStatus {
            id: 1,
            identity: Some(EndpointIdentity {
                id: 70000,
                labels: vec!["k8s:app=web".to_string()],
            }),
            networking: Some(EndpointNetworking {
                node_ip: "10.0.0.1".to_string(),
                addressing: vec![AddressPair {
                    ipv4: "1.2.3.4".to_string(),
                    ipv6: None,
                }],
            }),
            state: ENDPOINT_STATE_READY.to_string(),
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            serde_json::json!({
                "id": 1,
                "identity": { "id": 70000, "labels": ["k8s:app=web"] },
                "networking": { "node": "10.0.0.1", "addressing": [{ "ipv4": "1.2.3.4" }] },
                "state": "ready",
            })
        );
    }

    #[test]
    fn ipv4_requires_addressing() {
        let mut cep = CiliumEndpoint::new("ns", "pod", EndpointStatus::default());
        assert_eq!(cep.ipv4(), None);

        cep.status.as_mut().unwrap().networking = Some(EndpointNetworking {
            node_ip: "10.0.0.1".to_string(),
            addressing: vec![AddressPair::default()],
        });
        assert_eq!(cep.ipv4(), None);

        cep.status.as_mut().unwrap().networking = Some(EndpointNetworking {
            node_ip: "10.0.0.1".to_string(),
            addressing: vec![AddressPair {
                ipv4: "1.2.3.4".to_string(),
                ipv6: None,
            }],
        });
        assert_eq!(cep.ipv4(), Some("1.2.3.4"));
    }

    #[test]
    fn new_sets_type_meta() {
        let cep = CiliumEndpoint::new("ns", "pod", EndpointStatus::default());
        let value = serde_json::to_value(&cep).unwrap();
        assert_eq!(value["apiVersion"], "cilium.io/v2");
        assert_eq!(value["kind"], "CiliumEndpoint");
        assert_eq!(value["metadata"]["namespace"], "ns");
    }
}
