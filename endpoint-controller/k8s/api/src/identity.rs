use kube::core::{ClusterResourceScope, ObjectMeta, Resource, TypeMeta};
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, collections::BTreeMap};

use crate::endpoint::{GROUP, VERSION};

const KIND: &str = "CiliumIdentity";
const PLURAL: &str = "ciliumidentities";

/// A cluster-wide numeric security identity.
///
/// The object's name is the decimal identity id. Its `security-labels` map
/// holds the label set the id was allocated for, keyed by `source:key`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct CiliumIdentity {
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,

    pub metadata: ObjectMeta,

    #[serde(rename = "security-labels", default)]
    pub security_labels: BTreeMap<String, String>,
}

impl CiliumIdentity {
    pub fn new(id: i64, security_labels: BTreeMap<String, String>) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: format!("{GROUP}/{VERSION}"),
                kind: KIND.to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(id.to_string()),
                ..Default::default()
            },
            security_labels,
        }
    }

    /// Parses the numeric id from the object name.
    pub fn id(&self) -> Option<i64> {
        self.metadata.name.as_deref()?.parse().ok()
    }
}

impl Resource for CiliumIdentity {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

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
