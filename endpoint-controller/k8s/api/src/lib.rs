#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod endpoint;
pub mod identity;

pub use self::{
    endpoint::{
        AddressPair, CiliumEndpoint, EndpointIdentity, EndpointNetworking, EndpointStatus,
        ENDPOINT_STATE_READY,
    },
    identity::CiliumIdentity,
};
pub use json_patch;
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{Namespace, Pod, PodSpec, PodStatus},
    },
    apimachinery,
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    error::ErrorResponse,
    runtime::watcher,
    Client, Error, Resource,
};

/// Returns true if the error is an API response with the given status code.
pub fn is_status(error: &Error, code: u16) -> bool {
    matches!(error, Error::Api(ErrorResponse { code: c, .. }) if *c == code)
}

/// Returns true if the error indicates that the requested resource does not exist.
pub fn is_not_found(error: &Error) -> bool {
    is_status(error, 404)
}

/// Returns true if the error indicates that the resource already exists.
pub fn is_conflict(error: &Error) -> bool {
    is_status(error, 409)
}
