#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod endpoint;
pub mod event;
pub mod identity;
pub mod labels;

pub use self::{
    endpoint::{ApiError, EndpointApi, NamespaceApi, ResourceKey},
    event::{Event, EventKind, EventSource, EventStream, Snapshot},
    identity::{Identity, IdentityAllocator},
    labels::{Label, Labels},
};
