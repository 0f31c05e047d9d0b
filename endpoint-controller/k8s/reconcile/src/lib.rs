//! Maintains a `CiliumEndpoint` per pod, each referencing a numeric identity
//! derived from the pod's labels.
//!
//! The [`Reconciler`] serializes all mutation of its [`Store`] and of identity
//! reference counts. [`Dispatch`] reads pod and namespace events and fans pod
//! events out to a bounded set of concurrent handlers.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod dispatch;
mod identity_manager;
pub mod metrics;
mod namespace;
mod pod_endpoint;
pub mod pod_labels;
mod reconciler;
mod store;


pub use self::{
    dispatch::{Dispatch, MAX_WORKERS},
    identity_manager::IdentityManager,
    metrics::Metrics,
    pod_endpoint::PodEndpoint,
    pod_labels::LabelConfig,
    reconciler::{Reconciler, REQUEST_TIMEOUT},
    store::{NamespaceRecord, Store},
};
