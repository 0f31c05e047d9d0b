pub use endpoint_controller_core as core;
pub use endpoint_controller_k8s_api as k8s;
pub use endpoint_controller_k8s_reconcile as reconcile;

mod args;
mod endpoints;
mod identities;
mod lease;
pub mod watch;

pub use self::{
    args::Args,
    endpoints::KubeEndpoints,
    identities::CrdIdentityAllocator,
    watch::{Cache, WatchSource},
};
