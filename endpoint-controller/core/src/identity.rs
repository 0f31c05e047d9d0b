use crate::labels::Labels;
use anyhow::Result;

/// A numeric identity shared by every endpoint with an equivalent label set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub id: i64,
    pub labels: Labels,
}

/// Allocates numeric identities for label sets.
///
/// The allocator owns the durable label-to-id mapping and a reference count
/// per identity; every successful `allocate` takes a reference that must be
/// returned through `release`.
#[async_trait::async_trait]
pub trait IdentityAllocator: Send + Sync {
    /// Returns the identity for `labels`, creating one if none exists. The
    /// boolean is true when the identity was newly created.
    async fn allocate(&self, labels: &Labels) -> Result<(Identity, bool)>;

    /// Drops one reference. Returns true when no references remain.
    async fn release(&self, identity: &Identity, notify_owner: bool) -> Result<bool>;

    async fn lookup_by_id(&self, id: i64) -> Option<Identity>;
}
