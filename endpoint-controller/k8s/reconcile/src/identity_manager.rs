use crate::metrics::Metrics;
use ahash::AHashMap as HashMap;
use anyhow::{anyhow, Context, Result};
use endpoint_controller_core::{IdentityAllocator, Labels};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time;
use tracing::{debug, info, warn};

/// Takes and returns identity references on behalf of pods.
///
/// The allocator owns the reference counts. This type remembers which
/// identity each label set was assigned so that the reference can be
/// returned later given only the labels.
pub struct IdentityManager {
    allocator: Arc<dyn IdentityAllocator>,

    /// Canonical label string to identity id.
    label_identities: Mutex<HashMap<String, i64>>,

    metrics: Metrics,
}

impl IdentityManager {
    pub fn new(allocator: Arc<dyn IdentityAllocator>, metrics: Metrics) -> Self {
        Self {
            allocator,
            label_identities: Mutex::new(HashMap::default()),
            metrics,
        }
    }

    /// Allocates (or reuses) the identity for `labels`, taking a reference.
    ///
    /// Fails if the allocator does not respond before `deadline`.
    pub async fn get_identity_and_increment_reference(
        &self,
        labels: &Labels,
        deadline: time::Instant,
    ) -> Result<i64> {
        let allocated = match time::timeout_at(deadline, self.allocator.allocate(labels)).await {
            Ok(res) => res.context("failed to allocate identity"),
            Err(_) => Err(anyhow!("identity allocation timed out")),
        };
        let (identity, is_new) = match allocated {
            Ok(allocated) => allocated,
            Err(error) => {
                self.metrics.allocated("error");
                return Err(error);
            }
        };

        if is_new {
            info!(identity = identity.id, %labels, "Allocated new identity");
            self.metrics.allocated("created");
        } else {
            debug!(identity = identity.id, %labels, "Reusing identity");
            self.metrics.allocated("reused");
        }

        self.label_identities
            .lock()
            .insert(labels.canonical(), identity.id);
        Ok(identity.id)
    }

    /// Returns one reference to the identity previously assigned to `labels`.
    ///
    /// Labels that were never assigned an identity are ignored. Release
    /// failures, including missing `deadline`, are logged.
    pub async fn decrement_reference(&self, labels: &Labels, deadline: time::Instant) {
        let canonical = labels.canonical();
        let id = self.label_identities.lock().get(&canonical).copied();
        let Some(id) = id else {
            warn!(labels = %canonical, "Expected identity for labels");
            self.metrics.released("untracked");
            return;
        };

        let identity = match time::timeout_at(deadline, self.allocator.lookup_by_id(id)).await {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                warn!(identity = id, "Expected identity for id");
                self.metrics.released("untracked");
                return;
            }
            Err(_) => {
                warn!(identity = id, "Identity lookup timed out");
                self.metrics.released("error");
                return;
            }
        };

        let release = self.allocator.release(&identity, false);
        let released = match time::timeout_at(deadline, release).await {
            Ok(res) => res,
            Err(_) => Err(anyhow!("identity release timed out")),
        };
        match released {
            Ok(true) => {
                info!(identity = id, labels = %canonical, "Released identity due to no more references");
                self.label_identities.lock().remove(&canonical);
                self.metrics.released("released");
            }
            Ok(false) => {
                debug!(identity = id, "Released identity reference");
                self.metrics.released("retained");
            }
            Err(error) => {
                warn!(identity = id, labels = %canonical, error = %format_args!("{error:#}"), "Failed to release identity");
                self.metrics.released("error");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn lookup(&self, labels: &Labels) -> Option<i64> {
        self.label_identities.lock().get(&labels.canonical()).copied()
    }
}
