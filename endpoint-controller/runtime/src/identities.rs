use crate::{
    core::{Identity, IdentityAllocator, Labels},
    endpoints::FIELD_MANAGER,
    k8s::{self, Api, CiliumIdentity, Client, ListParams, PostParams},
};
use ahash::AHashMap as HashMap;
use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::ops::RangeInclusive;
use tracing::{debug, info, instrument};

/// Allocates identities as `CiliumIdentity` resources.
///
/// Identity objects are only ever created here. Reference counts are kept in
/// memory, so objects whose count drops to zero are left for an external
/// garbage collector and forgotten. Identities loaded at startup are checked
/// against the API before their first reference is taken.
pub struct CrdIdentityAllocator {
    api: Api<CiliumIdentity>,
    table: Mutex<IdentityTable>,

    /// Serializes creation so that one label set never gets two ids.
    creating: tokio::sync::Mutex<()>,
}

#[derive(Debug)]
struct IdentityTable {
    range: RangeInclusive<i64>,
    next: i64,
    by_labels: HashMap<String, i64>,
    by_id: HashMap<i64, Entry>,
}

#[derive(Debug)]
struct Entry {
    identity: Identity,
    refs: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
enum ReleaseError {
    #[error("identity {0} is not known")]
    Unknown(i64),

    #[error("identity {0} is not referenced")]
    Unreferenced(i64),
}

// === impl CrdIdentityAllocator ===

impl CrdIdentityAllocator {
    /// Loads existing identities so that their ids are reused.
    pub async fn init(client: Client, range: RangeInclusive<i64>) -> Result<Self> {
        if range.is_empty() || *range.start() <= 0 {
            bail!("invalid identity range {range:?}");
        }
        let api = Api::<CiliumIdentity>::all(client);
        let identities = api
            .list(&ListParams::default())
            .await
            .context("failed to list identities")?;

        let mut table = IdentityTable::new(range);
        for obj in identities {
            if let Some(id) = obj.id() {
                table.seed(Identity {
                    id,
                    labels: Labels::from_security_labels(&obj.security_labels),
                });
            }
        }
        info!(identities = table.by_id.len(), "Loaded identities");

        Ok(Self {
            api,
            table: Mutex::new(table),
            creating: tokio::sync::Mutex::new(()),
        })
    }

    async fn create(&self, labels: &Labels) -> Result<(Identity, bool)> {
        let _creating = self.creating.lock().await;
        loop {
            // Another allocation may have finished while waiting.
            if let Some(identity) = self.table.lock().acquire(labels) {
                return Ok((identity, false));
            }

            let unreferenced = self.table.lock().unreferenced(labels);
            if let Some(id) = unreferenced {
                if let Some(identity) = self.confirm(id, labels).await? {
                    return Ok((identity, false));
                }
                continue;
            }

            let Some(id) = self.table.lock().next_free() else {
                bail!("no free identities");
            };
            let identity = Identity {
                id,
                labels: labels.clone(),
            };
            let obj = CiliumIdentity::new(id, labels.to_security_labels());
            let params = PostParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            };
            match self.api.create(&params, &obj).await {
                Ok(_) => {
                    self.table.lock().insert(identity.clone());
                    return Ok((identity, true));
                }
                Err(error) if k8s::is_conflict(&error) => {
                    // Created elsewhere; learn what it holds and try again.
                    let existing = self
                        .api
                        .get(&id.to_string())
                        .await
                        .with_context(|| format!("failed to get identity {id}"))?;
                    debug!(identity = id, "Identity already exists");
                    self.table.lock().seed(Identity {
                        id,
                        labels: Labels::from_security_labels(&existing.security_labels),
                    });
                }
                Err(error) => {
                    return Err(error).with_context(|| format!("failed to create identity {id}"))
                }
            }
        }
    }

    /// Takes the first reference to an unreferenced identity if its object
    /// still exists with the same labels. Otherwise the id is forgotten.
    async fn confirm(&self, id: i64, labels: &Labels) -> Result<Option<Identity>> {
        let obj = self
            .api
            .get_opt(&id.to_string())
            .await
            .with_context(|| format!("failed to get identity {id}"))?;
        let current = obj.is_some_and(|obj| {
            Labels::from_security_labels(&obj.security_labels).canonical() == labels.canonical()
        });

        let mut table = self.table.lock();
        if current {
            return Ok(table.reference(id));
        }
        debug!(identity = id, "Identity no longer exists");
        table.forget(id);
        Ok(None)
    }
}

#[async_trait::async_trait]
impl IdentityAllocator for CrdIdentityAllocator {
    #[instrument(skip_all, fields(%labels))]
    async fn allocate(&self, labels: &Labels) -> Result<(Identity, bool)> {
        if let Some(identity) = self.table.lock().acquire(labels) {
            return Ok((identity, false));
        }
        self.create(labels).await
    }

    /// Identities have no owners to notify, so `notify_owner` is ignored.
    async fn release(&self, identity: &Identity, _notify_owner: bool) -> Result<bool> {
        Ok(self.table.lock().release(identity.id)?)
    }

    async fn lookup_by_id(&self, id: i64) -> Option<Identity> {
        self.table.lock().get(id)
    }
}

// === impl IdentityTable ===

impl IdentityTable {
    fn new(range: RangeInclusive<i64>) -> Self {
        Self {
            next: *range.start(),
            range,
            by_labels: HashMap::default(),
            by_id: HashMap::default(),
        }
    }

    /// Records an identity that exists without taking a reference.
    fn seed(&mut self, identity: Identity) {
        let canonical = identity.labels.canonical();
        self.by_labels.entry(canonical).or_insert(identity.id);
        self.by_id
            .entry(identity.id)
            .or_insert(Entry { identity, refs: 0 });
    }

    /// Takes a reference to an identity for `labels` that is already
    /// referenced.
    fn acquire(&mut self, labels: &Labels) -> Option<Identity> {
        let id = self.by_labels.get(&labels.canonical())?;
        let entry = self.by_id.get_mut(id).filter(|e| e.refs > 0)?;
        entry.refs += 1;
        Some(entry.identity.clone())
    }

    /// Returns the id of a known identity for `labels` that holds no
    /// references.
    fn unreferenced(&self, labels: &Labels) -> Option<i64> {
        let id = *self.by_labels.get(&labels.canonical())?;
        self.by_id.get(&id).filter(|e| e.refs == 0).map(|_| id)
    }

    fn reference(&mut self, id: i64) -> Option<Identity> {
        let entry = self.by_id.get_mut(&id)?;
        entry.refs += 1;
        Some(entry.identity.clone())
    }

    /// Records a newly created identity with one reference.
    fn insert(&mut self, identity: Identity) {
        self.by_labels.insert(identity.labels.canonical(), identity.id);
        self.by_id.insert(identity.id, Entry { identity, refs: 1 });
    }

    fn forget(&mut self, id: i64) {
        if let Some(entry) = self.by_id.remove(&id) {
            let canonical = entry.identity.labels.canonical();
            if self.by_labels.get(&canonical) == Some(&id) {
                self.by_labels.remove(&canonical);
            }
        }
    }

    /// Returns the next unused id, scanning the range from where the previous
    /// scan stopped.
    fn next_free(&mut self) -> Option<i64> {
        let (start, end) = (*self.range.start(), *self.range.end());
        for _ in start..=end {
            let id = self.next;
            self.next = if id >= end { start } else { id + 1 };
            if !self.by_id.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn release(&mut self, id: i64) -> Result<bool, ReleaseError> {
        let entry = self.by_id.get_mut(&id).ok_or(ReleaseError::Unknown(id))?;
        if entry.refs == 0 {
            return Err(ReleaseError::Unreferenced(id));
        }
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(false);
        }
        // The object may be garbage collected from here on.
        self.forget(id);
        Ok(true)
    }

    fn get(&self, id: i64) -> Option<Identity> {
        self.by_id.get(&id).map(|e| e.identity.clone())
    }
}
