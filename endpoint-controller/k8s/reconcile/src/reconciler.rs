use crate::{
    identity_manager::IdentityManager, metrics::Metrics, pod_endpoint::PodEndpoint,
    pod_labels::LabelConfig, store::NamespaceRecord, Store,
};
use anyhow::{anyhow, Context, Result};
use endpoint_controller_core::{
    ApiError, EndpointApi, IdentityAllocator, Labels, NamespaceApi, ResourceKey,
};
use endpoint_controller_k8s_api::{CiliumEndpoint, Pod};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time};
use tracing::{debug, instrument, trace, warn};

/// Bounds the remote calls made while handling a single event.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Manages the lifecycle of endpoints and their identity references.
///
/// All public operations are serialized; each bounds its remote calls by the
/// configured request timeout, measured from when the operation is invoked.
pub struct Reconciler {
    lock: Mutex<()>,
    pub(crate) store: Arc<Store>,
    pub(crate) identities: IdentityManager,
    endpoints: Arc<dyn EndpointApi>,
    namespaces: Arc<dyn NamespaceApi>,
    labels: LabelConfig,
    request_timeout: Duration,
    pub(crate) metrics: Metrics,
}

impl Reconciler {
    pub fn new(
        allocator: Arc<dyn IdentityAllocator>,
        endpoints: Arc<dyn EndpointApi>,
        namespaces: Arc<dyn NamespaceApi>,
        labels: LabelConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            lock: Mutex::new(()),
            store: Arc::new(Store::default()),
            identities: IdentityManager::new(allocator, metrics.clone()),
            endpoints,
            namespaces,
            labels,
            request_timeout: REQUEST_TIMEOUT,
            metrics,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn identities(&self) -> &IdentityManager {
        &self.identities
    }

    pub(crate) fn deadline(&self) -> time::Instant {
        time::Instant::now() + self.request_timeout
    }

    /// Returns one identity reference, bounded by a fresh deadline since the
    /// event's may already have passed.
    async fn release(&self, labels: &Labels) {
        self.identities
            .decrement_reference(labels, self.deadline())
            .await;
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Brings the pod's endpoint up to date. A missing pod, or one that is
    /// being deleted, has its endpoint deleted.
    #[instrument(skip(self, pod), fields(pod = %key))]
    pub async fn reconcile_pod(&self, key: &ResourceKey, pod: Option<Arc<Pod>>) -> Result<()> {
        let deadline = self.deadline();
        let _lock = self.lock().await;
        self.reconcile_pod_locked(key, pod, deadline).await
    }

    #[instrument(skip(self), fields(pod = %key))]
    pub async fn handle_pod_delete(&self, key: &ResourceKey) -> Result<()> {
        let deadline = self.deadline();
        let _lock = self.lock().await;
        self.handle_pod_delete_locked(key, deadline).await
    }

    async fn reconcile_pod_locked(
        &self,
        key: &ResourceKey,
        pod: Option<Arc<Pod>>,
        deadline: time::Instant,
    ) -> Result<()> {
        let pod = match pod {
            Some(pod) if pod.metadata.deletion_timestamp.is_none() => pod,
            _ => {
                return self
                    .handle_pod_delete_locked(key, deadline)
                    .await
                    .context("failed to delete endpoint for deleted pod")
            }
        };

        let candidate = PodEndpoint::new(key.clone(), Labels::default(), pod);
        if candidate.ipv4.is_empty() || candidate.node_ip.is_empty() {
            trace!("Pod missing an IP, skipping");
            return Ok(());
        }

        let namespace = self.namespace_record(&key.namespace, deadline).await?;
        let candidate = PodEndpoint {
            labels: self.pod_labels(&candidate, &namespace),
            ..candidate
        };
        self.handle_pod_upsert(candidate, deadline)
            .await
            .context("failed to upsert endpoint")
    }

    pub(crate) async fn handle_pod_delete_locked(
        &self,
        key: &ResourceKey,
        deadline: time::Instant,
    ) -> Result<()> {
        let Some(pod) = self.store.get_to_delete_pod(key) else {
            // Endpoints for pods we never processed are left to garbage collection.
            trace!("Pod not tracked, skipping deletion");
            return Ok(());
        };

        match within(deadline, self.endpoints.delete(key)).await {
            Ok(()) => debug!("Deleted endpoint"),
            Err(ApiError::NotFound(_)) => debug!("Endpoint already deleted"),
            Err(error) => return Err(error).context("failed to delete endpoint"),
        }

        // Only once the endpoint is gone; a failed delete is retried and must
        // not return the reference twice.
        self.release(&pod.labels).await;
        self.store.delete_pod(key);
        self.metrics.set_tracked_pods(self.store.pods_len());
        Ok(())
    }

    /// Creates or updates the endpoint for `candidate`.
    ///
    /// Prior state comes from the store or, failing that, from the existing
    /// endpoint resource. Any identity reference taken by a failed attempt is
    /// returned before the error is.
    pub(crate) async fn handle_pod_upsert(
        &self,
        mut candidate: PodEndpoint,
        deadline: time::Instant,
    ) -> Result<()> {
        let key = candidate.key.clone();
        trace!(pod = %key, "Handling pod upsert");

        let cached = self.store.get_pod(&key);
        let in_cache = cached.is_some();
        let prior = match cached {
            Some(cached) => Some(cached),
            None => self.adopt(&key, deadline).await?,
        };

        // Set when this attempt holds a reference for the candidate's labels
        // that no stored state accounts for yet.
        let mut allocated = false;

        if let Some(prior) = prior {
            candidate.endpoint_id = prior.endpoint_id;
            candidate.identity_id = prior.identity_id;

            let same_networking = candidate.same_networking(&prior);
            let same_labels = candidate.labels == prior.labels;
            trace!(pod = %key, in_cache, same_networking, same_labels, "Comparing with prior state");

            // References are held by this process, so adopted state must take
            // its own.
            if !in_cache || !same_labels || candidate.identity_id == 0 {
                candidate.identity_id = self
                    .identities
                    .get_identity_and_increment_reference(&candidate.labels, deadline)
                    .await
                    .context("failed to get identity for updated pod")?;
                allocated = true;
            }

            // The reference backing the stored state, if any.
            let held = in_cache.then(|| prior.labels.clone());

            if same_networking && same_labels && candidate.identity_id == prior.identity_id {
                trace!(pod = %key, "Pod already processed");
                if let (true, Some(held)) = (allocated, held.as_ref()) {
                    self.release(held).await;
                }
                self.store.add_pod(candidate);
                self.metrics.set_tracked_pods(self.store.pods_len());
                return Ok(());
            }

            if !same_networking {
                debug!(pod = %key, "Pod networking changed");
                candidate.endpoint_id = next_endpoint_id(prior.endpoint_id);
            }

            let patch = match candidate.status_patch() {
                Ok(patch) => patch,
                Err(error) => {
                    if allocated {
                        self.release(&candidate.labels).await;
                    }
                    return Err(error);
                }
            };

            match within(deadline, self.endpoints.patch(&key, patch)).await {
                Ok(()) => {
                    debug!(pod = %key, endpoint = candidate.endpoint_id, identity = candidate.identity_id, "Patched endpoint");
                    if allocated {
                        if let Some(held) = held {
                            self.release(&held).await;
                        }
                    }
                    self.store.add_pod(candidate);
                    self.metrics.set_tracked_pods(self.store.pods_len());
                    return Ok(());
                }

                Err(ApiError::NotFound(_)) => {
                    debug!(pod = %key, "Endpoint not found, creating it");
                    self.store.delete_pod(&key);
                    self.metrics.set_tracked_pods(self.store.pods_len());
                    if let Some(held) = held {
                        if allocated {
                            self.release(&held).await;
                        } else {
                            // The stored reference has the candidate's labels;
                            // it now backs the endpoint about to be created.
                            allocated = true;
                        }
                    }
                }

                Err(error) => {
                    warn!(pod = %key, %error, "Failed to patch endpoint");
                    if allocated {
                        self.release(&candidate.labels).await;
                    }
                    return Err(error).context("failed to patch endpoint");
                }
            }
        }

        if !allocated {
            candidate.identity_id = self
                .identities
                .get_identity_and_increment_reference(&candidate.labels, deadline)
                .await
                .context("failed to get identity for new pod")?;
        }
        candidate.endpoint_id = 1;

        if let Err(error) = within(deadline, self.endpoints.create(candidate.to_endpoint())).await {
            warn!(pod = %key, %error, "Failed to create endpoint");
            self.release(&candidate.labels).await;
            return Err(error).context("failed to create endpoint");
        }

        debug!(pod = %key, identity = candidate.identity_id, "Created endpoint");
        self.store.add_pod(candidate);
        self.metrics.set_tracked_pods(self.store.pods_len());
        Ok(())
    }

    async fn adopt(&self, key: &ResourceKey, deadline: time::Instant) -> Result<Option<PodEndpoint>> {
        let endpoint: CiliumEndpoint = match within(deadline, self.endpoints.get(key)).await {
            Ok(Some(ep)) => ep,
            Ok(None) | Err(ApiError::NotFound(_)) => return Ok(None),
            Err(error) => return Err(error).context("failed to get endpoint"),
        };

        let adopted = PodEndpoint::adopt(key.clone(), &endpoint);
        match adopted.as_ref() {
            Some(pe) => trace!(pod = %key, endpoint = pe.endpoint_id, identity = pe.identity_id, "Found existing endpoint"),
            None => warn!(pod = %key, "Endpoint has no IPv4 address, ignoring"),
        }
        Ok(adopted)
    }

    /// Returns the cached namespace, fetching and caching it when missing.
    pub(crate) async fn namespace_record(
        &self,
        name: &str,
        deadline: time::Instant,
    ) -> Result<NamespaceRecord> {
        if let Some(ns) = self.store.get_namespace(name) {
            return Ok(ns);
        }

        let ns = within(deadline, self.namespaces.get_namespace(name))
            .await
            .with_context(|| format!("failed to get namespace {name}"))?;
        let record = NamespaceRecord::from(&ns);
        self.store.add_namespace(record.clone());
        Ok(record)
    }

    pub(crate) fn pod_labels(&self, pe: &PodEndpoint, namespace: &NamespaceRecord) -> Labels {
        match pe.pod.as_deref() {
            Some(pod) => self.labels.pod_labels(pod, namespace),
            None => pe.labels.clone(),
        }
    }
}

/// Endpoint ids are a per-pod generation counter.
fn next_endpoint_id(prior: i64) -> i64 {
    prior.max(0) + 1
}

async fn within<T>(
    deadline: time::Instant,
    call: impl Future<Output = Result<T, ApiError>>,
) -> Result<T, ApiError> {
    time::timeout_at(deadline, call)
        .await
        .unwrap_or_else(|_| Err(ApiError::Other(anyhow!("request timed out"))))
}
