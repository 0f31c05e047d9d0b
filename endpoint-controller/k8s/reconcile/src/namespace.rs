use crate::{pod_endpoint::PodEndpoint, reconciler::Reconciler, store::NamespaceRecord};
use anyhow::{Context, Result};
use endpoint_controller_k8s_api::{Namespace, ResourceExt};
use tokio::time;
use tracing::{debug, instrument};

impl Reconciler {
    /// Records the namespace. When the labels of an already known namespace
    /// change, every tracked pod in it is reconciled with its new labels.
    #[instrument(skip_all, fields(namespace = ?ns.map(|ns| ns.name_any())))]
    pub async fn reconcile_namespace(&self, ns: Option<&Namespace>) -> Result<()> {
        let deadline = self.deadline();
        let _lock = self.lock().await;

        let Some(ns) = ns else {
            return Ok(());
        };
        if ns.metadata.deletion_timestamp.is_some() {
            self.handle_namespace_delete_locked(&ns.name_any());
            return Ok(());
        }

        let record = NamespaceRecord::from(ns);
        let Some(prior) = self.store.get_namespace(&record.name) else {
            // No pod has been labeled from this namespace yet.
            debug!("Adding namespace");
            self.store.add_namespace(record);
            return Ok(());
        };

        if !prior.relabel_pending {
            if prior.resource_version == record.resource_version {
                debug!("Namespace already processed");
                return Ok(());
            }
            if prior.labels == record.labels {
                debug!("Namespace labels unchanged");
                return Ok(());
            }
        }

        debug!(pending = prior.relabel_pending, "Namespace labels changed");
        let name = record.name.clone();
        self.store.add_namespace(record.clone());
        if let Err(error) = self.reconcile_pods_in_namespace_locked(&name, deadline).await {
            // Pods already relabeled keep the new labels; the next event for
            // this namespace updates the rest.
            self.store.add_namespace(NamespaceRecord {
                relabel_pending: true,
                ..record
            });
            return Err(error)
                .with_context(|| format!("failed to reconcile pods in namespace {name}"));
        }
        Ok(())
    }

    /// Forgets the namespace. Its pods are removed by their own delete events.
    #[instrument(skip(self))]
    pub async fn handle_namespace_delete(&self, name: &str) -> Result<()> {
        let _lock = self.lock().await;
        self.handle_namespace_delete_locked(name);
        Ok(())
    }

    /// Re-derives the labels of every tracked pod in `namespace` and updates
    /// their endpoints.
    #[instrument(skip(self))]
    pub async fn reconcile_pods_in_namespace(&self, namespace: &str) -> Result<()> {
        let deadline = self.deadline();
        let _lock = self.lock().await;
        self.reconcile_pods_in_namespace_locked(namespace, deadline).await
    }

    fn handle_namespace_delete_locked(&self, name: &str) {
        if self.store.get_namespace(name).is_none() {
            return;
        }
        debug!(namespace = %name, "Deleting namespace");
        self.store.delete_namespace(name);
    }

    async fn reconcile_pods_in_namespace_locked(
        &self,
        namespace: &str,
        deadline: time::Instant,
    ) -> Result<()> {
        let ns = self.namespace_record(namespace, deadline).await?;
        for key in self.store.list_pod_keys_by_namespace(namespace) {
            let Some(pe) = self.store.get_pod(&key) else {
                continue;
            };
            if pe.to_delete {
                debug!(pod = %key, "Pod marked for deletion, skipping");
                continue;
            }

            let labels = self.pod_labels(&pe, &ns);
            debug!(pod = %key, old = %pe.labels, new = %labels, "Updating pod labels");
            let candidate = PodEndpoint { labels, ..pe };
            self.handle_pod_upsert(candidate, deadline)
                .await
                .with_context(|| format!("failed to upsert pod {key}"))?;
        }
        Ok(())
    }
}
