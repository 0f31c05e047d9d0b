use crate::{metrics::Metrics, reconciler::Reconciler};
use anyhow::Result;
use endpoint_controller_core::{Event, EventKind, EventStream};
use endpoint_controller_k8s_api::{Namespace, Pod};
use futures::prelude::*;
use std::sync::Arc;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, error, info};

/// The default number of pod events handled concurrently.
pub const MAX_WORKERS: usize = 20;

/// Feeds pod and namespace events to a [`Reconciler`].
///
/// Pod events are handled on a bounded set of tasks. Namespace events are
/// handled one at a time as they are read.
pub struct Dispatch {
    reconciler: Arc<Reconciler>,
    max_workers: usize,
    metrics: Metrics,
}

impl Dispatch {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        let metrics = reconciler.metrics.clone();
        Self {
            reconciler,
            max_workers: MAX_WORKERS,
            metrics,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Handles events until both streams end or shutdown is signaled. In
    /// either case, returns only after every in-flight handler completes.
    pub async fn run(
        self,
        pods: EventStream<Pod>,
        namespaces: EventStream<Namespace>,
        shutdown: drain::Watch,
    ) {
        info!(max_workers = self.max_workers, "Reconciling pods and namespaces");
        let mut workers = JoinSet::new();
        let semaphore = Arc::new(Semaphore::new(self.max_workers));

        future::join(
            self.read_pods(pods, &semaphore, &mut workers, shutdown.clone()),
            self.read_namespaces(namespaces, shutdown.clone()),
        )
        .await;

        debug!(in_flight = workers.len(), "Waiting for pod handlers");
        while let Some(res) = workers.join_next().await {
            if let Err(error) = res {
                error!(%error, "Pod handler failed");
            }
        }
        info!("Stopped reconciling");

        // Holding the watch until here delays shutdown until handlers finish.
        drop(shutdown);
    }

    async fn read_pods(
        &self,
        mut events: EventStream<Pod>,
        semaphore: &Arc<Semaphore>,
        workers: &mut JoinSet<()>,
        shutdown: drain::Watch,
    ) {
        let signaled = shutdown.signaled();
        tokio::pin!(signaled);

        loop {
            let ev = tokio::select! {
                biased;
                _ = &mut signaled => break,
                ev = events.next() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };

            while let Some(res) = workers.try_join_next() {
                if let Err(error) = res {
                    error!(%error, "Pod handler failed");
                }
            }

            if ev.kind == EventKind::Sync {
                debug!("Pods synced");
                self.metrics.event_handled("pod", ev.kind, "ok");
                ev.done(Ok(()));
                continue;
            }

            let host_network = ev.object.as_ref().is_some_and(|pod| {
                pod.spec
                    .as_ref()
                    .and_then(|spec| spec.host_network)
                    .unwrap_or(false)
            });
            if host_network {
                debug!(pod = %ev.key, "Pod is host networked, skipping");
                self.metrics.event_handled("pod", ev.kind, "skipped");
                ev.done(Ok(()));
                continue;
            }

            // Wait for a free worker. Events dropped here are redelivered.
            let permit = tokio::select! {
                biased;
                _ = &mut signaled => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let reconciler = self.reconciler.clone();
            let metrics = self.metrics.clone();
            workers.spawn(async move {
                handle_pod(&reconciler, &metrics, ev).await;
                drop(permit);
            });
        }
        debug!("Stopped reading pod events");
    }

    async fn read_namespaces(&self, mut events: EventStream<Namespace>, shutdown: drain::Watch) {
        let signaled = shutdown.signaled();
        tokio::pin!(signaled);

        loop {
            let ev = tokio::select! {
                biased;
                _ = &mut signaled => break,
                ev = events.next() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };

            let res = match ev.kind {
                EventKind::Sync => {
                    debug!("Namespaces synced");
                    Ok(())
                }
                EventKind::Upsert => {
                    self.reconciler
                        .reconcile_namespace(ev.object.as_deref())
                        .await
                }
                EventKind::Delete => self.reconciler.handle_namespace_delete(&ev.key.name).await,
            };
            complete(&self.metrics, "namespace", ev, res);
        }
        debug!("Stopped reading namespace events");
    }
}

async fn handle_pod(reconciler: &Reconciler, metrics: &Metrics, ev: Event<Pod>) {
    let res = match ev.kind {
        EventKind::Sync => Ok(()),
        EventKind::Upsert => reconciler.reconcile_pod(&ev.key, ev.object.clone()).await,
        EventKind::Delete => reconciler.handle_pod_delete(&ev.key).await,
    };
    complete(metrics, "pod", ev, res);
}

fn complete<T>(metrics: &Metrics, resource: &str, ev: Event<T>, res: Result<()>) {
    match &res {
        Ok(()) => metrics.event_handled(resource, ev.kind, "ok"),
        Err(error) => {
            error!(%resource, key = %ev.key, error = %format_args!("{error:#}"), "Failed to reconcile; requeuing");
            metrics.event_handled(resource, ev.kind, "error");
        }
    }
    ev.done(res);
}
