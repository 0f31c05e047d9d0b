use crate::{
    core::EventSource,
    endpoints::KubeEndpoints,
    identities::CrdIdentityAllocator,
    k8s::{watcher, CiliumEndpoint, Namespace, Pod},
    lease,
    reconcile::{Dispatch, LabelConfig, Metrics, Reconciler},
    watch::{self, WatchSource},
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "endpoint-controller",
    about = "Maintains an endpoint and a security identity for every pod"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "endpoint_controller=info,warn",
        env = "ENDPOINT_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The cluster name recorded in every pod's labels.
    #[clap(long, default_value = "")]
    cluster_name: String,

    #[clap(long, default_value = "kube-system")]
    lease_namespace: String,

    #[clap(long, default_value = "endpoint-controller")]
    lease_name: String,

    /// The identity used to claim the lease. Defaults to the pod name.
    #[clap(long, env = "HOSTNAME")]
    claimant: String,

    #[clap(long, default_value = "256")]
    identity_min: i64,

    #[clap(long, default_value = "65535")]
    identity_max: i64,

    /// The maximum number of pods reconciled concurrently.
    #[clap(long, default_value = "20")]
    max_workers: usize,

    #[clap(long, default_value = "15000")]
    request_timeout_ms: u64,

    /// Comma-separated regular expressions. Pod labels with matching keys are
    /// ignored. Replaces the default exclusions when set.
    #[clap(long)]
    label_exclusions: Option<Exclusions>,
}

#[derive(Clone, Debug)]
struct Exclusions(Vec<String>);

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            cluster_name,
            lease_namespace,
            lease_name,
            claimant,
            identity_min,
            identity_max,
            max_workers,
            request_timeout_ms,
            label_exclusions,
        } = self;

        let labels = match label_exclusions {
            Some(Exclusions(exclusions)) => LabelConfig::new(cluster_name, exclusions)?,
            None => LabelConfig::with_defaults(cluster_name)?,
        };

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("endpoint_controller"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Identities are cluster state, so only the leader may reconcile.
        let mut claims = lease::init(&runtime, &lease_namespace, &lease_name, &claimant).await?;
        lease::acquired(&mut claims, &claimant).await?;
        info!(%claimant, "Acquired lease");

        let endpoints =
            watch::cache(runtime.watch_all::<CiliumEndpoint>(watcher::Config::default()));
        let mut pods = WatchSource::spawn(runtime.watch_all::<Pod>(watcher::Config::default()));
        let mut namespaces =
            WatchSource::spawn(runtime.watch_all::<Namespace>(watcher::Config::default()));

        // Existing endpoints must be known before pods are reconciled so that
        // they are adopted rather than recreated.
        endpoints.synced().await;
        info!(endpoints = endpoints.len(), "Endpoints synced");

        let allocator =
            CrdIdentityAllocator::init(runtime.client(), identity_min..=identity_max).await?;
        let api = Arc::new(KubeEndpoints::new(runtime.client(), endpoints));
        let reconciler = Reconciler::new(
            Arc::new(allocator),
            api.clone(),
            api,
            labels,
            metrics,
        )
        .with_request_timeout(Duration::from_millis(request_timeout_ms));

        tokio::spawn(
            Dispatch::new(Arc::new(reconciler))
                .with_max_workers(max_workers)
                .run(pods.events(), namespaces.events(), runtime.shutdown_handle())
                .instrument(info_span!("dispatch")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // the background tasks to complete before exiting. A new leader must
        // start from fresh caches, so losing the lease exits.
        tokio::select! {
            res = runtime.run() => {
                if res.is_err() {
                    bail!("Aborted");
                }
            }
            () = lease::lost(claims, &claimant) => bail!("Lost lease"),
        }

        Ok(())
    }
}

impl std::str::FromStr for Exclusions {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(
            s.split(',')
                .map(str::trim)
                .filter(|re| !re.is_empty())
                .map(ToString::to_string)
                .collect(),
        ))
    }
}
