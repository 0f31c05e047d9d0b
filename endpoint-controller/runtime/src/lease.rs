use crate::{endpoints::FIELD_MANAGER, k8s};
use anyhow::{bail, Result};
use k8s_openapi::api::coordination::v1 as coordv1;
use kube::api::{ObjectMeta, Patch, PatchParams};
use std::sync::Arc;
use tokio::{sync::watch, time};
use tracing::{debug, info};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);

type Claims = watch::Receiver<Arc<kubert::lease::Claim>>;

/// Creates the lease if needed and starts competing for it.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    name: &str,
    claimant: &str,
) -> Result<Claims> {
    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            // Only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            labels: Some(
                [(
                    "app.kubernetes.io/name".to_string(),
                    "endpoint-controller".to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = k8s::Api::<coordv1::Lease>::namespaced(runtime.client(), ns);
    match api
        .patch(
            name,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(_)) => debug!("Lease already exists"),
        Err(error) => return Err(error.into()),
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, name)
        .await?
        .spawn(claimant, params)
        .await?;
    Ok(claims)
}

/// Waits until `claimant` holds the lease.
pub async fn acquired(claims: &mut Claims, claimant: &str) -> Result<()> {
    loop {
        if claims.borrow_and_update().is_current_for(claimant) {
            return Ok(());
        }
        info!(holder = %claims.borrow().holder, "Waiting for lease");
        if claims.changed().await.is_err() {
            bail!("lease manager stopped");
        }
    }
}

/// Completes when `claimant` no longer holds the lease.
pub async fn lost(mut claims: Claims, claimant: &str) {
    loop {
        if !claims.borrow_and_update().is_current_for(claimant) {
            return;
        }
        if claims.changed().await.is_err() {
            return;
        }
    }
}
