//! Converge lock
//!
//! The in-cluster reconciler and dhctl coordinate through a
//! coordination.k8s.io/v1 Lease. While dhctl holds it the reconciler does
//! not touch nodes, so it cannot recreate machines that are being destroyed.

use crate::error::{DestroyError, Result};
use crate::kubernetes::KubeClientProvider;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CONVERGE_LEASE_NAME: &str = "d8-converge-lock";
pub const CONVERGE_LEASE_NAMESPACE: &str = "kube-system";

/// How long the lease is valid without renewal
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

/// Renew interval (~1/3 of TTL)
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(100);

/// Lease duration set when watching stops but the lock must stay held
pub const HELD_WITHOUT_WATCH_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const HOLDER_PREFIX: &str = "dhctl-destroy-";

#[derive(Debug, Clone)]
pub struct ConvergeLockConfig {
    /// Unique identifier of this run
    pub holder_id: String,
    /// Leases held by identities with this prefix belong to earlier runs of ours
    pub holder_prefix: String,
    pub lease_name: String,
    pub lease_namespace: String,
    pub lease_duration_seconds: i32,
    pub renew_interval: Duration,
}

impl ConvergeLockConfig {
    /// Config for a destroy run on this machine
    ///
    /// Holder identity is `dhctl-destroy-<user>@<host>-<uuid>`; a lease left
    /// behind by an earlier destroy from the same user and host is taken over.
    pub fn for_destroy() -> Self {
        let holder_prefix = format!(
            "{HOLDER_PREFIX}{}@{}",
            crate::tmplock::current_user(),
            crate::tmplock::current_host()
        );
        Self {
            holder_id: format!("{holder_prefix}-{}", uuid::Uuid::new_v4()),
            holder_prefix,
            lease_name: CONVERGE_LEASE_NAME.to_string(),
            lease_namespace: CONVERGE_LEASE_NAMESPACE.to_string(),
            lease_duration_seconds: DEFAULT_LOCK_TTL.as_secs() as i32,
            renew_interval: DEFAULT_RENEW_INTERVAL,
        }
    }
}

/// What to do with the lease as found in the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    Renew,
    /// Expired, or left by an earlier run of ours
    TakeOver { transitions: i32 },
    Contended { holder: String },
}

/// Decide how to acquire given the current lease spec
pub fn decide(spec: Option<&LeaseSpec>, config: &ConvergeLockConfig, now: DateTime<Utc>) -> LeaseDecision {
    let current_holder = spec.and_then(|s| s.holder_identity.as_deref());
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let lease_duration = spec.and_then(|s| s.lease_duration_seconds);
    let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);

    match current_holder {
        None | Some("") => return LeaseDecision::TakeOver { transitions },
        Some(holder) if holder == config.holder_id => return LeaseDecision::Renew,
        Some(holder) if holder.starts_with(&format!("{}-", config.holder_prefix)) => {
            return LeaseDecision::TakeOver { transitions }
        }
        _ => {}
    }

    let is_expired = match (renew_time, lease_duration) {
        (Some(MicroTime(renew)), Some(duration)) => {
            now > *renew + chrono::Duration::seconds(duration as i64)
        }
        _ => true,
    };

    if is_expired {
        LeaseDecision::TakeOver { transitions }
    } else {
        LeaseDecision::Contended {
            holder: current_holder.unwrap_or_default().to_string(),
        }
    }
}

/// Try to acquire or renew the lease
///
/// Returns `Ok(None)` when held, `Ok(Some(holder))` when someone else holds it.
async fn try_acquire_or_renew(api: &Api<Lease>, config: &ConvergeLockConfig) -> Result<Option<String>> {
    let now = Utc::now();
    let now_micro = MicroTime(now);

    match api.get(&config.lease_name).await {
        Ok(existing) => match decide(existing.spec.as_ref(), config, now) {
            LeaseDecision::Renew => {
                debug!(holder_id = %config.holder_id, "Renewing converge lock");
                let patch = serde_json::json!({
                    "spec": {
                        "renewTime": now_micro,
                        "leaseDurationSeconds": config.lease_duration_seconds
                    }
                });
                api.patch(&config.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(None)
            }
            LeaseDecision::TakeOver { transitions } => {
                info!(holder_id = %config.holder_id, "Taking over converge lock");
                let patch = serde_json::json!({
                    "spec": {
                        "holderIdentity": config.holder_id,
                        "acquireTime": now_micro,
                        "renewTime": now_micro,
                        "leaseDurationSeconds": config.lease_duration_seconds,
                        "leaseTransitions": transitions + 1
                    }
                });
                api.patch(&config.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(None)
            }
            LeaseDecision::Contended { holder } => Ok(Some(holder)),
        },
        Err(kube::Error::Api(err)) if err.code == 404 => {
            info!(holder_id = %config.holder_id, "Creating converge lock lease");
            let lease = Lease {
                metadata: kube::api::ObjectMeta {
                    name: Some(config.lease_name.clone()),
                    namespace: Some(config.lease_namespace.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(config.holder_id.clone()),
                    acquire_time: Some(now_micro.clone()),
                    renew_time: Some(now_micro),
                    lease_duration_seconds: Some(config.lease_duration_seconds),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(None),
                Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
                    // Someone created it between our get and create
                    Ok(Some("unknown (lease created concurrently)".to_string()))
                }
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
pub trait ConvergeLocker: Send + Sync {
    /// Acquire the converge lock and keep renewing it in the background
    async fn lock(&self, kube: Arc<dyn KubeClientProvider>) -> Result<Arc<dyn ConvergeUnlocker>>;
}

/// Handle returned by [`ConvergeLocker::lock`]
///
/// Each method takes effect at most once; later calls are no-ops.
#[async_trait]
pub trait ConvergeUnlocker: Send + Sync {
    /// Stop renewing but leave the lease held in the cluster
    async fn stop_watch(&self) -> Result<()>;

    /// Stop renewing and delete the lease
    async fn release(&self) -> Result<()>;
}

pub struct KubeConvergeLocker {
    config: ConvergeLockConfig,
    cancel: CancellationToken,
}

impl KubeConvergeLocker {
    pub fn new(config: ConvergeLockConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }
}

#[async_trait]
impl ConvergeLocker for KubeConvergeLocker {
    async fn lock(&self, kube: Arc<dyn KubeClientProvider>) -> Result<Arc<dyn ConvergeUnlocker>> {
        let client = kube.kube_client().await?;
        let api: Api<Lease> = Api::namespaced(client, &self.config.lease_namespace);

        if let Some(holder) = try_acquire_or_renew(&api, &self.config).await? {
            return Err(DestroyError::LockContended(format!(
                "converge lock {}/{} is held by {holder}; wait for the running converge to finish",
                self.config.lease_namespace, self.config.lease_name
            )));
        }
        info!(
            holder_id = %self.config.holder_id,
            lease_name = %self.config.lease_name,
            "Converge lock acquired"
        );

        let watch = self.cancel.child_token();
        let handle = tokio::spawn(renew_loop(api.clone(), self.config.clone(), watch.clone()));

        Ok(Arc::new(KubeConvergeUnlocker {
            api,
            config: self.config.clone(),
            watch,
            handle: Mutex::new(Some(handle)),
            watch_stopped: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }))
    }
}

async fn renew_loop(api: Api<Lease>, config: ConvergeLockConfig, watch: CancellationToken) {
    let mut interval = tokio::time::interval(config.renew_interval);
    // First tick fires immediately; the lease was just acquired
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match try_acquire_or_renew(&api, &config).await {
                    Ok(None) => {}
                    Ok(Some(holder)) => warn!(holder = %holder, "Converge lock taken by another holder"),
                    Err(e) => warn!(error = %e, "Failed to renew converge lock"),
                }
            }
            _ = watch.cancelled() => {
                debug!("Converge lock watch stopped");
                break;
            }
        }
    }
}

struct KubeConvergeUnlocker {
    api: Api<Lease>,
    config: ConvergeLockConfig,
    watch: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    watch_stopped: AtomicBool,
    released: AtomicBool,
}

impl KubeConvergeUnlocker {
    async fn stop_renewing(&self) {
        self.watch.cancel();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Converge lock renew task failed");
            }
        }
    }
}

#[async_trait]
impl ConvergeUnlocker for KubeConvergeUnlocker {
    async fn stop_watch(&self) -> Result<()> {
        if self.watch_stopped.swap(true, Ordering::SeqCst) || self.released.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_renewing().await;

        let patch = serde_json::json!({
            "spec": {
                "renewTime": MicroTime(Utc::now()),
                "leaseDurationSeconds": HELD_WITHOUT_WATCH_TTL.as_secs() as i32
            }
        });
        self.api
            .patch(&self.config.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(lease_name = %self.config.lease_name, "Stopped watching converge lock, lease stays held");
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_renewing().await;

        match self
            .api
            .delete(&self.config.lease_name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!(lease_name = %self.config.lease_name, "Converge lock released");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[path = "lock_test.rs"]
mod tests;
