//! Cluster destruction
//!
//! [`ClusterDestroyer`] drives one destroy run:
//!
//! 1. acquire the converge lease (unless commander mode, skipped resources,
//!    or already locked by a previous run)
//! 2. delete tenant resources (unless already done)
//! 3. cache meta-config and infrastructure state, mark resources deleted
//! 4. point of no return: stop watching the lease, stop talking to the API
//! 5. destroy infrastructure with the cloud or static variant
//! 6. close the cache
//!
//! Every step either finishes and leaves a marker in the cache or fails
//! without one, so a rerun resumes where the previous one stopped.

mod cloud;
pub mod state;
mod static_infra;

pub use cloud::CloudInfraDestroyer;
pub use state::DestroyState;
pub use static_infra::{StaticInfraDestroyer, StaticLoops, CLEANUP_COMMAND, DISCOVERED_NODE_IP_PATH};

use crate::cache::StateCache;
use crate::converge::{ConvergeLocker, ConvergeUnlocker};
use crate::error::{DestroyError, Result};
use crate::infra::InfraEngine;
use crate::kubernetes::{ErrorKubeProvider, KubeClientProvider};
use crate::meta::{ClusterType, MetaConfig};
use crate::nodeuser::NodeUserClient;
use crate::phases::PhasedExecutionContext;
use crate::resources::TenantResourcesDestroyer;
use crate::ssh::SshProvider;
use crate::state::{InitializedStateLoader, StateLoader};
use async_trait::async_trait;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const CONFIRMATION_PROMPT: &str = "Do you really want to DELETE all cluster resources?";

/// How a destroy run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    Completed,
    /// Stopped after the requested phase; the cache is kept for the next run
    Stopped,
}

/// Infrastructure half of a destroy, one implementation per cluster type
#[async_trait]
pub trait InfraDestroyer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs before tenant resources are deleted, while the API is up
    async fn prepare(&self) -> Result<()>;

    async fn after_resources_delete(&self) -> Result<()>;

    /// Point of no return: release what talks to the cluster API
    async fn cleanup_before_destroy(&self) -> Result<()>;

    async fn destroy_cluster(&self, auto_approve: bool) -> Result<DestroyOutcome>;
}

/// Asks the operator before anything is deleted
pub trait Confirmation: Send + Sync {
    fn confirm(&self, message: &str) -> bool;
}

/// Reads a yes/no answer from stdin
pub struct StdinConfirmation;

impl Confirmation for StdinConfirmation {
    fn confirm(&self, message: &str) -> bool {
        eprint!("{message} [y/N]: ");
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        is_yes(&answer)
    }
}

pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Collaborators shared by the top-level destroyer and the infra variants
#[derive(Clone)]
pub struct SharedCollaborators {
    pub cache: Arc<dyn StateCache>,
    pub loader: Arc<dyn StateLoader>,
    pub kube: Arc<dyn KubeClientProvider>,
    pub ssh: Option<Arc<dyn SshProvider>>,
    pub phases: Arc<PhasedExecutionContext>,
    pub cancel: CancellationToken,
}

/// Kubernetes providers of one run
///
/// Tenant resources are always deleted through the live API. The infra
/// half gets the provider the state loader picked, which refuses every
/// call when state comes from the cache or from commander input.
#[derive(Clone)]
pub struct KubeProviders {
    pub resources: Arc<dyn KubeClientProvider>,
    pub infra: Arc<dyn KubeClientProvider>,
}

impl KubeProviders {
    pub fn new(live: Arc<dyn KubeClientProvider>, init: &InitializedStateLoader) -> Self {
        Self {
            resources: live,
            infra: init.kube_provider.clone(),
        }
    }
}

pub trait InfraDestroyerFactory: Send + Sync {
    fn create(&self, meta: &MetaConfig, shared: &SharedCollaborators) -> Result<Arc<dyn InfraDestroyer>>;
}

/// Builds [`CloudInfraDestroyer`] or [`StaticInfraDestroyer`] by cluster type
pub struct DefaultInfraDestroyerFactory {
    pub engine: Arc<dyn InfraEngine>,
    pub node_users: Arc<dyn NodeUserClient>,
    /// Scratch directory for converger keys
    pub tmp_dir: PathBuf,
    pub static_loops: StaticLoops,
}

impl InfraDestroyerFactory for DefaultInfraDestroyerFactory {
    fn create(&self, meta: &MetaConfig, shared: &SharedCollaborators) -> Result<Arc<dyn InfraDestroyer>> {
        match &meta.cluster_type {
            ClusterType::Cloud => Ok(Arc::new(CloudInfraDestroyer::new(
                shared.clone(),
                self.engine.clone(),
            ))),
            ClusterType::Static => {
                let ssh = shared.ssh.clone().ok_or_else(|| {
                    DestroyError::Precondition("static cluster destroy requires ssh".to_string())
                })?;
                Ok(Arc::new(
                    StaticInfraDestroyer::new(shared.clone(), ssh, self.node_users.clone(), &self.tmp_dir)
                        .with_loops(self.static_loops.clone()),
                ))
            }
            ClusterType::Invalid(raw) => Err(DestroyError::Config(format!(
                "unknown cluster type {raw:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DestroyOptions {
    pub commander_mode: bool,
    pub skip_resources: bool,
}

pub struct ClusterDestroyer {
    shared: SharedCollaborators,
    state: DestroyState,
    resources: Arc<dyn TenantResourcesDestroyer>,
    locker: Arc<dyn ConvergeLocker>,
    factory: Arc<dyn InfraDestroyerFactory>,
    confirmation: Arc<dyn Confirmation>,
    options: DestroyOptions,
    abort: bool,
}

impl ClusterDestroyer {
    pub fn new(
        shared: SharedCollaborators,
        resources: Arc<dyn TenantResourcesDestroyer>,
        locker: Arc<dyn ConvergeLocker>,
        factory: Arc<dyn InfraDestroyerFactory>,
        confirmation: Arc<dyn Confirmation>,
        options: DestroyOptions,
    ) -> Self {
        Self {
            state: DestroyState::new(shared.cache.clone()),
            shared,
            resources,
            locker,
            factory,
            confirmation,
            options,
            abort: false,
        }
    }

    /// Destroyer for a cluster whose API never came up
    ///
    /// Runs from cached state only: no converge lock, no infra prepare, no
    /// tenant resource deletion, and the Kubernetes API is never contacted.
    pub fn abort(
        mut shared: SharedCollaborators,
        resources: Arc<dyn TenantResourcesDestroyer>,
        locker: Arc<dyn ConvergeLocker>,
        factory: Arc<dyn InfraDestroyerFactory>,
        confirmation: Arc<dyn Confirmation>,
        options: DestroyOptions,
    ) -> Self {
        shared.kube = Arc::new(ErrorKubeProvider::new("aborting bootstrap", shared.ssh.clone()));
        let mut destroyer = Self::new(shared, resources, locker, factory, confirmation, options);
        destroyer.abort = true;
        destroyer
    }

    pub fn is_abort(&self) -> bool {
        self.abort
    }

    async fn lock_converge(&self) -> Result<Option<Arc<dyn ConvergeUnlocker>>> {
        if self.options.commander_mode {
            debug!("Converge lock skipped in commander mode");
            return Ok(None);
        }
        if self.options.skip_resources {
            debug!("Converge lock skipped, resources are not deleted");
            return Ok(None);
        }
        if self.state.is_converge_locked()? {
            info!("Converge was locked by a previous run");
            return Ok(None);
        }

        let unlocker = self.locker.lock(self.shared.kube.clone()).await?;
        if let Err(e) = self.state.set_converge_locked() {
            if let Err(release) = unlocker.release().await {
                warn!(error = %release, "Failed to release converge lock");
            }
            return Err(e);
        }
        Ok(Some(unlocker))
    }

    #[instrument(skip(self), fields(abort = self.abort))]
    pub async fn destroy_cluster(&self, auto_approve: bool) -> Result<DestroyOutcome> {
        if !auto_approve && !self.confirmation.confirm(CONFIRMATION_PROMPT) {
            info!("Destroy was not confirmed");
            return Err(DestroyError::Cancelled);
        }

        let cache = self.shared.cache.as_ref();
        self.shared.phases.init_pipeline(cache)?;

        let meta = self.shared.loader.populate_meta_config().await?;
        let infra = self.factory.create(&meta, &self.shared)?;
        info!(
            variant = infra.name(),
            cluster_type = %meta.cluster_type,
            abort = self.abort,
            "Destroying cluster"
        );

        let unlocker = if self.abort {
            None
        } else {
            let unlocker = self.lock_converge().await?;
            infra.prepare().await.map_err(|e| e.in_phase("Prepare"))?;
            unlocker
        };

        if self.abort || self.options.skip_resources {
            debug!("Tenant resource deletion skipped");
        } else if self.state.is_resources_deleted()? {
            info!("Tenant resources were deleted by a previous run");
        } else {
            self.resources
                .delete_resources()
                .await
                .map_err(|e| e.in_phase("DeleteResources"))?;
            infra.after_resources_delete().await?;
        }

        // The cache is authoritative from here on
        self.shared.loader.populate_meta_config().await?;
        self.shared.loader.populate_cluster_state().await?;
        self.state.set_resources_deleted()?;

        if let Some(unlocker) = &unlocker {
            if let Err(e) = unlocker.stop_watch().await {
                warn!(error = %e, "Failed to stop watching converge lock");
            }
        }
        infra.cleanup_before_destroy().await?;

        let outcome = infra.destroy_cluster(auto_approve).await?;
        if let Some(ssh) = &self.shared.ssh {
            ssh.stop();
        }

        if outcome == DestroyOutcome::Stopped {
            info!("Destroy stopped on request, state is kept for the next run");
            return Ok(outcome);
        }

        self.shared.phases.complete_phase(cache)?;
        self.state.clean()?;
        info!("Cluster destroyed");
        Ok(DestroyOutcome::Completed)
    }
}

#[cfg(test)]
#[path = "destroy_test.rs"]
mod tests;
