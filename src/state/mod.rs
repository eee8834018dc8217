//! Cluster state loaders
//!
//! A [`StateLoader`] yields the cluster meta-configuration and the
//! infrastructure-engine state for base infrastructure and every node.
//!
//! - [`LiveStateLoader`]: reads the well-known secrets from the cluster
//! - [`CachedStateLoader`]: reads what a previous load put into the cache
//! - [`CommanderStateLoader`]: configuration supplied up front by an orchestrator
//! - [`LazyStateLoader`]: live on first use, cached afterwards
//!
//! [`init_state_loader`] picks the loader and the Kubernetes provider the
//! infra destroyer should use.

mod cached;
mod lazy;
mod live;

pub use cached::{CachedStateLoader, CommanderParams, CommanderStateLoader};
pub use lazy::LazyStateLoader;
pub use live::{ClusterConfigSource, KubeConfigSource, LiveStateLoader};

use crate::cache::{StateCache, StateCacheExt};
use crate::error::Result;
use crate::kubernetes::{ErrorKubeProvider, KubeClientProvider};
use crate::meta::{MetaConfig, MetaConfigSnapshot};
use crate::ssh::SshProvider;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const CLUSTER_CONFIG_KEY: &str = "cluster-config";
pub const CLUSTER_STATE_KEY: &str = "cluster-state";
pub const NODES_STATE_KEY: &str = "nodes-state";
pub const UUID_KEY: &str = "uuid";

/// Cache key holding the engine state of one node
pub fn node_state_key(node_name: &str) -> String {
    format!("{node_name}.tfstate")
}

/// Cache key holding the previous engine state of one node
pub fn node_state_backup_key(node_name: &str) -> String {
    format!("{node_name}.tfstate.backup")
}

/// Engine state of one node group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupState {
    /// Provider-specific template inputs for the group
    pub settings: Vec<u8>,
    /// Node name to engine state
    pub state: BTreeMap<String, Vec<u8>>,
}

/// Node group name to its state
pub type NodesState = BTreeMap<String, NodeGroupState>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterState {
    /// Engine state of the base infrastructure
    pub cluster_state: Vec<u8>,
    pub nodes_state: NodesState,
}

#[async_trait]
pub trait StateLoader: Send + Sync {
    async fn populate_meta_config(&self) -> Result<MetaConfig>;

    async fn populate_cluster_state(&self) -> Result<ClusterState>;
}

/// Put a freshly loaded state into the cache
///
/// Per-node keys are only written when absent: an existing key may hold a
/// newer state written by the engine during an interrupted run.
pub(crate) fn cache_cluster_state(cache: &dyn StateCache, state: &ClusterState) -> Result<()> {
    cache.save(CLUSTER_STATE_KEY, &state.cluster_state)?;
    cache.save_struct(NODES_STATE_KEY, &state.nodes_state)?;
    for group in state.nodes_state.values() {
        for (node, blob) in &group.state {
            let key = node_state_key(node);
            if !cache.in_cache(&key)? {
                cache.save(&key, blob)?;
            }
        }
    }
    Ok(())
}

pub(crate) fn cache_meta_config(cache: &dyn StateCache, meta: &MetaConfig) -> Result<()> {
    cache.save_struct(CLUSTER_CONFIG_KEY, meta.snapshot())?;
    if !meta.uuid.is_empty() {
        cache.save(UUID_KEY, meta.uuid.as_bytes())?;
    }
    Ok(())
}

/// Whether the cache holds a meta-config snapshot that still parses
pub fn cache_has_meta_config(cache: &dyn StateCache) -> bool {
    match cache.load_struct_opt::<MetaConfigSnapshot>(CLUSTER_CONFIG_KEY) {
        Ok(Some(snapshot)) => match MetaConfig::from_snapshot(&snapshot) {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Cached cluster configuration is invalid");
                false
            }
        },
        Ok(None) => false,
        Err(e) => {
            warn!(error = %e, "Cached cluster configuration is unreadable");
            false
        }
    }
}

pub struct StateLoaderParams {
    pub commander_mode: bool,
    pub commander_params: Option<CommanderParams>,
    pub cache: Arc<dyn StateCache>,
    pub skip_resources: bool,
    /// Treat the cluster as unreachable without probing it
    pub force_from_cache: bool,
}

/// Loader plus the Kubernetes provider the infra destroyer must use with it
pub struct InitializedStateLoader {
    pub loader: Arc<dyn StateLoader>,
    pub kube_provider: Arc<dyn KubeClientProvider>,
    pub from_cache: bool,
}

/// Pick a state loader
///
/// - commander mode: commander loader with an erroring kube provider
/// - cached meta-config and (skip resources or cluster unreachable):
///   cached loader with an erroring kube provider
/// - otherwise: lazy loader over the live cluster with `kube_provider`
pub async fn init_state_loader(
    params: StateLoaderParams,
    kube_provider: Arc<dyn KubeClientProvider>,
    ssh: Option<Arc<dyn SshProvider>>,
) -> Result<InitializedStateLoader> {
    let source = Arc::new(KubeConfigSource::new(kube_provider.clone()));
    init_state_loader_with_source(params, kube_provider, ssh, source).await
}

/// [`init_state_loader`] with an explicit live configuration source
pub async fn init_state_loader_with_source(
    params: StateLoaderParams,
    kube_provider: Arc<dyn KubeClientProvider>,
    ssh: Option<Arc<dyn SshProvider>>,
    source: Arc<dyn ClusterConfigSource>,
) -> Result<InitializedStateLoader> {
    let cache = params.cache;

    if params.commander_mode {
        let commander = params.commander_params.ok_or_else(|| {
            crate::error::DestroyError::Precondition(
                "commander mode requires cluster configuration".to_string(),
            )
        })?;
        info!("Commander mode: using supplied configuration and cached state");
        return Ok(InitializedStateLoader {
            loader: Arc::new(CommanderStateLoader::new(commander, cache)),
            kube_provider: Arc::new(ErrorKubeProvider::new("commander mode", ssh)),
            from_cache: true,
        });
    }

    if cache_has_meta_config(cache.as_ref()) {
        let use_cache = if params.skip_resources {
            info!("Resources are skipped and configuration is cached");
            true
        } else if params.force_from_cache {
            info!("Loading state from cache as requested");
            true
        } else if !kube_provider.is_reachable().await {
            warn!("Cluster is unreachable, loading state from cache");
            true
        } else {
            false
        };

        if use_cache {
            return Ok(InitializedStateLoader {
                loader: Arc::new(CachedStateLoader::new(cache)),
                kube_provider: Arc::new(ErrorKubeProvider::new("state is loaded from cache", ssh)),
                from_cache: true,
            });
        }
    }

    let live = LiveStateLoader::new(source, cache.clone());
    Ok(InitializedStateLoader {
        loader: Arc::new(LazyStateLoader::new(live, cache)),
        kube_provider,
        from_cache: false,
    })
}

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
