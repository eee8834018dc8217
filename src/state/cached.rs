use super::{
    cache_meta_config, node_state_key, ClusterState, NodesState, StateLoader, CLUSTER_CONFIG_KEY,
    CLUSTER_STATE_KEY, NODES_STATE_KEY, UUID_KEY,
};
use crate::cache::{CacheError, StateCache, StateCacheExt};
use crate::error::{DestroyError, Result};
use crate::meta::{MetaConfig, MetaConfigSnapshot};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Read the cached state, preferring per-node keys over the `nodes-state` copy
fn load_cached_cluster_state(cache: &dyn StateCache) -> Result<ClusterState> {
    let cluster_state = match cache.load(CLUSTER_STATE_KEY) {
        Ok(bytes) => bytes,
        Err(CacheError::NotFound(_)) => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let mut nodes_state: NodesState = cache.load_struct_opt(NODES_STATE_KEY)?.unwrap_or_default();
    for group in nodes_state.values_mut() {
        for (node, blob) in group.state.iter_mut() {
            match cache.load(&node_state_key(node)) {
                Ok(newer) => *blob = newer,
                Err(CacheError::NotFound(_)) => {
                    // Keep the two views consistent for the destroyers
                    cache.save(&node_state_key(node), blob)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(ClusterState {
        cluster_state,
        nodes_state,
    })
}

/// Serves everything from the cache
pub struct CachedStateLoader {
    cache: Arc<dyn StateCache>,
}

impl CachedStateLoader {
    pub fn new(cache: Arc<dyn StateCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl StateLoader for CachedStateLoader {
    async fn populate_meta_config(&self) -> Result<MetaConfig> {
        let snapshot: MetaConfigSnapshot = self
            .cache
            .load_struct_opt(CLUSTER_CONFIG_KEY)?
            .ok_or_else(|| DestroyError::Config("no cluster configuration in cache".to_string()))?;
        let meta = MetaConfig::from_snapshot(&snapshot)?;
        debug!(cluster_type = %meta.cluster_type, "Loaded cluster configuration from cache");
        Ok(meta)
    }

    async fn populate_cluster_state(&self) -> Result<ClusterState> {
        load_cached_cluster_state(self.cache.as_ref())
    }
}

/// Configuration handed over by an outer orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommanderParams {
    pub cluster_configuration: String,
    pub provider_cluster_configuration: Option<String>,
}

/// Commander-mode loader: configuration from the caller, state from the cache
pub struct CommanderStateLoader {
    params: CommanderParams,
    cache: Arc<dyn StateCache>,
}

impl CommanderStateLoader {
    pub fn new(params: CommanderParams, cache: Arc<dyn StateCache>) -> Self {
        Self { params, cache }
    }
}

#[async_trait]
impl StateLoader for CommanderStateLoader {
    async fn populate_meta_config(&self) -> Result<MetaConfig> {
        let uuid = match self.cache.load(UUID_KEY) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).trim().to_string(),
            Err(CacheError::NotFound(_)) => String::new(),
            Err(e) => return Err(e.into()),
        };
        let meta = MetaConfig::parse(
            &self.params.cluster_configuration,
            self.params.provider_cluster_configuration.as_deref(),
            &uuid,
        )?;
        cache_meta_config(self.cache.as_ref(), &meta)?;
        info!(cluster_type = %meta.cluster_type, "Using cluster configuration supplied by commander");
        Ok(meta)
    }

    async fn populate_cluster_state(&self) -> Result<ClusterState> {
        load_cached_cluster_state(self.cache.as_ref())
    }
}
