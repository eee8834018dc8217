use super::{CachedStateLoader, ClusterState, LiveStateLoader, StateLoader};
use crate::cache::StateCache;
use crate::destroy::state::RESOURCES_DELETED_KEY;
use crate::error::{ErrorKind, Result};
use crate::meta::MetaConfig;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Live on first call, cached afterwards
///
/// Once tenant resources are gone the cache is authoritative: the wrapper
/// never consults the cluster again, even if it still answers.
pub struct LazyStateLoader {
    live: LiveStateLoader,
    cached: CachedStateLoader,
    cache: Arc<dyn StateCache>,
    meta_loaded: AtomicBool,
    state_loaded: AtomicBool,
}

impl LazyStateLoader {
    pub fn new(live: LiveStateLoader, cache: Arc<dyn StateCache>) -> Self {
        Self {
            live,
            cached: CachedStateLoader::new(cache.clone()),
            cache,
            meta_loaded: AtomicBool::new(false),
            state_loaded: AtomicBool::new(false),
        }
    }

    fn resources_deleted(&self) -> bool {
        self.cache.in_cache(RESOURCES_DELETED_KEY).unwrap_or(false)
    }

    fn use_cache(&self, loaded: &AtomicBool) -> bool {
        self.resources_deleted() || loaded.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateLoader for LazyStateLoader {
    async fn populate_meta_config(&self) -> Result<MetaConfig> {
        if self.use_cache(&self.meta_loaded) {
            match self.cached.populate_meta_config().await {
                Ok(meta) => return Ok(meta),
                // A broken cached copy is replaced from the cluster while it is still there
                Err(e)
                    if !self.resources_deleted()
                        && matches!(e.kind(), ErrorKind::Config | ErrorKind::Cache) =>
                {
                    warn!(error = %e, "Cached cluster configuration unusable, reloading from cluster");
                }
                Err(e) => return Err(e),
            }
        }

        debug!("Loading cluster configuration from cluster");
        let meta = self.live.populate_meta_config().await?;
        self.meta_loaded.store(true, Ordering::SeqCst);
        Ok(meta)
    }

    async fn populate_cluster_state(&self) -> Result<ClusterState> {
        if self.use_cache(&self.state_loaded) {
            return self.cached.populate_cluster_state().await;
        }

        debug!("Loading infrastructure state from cluster");
        let state = self.live.populate_cluster_state().await?;
        self.state_loaded.store(true, Ordering::SeqCst);
        Ok(state)
    }
}
