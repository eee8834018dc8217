//! Destroy markers kept in the state cache
//!
//! Each marker records a checkpoint that a restarted run must not repeat.

use crate::cache::{StateCache, StateCacheExt};
use crate::error::Result;
use crate::nodeuser::NodesWithCredentials;
use std::sync::Arc;
use tracing::{debug, warn};

/// Written once every tenant-resource wave finished and the state was cached
pub const RESOURCES_DELETED_KEY: &str = "resources-were-deleted";
/// Written once the converge lease was acquired
pub const CONVERGE_LOCKED_KEY: &str = "converge-locked";
pub const NODE_USER_KEY: &str = "node-user";
pub const NODE_USER_EXISTS_KEY: &str = "node-user-exists";
/// SSH hosts the static destroyer was started with
pub const CLUSTER_HOSTS_KEY: &str = "cluster-hosts";

const MARKER: &[u8] = b"yes";

#[derive(Clone)]
pub struct DestroyState {
    cache: Arc<dyn StateCache>,
}

impl DestroyState {
    pub fn new(cache: Arc<dyn StateCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<dyn StateCache> {
        &self.cache
    }

    fn marker(&self, key: &str) -> Result<bool> {
        Ok(self.cache.in_cache(key)?)
    }

    fn set_marker(&self, key: &str) -> Result<()> {
        self.cache.save(key, MARKER)?;
        debug!(marker = %key, "Marker saved");
        Ok(())
    }

    pub fn is_resources_deleted(&self) -> Result<bool> {
        self.marker(RESOURCES_DELETED_KEY)
    }

    pub fn set_resources_deleted(&self) -> Result<()> {
        self.set_marker(RESOURCES_DELETED_KEY)
    }

    pub fn is_converge_locked(&self) -> Result<bool> {
        self.marker(CONVERGE_LOCKED_KEY)
    }

    pub fn set_converge_locked(&self) -> Result<()> {
        self.set_marker(CONVERGE_LOCKED_KEY)
    }

    pub fn is_node_user_exists(&self) -> Result<bool> {
        self.marker(NODE_USER_EXISTS_KEY)
    }

    pub fn set_node_user_exists(&self) -> Result<()> {
        self.set_marker(NODE_USER_EXISTS_KEY)
    }

    /// Cached node user; an undecodable entry counts as absent
    pub fn node_user(&self) -> Result<Option<NodesWithCredentials>> {
        match self.cache.load_struct_opt(NODE_USER_KEY) {
            Ok(found) => Ok(found),
            Err(e) if e.is_decode() => {
                warn!(error = %e, "Cached node user is corrupt, it will be regenerated");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_node_user(&self, nodes: &NodesWithCredentials) -> Result<()> {
        Ok(self.cache.save_struct(NODE_USER_KEY, nodes)?)
    }

    pub fn cluster_hosts(&self) -> Result<Vec<String>> {
        match self.cache.load_struct_opt::<Vec<String>>(CLUSTER_HOSTS_KEY) {
            Ok(hosts) => Ok(hosts.unwrap_or_default()),
            Err(e) if e.is_decode() => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_cluster_hosts(&self, hosts: &[String]) -> Result<()> {
        Ok(self.cache.save_struct(CLUSTER_HOSTS_KEY, &hosts)?)
    }

    /// Close the cache for good, leaving only the tombstone
    pub fn clean(&self) -> Result<()> {
        Ok(self.cache.clean()?)
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
