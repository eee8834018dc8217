use super::{DestroyOutcome, InfraDestroyer, SharedCollaborators};
use crate::cache::{StateCache, StateCacheExt};
use crate::error::{DestroyError, Result};
use crate::infra::{InfraEngine, InfraStep, NodeDestroyRequest};
use crate::meta::{node_index, MetaConfig, MASTER_NODE_GROUP};
use crate::phases::{Phase, PhaseAction};
use crate::state::{
    node_state_backup_key, node_state_key, ClusterState, NodesState, CLUSTER_STATE_KEY,
    NODES_STATE_KEY,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Node groups in destroy order: by name, masters last
pub fn ordered_groups(nodes: &NodesState) -> Vec<String> {
    let mut groups: Vec<String> = nodes.keys().cloned().collect();
    groups.sort_by_key(|g| (g == MASTER_NODE_GROUP, g.clone()));
    groups
}

/// Nodes of a group in destroy order: by index parsed from the name
pub fn ordered_nodes<'a>(names: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut nodes: Vec<String> = names.cloned().collect();
    nodes.sort_by_key(|n| (node_index(n).unwrap_or(u32::MAX), n.clone()));
    nodes
}

/// Destroys cloud nodes, then base infrastructure, through the engine
pub struct CloudInfraDestroyer {
    shared: SharedCollaborators,
    engine: Arc<dyn InfraEngine>,
}

impl CloudInfraDestroyer {
    pub fn new(shared: SharedCollaborators, engine: Arc<dyn InfraEngine>) -> Self {
        Self { shared, engine }
    }

    fn cache(&self) -> &dyn StateCache {
        self.shared.cache.as_ref()
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(DestroyError::Cancelled);
        }
        Ok(())
    }

    #[instrument(skip_all, name = "all_nodes")]
    async fn destroy_nodes(&self, meta: &MetaConfig, nodes_state: &mut NodesState) -> Result<()> {
        for group in ordered_groups(nodes_state) {
            let (settings, names) = match nodes_state.get(&group) {
                Some(g) => (g.settings.clone(), ordered_nodes(g.state.keys())),
                None => continue,
            };
            let step = InfraStep::for_node_group(&group);
            info!(node_group = %group, nodes = names.len(), step = %step, "Destroying node group");

            for name in names {
                self.check_cancelled()?;
                let blob = nodes_state
                    .get(&group)
                    .and_then(|g| g.state.get(&name))
                    .cloned()
                    .unwrap_or_default();
                self.destroy_node(meta, &group, &name, step, &settings, &blob).await?;

                if let Some(g) = nodes_state.get_mut(&group) {
                    g.state.remove(&name);
                    if g.state.is_empty() {
                        nodes_state.remove(&group);
                    }
                }
                self.cache().save_struct(NODES_STATE_KEY, nodes_state)?;
                self.cache().delete(&node_state_key(&name))?;
                self.cache().delete(&node_state_backup_key(&name))?;
                debug!(node = %name, "Node removed from cached state");
            }
        }
        Ok(())
    }

    #[instrument(skip(self, meta, step, settings, blob))]
    async fn destroy_node(
        &self,
        meta: &MetaConfig,
        group: &str,
        name: &str,
        step: InfraStep,
        settings: &[u8],
        blob: &[u8],
    ) -> Result<()> {
        let key = node_state_key(name);
        if !self.cache().in_cache(&key)? {
            self.cache().save(&key, blob)?;
        }
        let current = self.cache().load(&key)?;

        let index = node_index(name).ok_or_else(|| {
            DestroyError::Config(format!("cannot derive node index from node name {name}"))
        })?;

        info!(node = %name, node_group = %group, index, "Destroying node");
        let result = self
            .engine
            .destroy_node(NodeDestroyRequest {
                meta,
                node_group: group,
                node_name: name,
                node_index: index,
                step,
                settings,
                state: &current,
            })
            .await;
        let new_state = match result {
            Ok(state) => state,
            Err(e) => {
                if let Some(partial) = e.partial_state() {
                    self.cache().save(&node_state_backup_key(name), &current)?;
                    self.cache().save(&key, partial)?;
                    warn!(node = %name, "Partial node state saved");
                }
                return Err(e);
            }
        };

        self.cache().save(&node_state_backup_key(name), &current)?;
        self.cache().save(&key, &new_state)?;
        info!(node = %name, "Node destroyed");
        Ok(())
    }

    #[instrument(skip_all, name = "base_infra")]
    async fn destroy_base_infra(&self, meta: &MetaConfig, state: &ClusterState) -> Result<()> {
        self.check_cancelled()?;
        if state.cluster_state.is_empty() {
            warn!("No base infrastructure state in cache, nothing to destroy");
            return Ok(());
        }
        info!("Destroying base infrastructure");
        let new_state = match self.engine.destroy_base_infra(meta, &state.cluster_state).await {
            Ok(new_state) => new_state,
            Err(e) => {
                if let Some(partial) = e.partial_state() {
                    self.cache().save(CLUSTER_STATE_KEY, partial)?;
                    warn!("Partial base infrastructure state saved");
                }
                return Err(e);
            }
        };
        self.cache().save(CLUSTER_STATE_KEY, &new_state)?;
        info!("Base infrastructure destroyed");
        Ok(())
    }
}

#[async_trait]
impl InfraDestroyer for CloudInfraDestroyer {
    fn name(&self) -> &'static str {
        "cloud"
    }

    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn after_resources_delete(&self) -> Result<()> {
        Ok(())
    }

    async fn cleanup_before_destroy(&self) -> Result<()> {
        self.shared.kube.cleanup(true).await;
        Ok(())
    }

    async fn destroy_cluster(&self, _auto_approve: bool) -> Result<DestroyOutcome> {
        let meta = self.shared.loader.populate_meta_config().await?;
        let mut state = self.shared.loader.populate_cluster_state().await?;
        let phases = self.shared.phases.as_ref();
        let has_nodes = state.nodes_state.values().any(|g| !g.state.is_empty());

        let base_action = if has_nodes {
            if phases.start_phase(Phase::AllNodes, true, self.cache())?.should_run() {
                self.destroy_nodes(&meta, &mut state.nodes_state)
                    .await
                    .map_err(|e| e.in_phase(Phase::AllNodes.as_str()))?;
            }
            phases.switch_phase(Phase::BaseInfra, self.cache())?
        } else {
            info!("No nodes in state, skipping node destruction");
            phases.start_phase(Phase::BaseInfra, true, self.cache())?
        };

        match base_action {
            PhaseAction::Stop => return Ok(DestroyOutcome::Stopped),
            PhaseAction::Skip => {}
            PhaseAction::Run => self
                .destroy_base_infra(&meta, &state)
                .await
                .map_err(|e| e.in_phase(Phase::BaseInfra.as_str()))?,
        }
        Ok(DestroyOutcome::Completed)
    }
}
