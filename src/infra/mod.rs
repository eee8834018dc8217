//! Infrastructure engine contract
//!
//! The engine is opaque to the destroy pipeline: it gets the current state
//! blob of a node (or of the base infrastructure), destroys what it
//! describes, and hands back the resulting state.

mod terraform;

pub use terraform::TerraformEngine;

use crate::error::Result;
use crate::meta::MetaConfig;
use async_trait::async_trait;
use std::fmt;

/// Engine module used for a destroy step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfraStep {
    MasterNode,
    StaticNode,
    BaseInfrastructure,
}

impl InfraStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfraStep::MasterNode => "master-node",
            InfraStep::StaticNode => "static-node",
            InfraStep::BaseInfrastructure => "base-infrastructure",
        }
    }

    /// Step for nodes of `node_group`
    pub fn for_node_group(node_group: &str) -> Self {
        if node_group == crate::meta::MASTER_NODE_GROUP {
            InfraStep::MasterNode
        } else {
            InfraStep::StaticNode
        }
    }
}

impl fmt::Display for InfraStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node to destroy
#[derive(Debug, Clone, Copy)]
pub struct NodeDestroyRequest<'a> {
    pub meta: &'a MetaConfig,
    pub node_group: &'a str,
    pub node_name: &'a str,
    pub node_index: u32,
    pub step: InfraStep,
    /// Node group settings from the nodes state
    pub settings: &'a [u8],
    pub state: &'a [u8],
}

#[async_trait]
pub trait InfraEngine: Send + Sync {
    /// Destroy one node and return its state afterwards
    async fn destroy_node(&self, request: NodeDestroyRequest<'_>) -> Result<Vec<u8>>;

    /// Destroy the base infrastructure and return its state afterwards
    async fn destroy_base_infra(&self, meta: &MetaConfig, state: &[u8]) -> Result<Vec<u8>>;
}

#[cfg(test)]
#[path = "infra_test.rs"]
mod tests;
