//! Cluster meta-configuration
//!
//! Parsed view of the bootstrap configuration stored in the cluster:
//! `ClusterConfiguration`, the provider-specific `<Provider>ClusterConfiguration`
//! (cloud clusters only) and the cluster UUID. Immutable after parsing.

use crate::error::{DestroyError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the control-plane node group
pub const MASTER_NODE_GROUP: &str = "master";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterType {
    Cloud,
    Static,
    /// Anything else found in `clusterType`
    Invalid(String),
}

impl ClusterType {
    fn parse(raw: &str) -> Self {
        match raw {
            "Cloud" => ClusterType::Cloud,
            "Static" => ClusterType::Static,
            other => ClusterType::Invalid(other.to_string()),
        }
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterType::Cloud => f.write_str("Cloud"),
            ClusterType::Static => f.write_str("Static"),
            ClusterType::Invalid(raw) => write!(f, "{raw:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudSpec {
    pub provider: String,
    pub prefix: String,
}

/// `ClusterConfiguration` document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfiguration {
    pub api_version: String,
    pub kind: String,
    pub cluster_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudSpec>,
    pub kubernetes_version: String,
    #[serde(rename = "podSubnetCIDR")]
    pub pod_subnet_cidr: String,
    #[serde(rename = "serviceSubnetCIDR")]
    pub service_subnet_cidr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_algorithm: Option<String>,
    #[serde(default, rename = "defaultCRI", skip_serializing_if = "Option::is_none")]
    pub default_cri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_domain: Option<String>,
    #[serde(default, rename = "podSubnetNodeCIDRPrefix", skip_serializing_if = "Option::is_none")]
    pub pod_subnet_node_cidr_prefix: Option<String>,
}

/// Raw documents a [`MetaConfig`] is built from; this is what gets cached
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaConfigSnapshot {
    pub cluster_configuration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_cluster_configuration: Option<String>,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetaConfig {
    pub cluster_type: ClusterType,
    pub uuid: String,
    pub cluster_config: ClusterConfiguration,
    /// Provider configuration as a generic document
    pub provider_cluster_config: Option<serde_json::Value>,
    pub provider_name: String,
    pub cluster_prefix: String,
    pub layout: String,
    snapshot: MetaConfigSnapshot,
}

impl MetaConfig {
    /// Parse cluster and provider configuration YAML
    ///
    /// # Arguments
    /// * `cluster_yaml` - `ClusterConfiguration` document
    /// * `provider_yaml` - provider configuration; required for cloud clusters
    /// * `uuid` - cluster UUID, may be empty before the cluster is fully up
    pub fn parse(cluster_yaml: &str, provider_yaml: Option<&str>, uuid: &str) -> Result<Self> {
        let cluster_config: ClusterConfiguration = serde_yaml::from_str(cluster_yaml)
            .map_err(|e| DestroyError::Config(format!("cannot parse ClusterConfiguration: {e}")))?;

        if cluster_config.kind != "ClusterConfiguration" {
            return Err(DestroyError::Config(format!(
                "expected kind ClusterConfiguration, got {}",
                cluster_config.kind
            )));
        }

        let cluster_type = ClusterType::parse(&cluster_config.cluster_type);

        let provider_cluster_config = match provider_yaml.map(str::trim) {
            Some(doc) if !doc.is_empty() => {
                let value: serde_json::Value = serde_yaml::from_str(doc).map_err(|e| {
                    DestroyError::Config(format!("cannot parse provider cluster configuration: {e}"))
                })?;
                Some(value)
            }
            _ => None,
        };

        let (provider_name, cluster_prefix, layout) = match cluster_type {
            ClusterType::Cloud => {
                let cloud = cluster_config.cloud.as_ref().ok_or_else(|| {
                    DestroyError::Config("cloud cluster without cloud section".to_string())
                })?;
                let provider_config = provider_cluster_config.as_ref().ok_or_else(|| {
                    DestroyError::Config(
                        "provider cluster configuration is required for cloud clusters".to_string(),
                    )
                })?;
                let layout = provider_config
                    .get("layout")
                    .and_then(|l| l.as_str())
                    .ok_or_else(|| {
                        DestroyError::Config("provider configuration has no layout".to_string())
                    })?;
                (
                    cloud.provider.to_lowercase(),
                    cloud.prefix.clone(),
                    kebab_case(layout),
                )
            }
            _ => (String::new(), String::new(), String::new()),
        };

        Ok(Self {
            cluster_type,
            uuid: uuid.to_string(),
            cluster_config,
            provider_cluster_config,
            provider_name,
            cluster_prefix,
            layout,
            snapshot: MetaConfigSnapshot {
                cluster_configuration: cluster_yaml.to_string(),
                provider_cluster_configuration: provider_yaml.map(str::to_string),
                uuid: uuid.to_string(),
            },
        })
    }

    pub fn from_snapshot(snapshot: &MetaConfigSnapshot) -> Result<Self> {
        Self::parse(
            &snapshot.cluster_configuration,
            snapshot.provider_cluster_configuration.as_deref(),
            &snapshot.uuid,
        )
    }

    pub fn snapshot(&self) -> &MetaConfigSnapshot {
        &self.snapshot
    }

    pub fn is_cloud(&self) -> bool {
        self.cluster_type == ClusterType::Cloud
    }

    pub fn kubernetes_version(&self) -> &str {
        &self.cluster_config.kubernetes_version
    }

    /// Replica count of the master node group in provider configuration
    pub fn master_replicas(&self) -> Option<u64> {
        self.provider_cluster_config
            .as_ref()?
            .get("masterNodeGroup")?
            .get("replicas")?
            .as_u64()
    }

    /// Variables handed to the infrastructure engine
    pub fn engine_variables(&self, node_group: Option<(&str, u32, &[u8])>) -> serde_json::Value {
        let cluster = serde_json::to_value(&self.cluster_config).unwrap_or(serde_json::Value::Null);
        let mut vars = serde_json::json!({
            "clusterConfiguration": cluster,
            "providerClusterConfiguration": self.provider_cluster_config.clone().unwrap_or(serde_json::Value::Null),
            "clusterUUID": self.uuid,
        });
        if let Some((name, index, settings)) = node_group {
            let settings: serde_json::Value =
                serde_json::from_slice(settings).unwrap_or(serde_json::Value::Null);
            vars["nodeGroupName"] = serde_json::Value::String(name.to_string());
            vars["nodeIndex"] = serde_json::Value::from(index);
            vars["nodeGroupSettings"] = settings;
        }
        vars
    }
}

/// `WithoutNAT` -> `without-nat`, the way layout directories are named
pub fn kebab_case(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let mut out = String::with_capacity(value.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c == '_' || c == ' ' {
            out.push('-');
            continue;
        }
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower) {
                out.push('-');
            }
        }
        out.extend(c.to_lowercase());
    }
    out
}

/// Index of a node named `<prefix>-<group>-<index>`
pub fn node_index(node_name: &str) -> Option<u32> {
    node_name.rsplit('-').next()?.parse().ok()
}

#[cfg(test)]
#[path = "meta_test.rs"]
mod tests;
