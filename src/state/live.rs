use super::{
    cache_cluster_state, cache_meta_config, ClusterState, NodeGroupState, NodesState, StateLoader,
};
use crate::cache::StateCache;
use crate::error::{DestroyError, Result};
use crate::kubernetes::KubeClientProvider;
use crate::meta::MetaConfig;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, ListParams};
use std::sync::Arc;
use tracing::{debug, info};

const KUBE_SYSTEM: &str = "kube-system";
const D8_SYSTEM: &str = "d8-system";

const CLUSTER_CONFIG_SECRET: &str = "d8-cluster-configuration";
const CLUSTER_CONFIG_DATA_KEY: &str = "cluster-configuration.yaml";
const PROVIDER_CONFIG_SECRET: &str = "d8-provider-cluster-configuration";
const PROVIDER_CONFIG_DATA_KEY: &str = "cloud-provider-cluster-configuration.yaml";
const UUID_CONFIGMAP: &str = "d8-cluster-uuid";
const UUID_DATA_KEY: &str = "cluster-uuid";

const CLUSTER_STATE_SECRET: &str = "d8-cluster-terraform-state";
const CLUSTER_STATE_DATA_KEY: &str = "cluster-tf-state.json";
const NODE_STATE_SECRET_PREFIX: &str = "d8-node-terraform-state-";
const NODE_STATE_DATA_KEY: &str = "node-tf-state";
const NODE_GROUP_SETTINGS_DATA_KEY: &str = "node-group-settings.json";
const NODE_STATE_LABEL: &str = "node.deckhouse.io/terraform-state";
const NODE_GROUP_LABEL: &str = "node.deckhouse.io/node-group";

/// Where the live loader reads cluster configuration and engine state from
#[async_trait]
pub trait ClusterConfigSource: Send + Sync {
    async fn cluster_configuration(&self) -> Result<String>;

    async fn provider_cluster_configuration(&self) -> Result<Option<String>>;

    /// Cluster UUID, empty if the cluster never recorded one
    async fn cluster_uuid(&self) -> Result<String>;

    async fn nodes_infra_state(&self) -> Result<NodesState>;

    /// Base infrastructure state, empty for static clusters
    async fn cluster_infra_state(&self) -> Result<Vec<u8>>;
}

/// Reads configuration from secrets and configmaps in the cluster
pub struct KubeConfigSource {
    provider: Arc<dyn KubeClientProvider>,
}

impl KubeConfigSource {
    pub fn new(provider: Arc<dyn KubeClientProvider>) -> Self {
        Self { provider }
    }

    async fn secret_data(&self, namespace: &str, name: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let client = self.provider.kube_client().await?;
        let api: Api<Secret> = Api::namespaced(client, namespace);
        let secret = match api.get_opt(name).await? {
            Some(secret) => secret,
            None => {
                debug!(namespace, secret = name, "Secret not found");
                return Ok(None);
            }
        };
        Ok(secret
            .data
            .and_then(|mut data| data.remove(key))
            .map(|bytes| bytes.0))
    }
}

fn utf8(bytes: Vec<u8>, what: &str) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| DestroyError::Config(format!("{what} is not UTF-8: {e}")))
}

#[async_trait]
impl ClusterConfigSource for KubeConfigSource {
    async fn cluster_configuration(&self) -> Result<String> {
        let data = self
            .secret_data(KUBE_SYSTEM, CLUSTER_CONFIG_SECRET, CLUSTER_CONFIG_DATA_KEY)
            .await?
            .ok_or_else(|| {
                DestroyError::Config(format!(
                    "secret {KUBE_SYSTEM}/{CLUSTER_CONFIG_SECRET} has no {CLUSTER_CONFIG_DATA_KEY}"
                ))
            })?;
        utf8(data, "cluster configuration")
    }

    async fn provider_cluster_configuration(&self) -> Result<Option<String>> {
        self.secret_data(KUBE_SYSTEM, PROVIDER_CONFIG_SECRET, PROVIDER_CONFIG_DATA_KEY)
            .await?
            .map(|data| utf8(data, "provider cluster configuration"))
            .transpose()
    }

    async fn cluster_uuid(&self) -> Result<String> {
        let client = self.provider.kube_client().await?;
        let api: Api<ConfigMap> = Api::namespaced(client, KUBE_SYSTEM);
        let uuid = api
            .get_opt(UUID_CONFIGMAP)
            .await?
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(UUID_DATA_KEY))
            .unwrap_or_default();
        Ok(uuid)
    }

    async fn nodes_infra_state(&self) -> Result<NodesState> {
        let client = self.provider.kube_client().await?;
        let api: Api<Secret> = Api::namespaced(client, D8_SYSTEM);
        let secrets = api
            .list(&ListParams::default().labels(NODE_STATE_LABEL))
            .await?;

        let mut nodes = NodesState::new();
        for secret in secrets.items {
            let name = secret.metadata.name.clone().unwrap_or_default();
            let Some(node_name) = name.strip_prefix(NODE_STATE_SECRET_PREFIX) else {
                continue;
            };
            let group = secret
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(NODE_GROUP_LABEL))
                .cloned()
                .ok_or_else(|| {
                    DestroyError::Config(format!("secret {name} has no {NODE_GROUP_LABEL} label"))
                })?;

            let mut data = secret.data.unwrap_or_default();
            let state = data.remove(NODE_STATE_DATA_KEY).map(|b| b.0).unwrap_or_default();
            let settings = data
                .remove(NODE_GROUP_SETTINGS_DATA_KEY)
                .map(|b| b.0)
                .unwrap_or_default();

            let entry: &mut NodeGroupState = nodes.entry(group).or_default();
            if entry.settings.is_empty() {
                entry.settings = settings;
            }
            entry.state.insert(node_name.to_string(), state);
        }
        Ok(nodes)
    }

    async fn cluster_infra_state(&self) -> Result<Vec<u8>> {
        Ok(self
            .secret_data(D8_SYSTEM, CLUSTER_STATE_SECRET, CLUSTER_STATE_DATA_KEY)
            .await?
            .unwrap_or_default())
    }
}

/// Loads configuration and state from the running cluster
///
/// Every successful load is written through to the cache so later runs can
/// proceed without the cluster.
pub struct LiveStateLoader {
    source: Arc<dyn ClusterConfigSource>,
    cache: Arc<dyn StateCache>,
}

impl LiveStateLoader {
    pub fn new(source: Arc<dyn ClusterConfigSource>, cache: Arc<dyn StateCache>) -> Self {
        Self { source, cache }
    }
}

#[async_trait]
impl StateLoader for LiveStateLoader {
    async fn populate_meta_config(&self) -> Result<MetaConfig> {
        let cluster_yaml = self.source.cluster_configuration().await?;
        let provider_yaml = self.source.provider_cluster_configuration().await?;
        let uuid = self.source.cluster_uuid().await?;

        let meta = MetaConfig::parse(&cluster_yaml, provider_yaml.as_deref(), &uuid)?;
        cache_meta_config(self.cache.as_ref(), &meta)?;

        info!(cluster_type = %meta.cluster_type, uuid = %meta.uuid, "Loaded cluster configuration from cluster");
        Ok(meta)
    }

    async fn populate_cluster_state(&self) -> Result<ClusterState> {
        let state = ClusterState {
            cluster_state: self.source.cluster_infra_state().await?,
            nodes_state: self.source.nodes_infra_state().await?,
        };
        cache_cluster_state(self.cache.as_ref(), &state)?;

        info!(
            node_groups = state.nodes_state.len(),
            "Loaded infrastructure state from cluster"
        );
        Ok(state)
    }
}
