//! Converger node user
//!
//! For multi-master static clusters dhctl provisions its own Linux user on
//! every master through the `NodeUser` resource, so it can log in to the
//! other masters with a key it controls while the cluster is torn down.

use crate::error::{DestroyError, Result};
use crate::kubernetes::KubeClientProvider;
use crate::retry::RetryLoop;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::CustomResource;
use rand::distributions::Alphanumeric;
use rand::Rng;
use russh_keys::key::{KeyPair, SignatureHash};
use russh_keys::PublicKeyBase64;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha_crypt::{sha512_check, sha512_simple, Sha512Params};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CONVERGER_NODE_USER_NAME: &str = "d8-dhctl-converger";
pub const CONVERGER_UID: i64 = 64536;

/// Set by the node agent once the converger user exists on the node
pub const CONVERGER_USER_EXISTS_ANNOTATION: &str = "node.deckhouse.io/converger-user-exists";
pub const MASTER_GROUP_SELECTOR: &str = "node.deckhouse.io/group=master";

const PASSWORD_LENGTH: usize = 16;
const KEY_FILE_PREFIX: &str = "id_rsa_destroyer.key";
const FIELD_MANAGER: &str = "dhctl";

/// NodeUser provisions a Linux user on the nodes of the listed groups
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[kube(group = "deckhouse.io", version = "v1", kind = "NodeUser")]
#[serde(rename_all = "camelCase")]
pub struct NodeUserSpec {
    pub uid: i64,
    pub ssh_public_keys: Vec<String>,
    pub password_hash: String,
    pub is_sudoer: bool,
    pub node_groups: Vec<String>,
    #[serde(default)]
    pub extra_groups: Vec<String>,
}

/// Credentials of the converger user, cached between runs
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeUserCredentials {
    pub name: String,
    pub password: String,
    pub password_hash: String,
    /// PKCS#8 PEM
    pub private_key: String,
    /// OpenSSH authorized_keys line
    pub public_key: String,
}

impl NodeUserCredentials {
    /// Generate a fresh RSA-2048 keypair and a random sudo password
    pub fn generate() -> Result<Self> {
        let keypair = KeyPair::generate_rsa(2048, SignatureHash::SHA2_256)
            .ok_or_else(|| DestroyError::Internal("cannot generate RSA keypair".to_string()))?;

        let mut pem = Vec::new();
        russh_keys::encode_pkcs8_pem(&keypair, &mut pem)
            .map_err(|e| DestroyError::Internal(format!("cannot encode private key: {e}")))?;
        let public = keypair
            .clone_public_key()
            .map_err(|e| DestroyError::Internal(format!("cannot derive public key: {e}")))?;

        let password: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(PASSWORD_LENGTH)
            .map(char::from)
            .collect();

        Ok(Self {
            name: CONVERGER_NODE_USER_NAME.to_string(),
            password_hash: hash_password(&password)?,
            password,
            private_key: String::from_utf8_lossy(&pem).into_owned(),
            public_key: format!("ssh-rsa {}", public.public_key_base64()),
        })
    }

    /// Empty credentials mean no node user was provisioned (single master)
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    pub fn node_user(&self) -> NodeUser {
        NodeUser::new(
            &self.name,
            NodeUserSpec {
                uid: CONVERGER_UID,
                ssh_public_keys: vec![self.public_key.clone()],
                password_hash: self.password_hash.clone(),
                is_sudoer: true,
                node_groups: vec!["master".to_string()],
                extra_groups: Vec::new(),
            },
        )
    }

    /// Write the private key to `<dir>/id_rsa_destroyer.key.<rand>` readable by the owner only
    pub fn write_private_key(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let suffix: u64 = rand::thread_rng().gen();
        let path = dir.join(format!("{KEY_FILE_PREFIX}.{suffix}"));

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path)?;
        std::io::Write::write_all(&mut file, self.private_key.as_bytes())?;

        debug!(path = %path.display(), "Converger private key written");
        Ok(path)
    }
}

/// Whether `path` is a key file written by [`NodeUserCredentials::write_private_key`]
pub fn is_converger_key_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(&format!("{KEY_FILE_PREFIX}.")))
}

/// Salted `$6$` crypt hash of the password, the form /etc/shadow expects
pub fn hash_password(password: &str) -> Result<String> {
    sha512_simple(password, &Sha512Params::default())
        .map_err(|e| DestroyError::Internal(format!("cannot hash password: {e:?}")))
}

/// Whether `hash` is a crypt hash of `password`
pub fn verify_password(password: &str, hash: &str) -> bool {
    sha512_check(password, hash).is_ok()
}

/// Addresses of one master node
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeIp {
    pub node_name: String,
    pub internal_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub external_ip: String,
}

/// Node user credentials together with the masters they were pushed to
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodesWithCredentials {
    pub node_user: NodeUserCredentials,
    pub ips: Vec<NodeIp>,
    #[serde(default)]
    pub processed_ips: Vec<String>,
}

impl NodesWithCredentials {
    pub fn is_processed(&self, host: &str) -> bool {
        self.processed_ips.iter().any(|h| h == host)
    }

    pub fn mark_processed(&mut self, host: &str) {
        if !self.is_processed(host) {
            self.processed_ips.push(host.to_string());
        }
    }

    pub fn is_single_master(&self) -> bool {
        self.ips.len() == 1
    }
}

fn node_ip(node: &Node) -> NodeIp {
    let mut ip = NodeIp {
        node_name: node.metadata.name.clone().unwrap_or_default(),
        ..Default::default()
    };
    let addresses = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    for addr in addresses {
        match addr.type_.as_str() {
            "InternalIP" => ip.internal_ip = addr.address.clone(),
            "ExternalIP" => ip.external_ip = addr.address.clone(),
            _ => {}
        }
    }
    ip
}

/// Selects the master node group; IP discovery and the presence wait share it
pub fn master_nodes_params() -> ListParams {
    ListParams::default().labels(MASTER_GROUP_SELECTOR)
}

fn has_converger_user(node: &Node) -> bool {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CONVERGER_USER_EXISTS_ANNOTATION))
        .is_some_and(|v| v == "true")
}

/// Cluster operations on the converger node user
#[async_trait]
pub trait NodeUserClient: Send + Sync {
    /// Master nodes sorted by internal IP
    async fn master_node_ips(&self) -> Result<Vec<NodeIp>>;

    async fn create_or_update(&self, user: &NodeUser) -> Result<()>;

    /// Wait until every master node reports the user as present
    async fn wait_present_on_masters(&self) -> Result<()>;

    /// Delete the node user; a missing object is not an error
    async fn delete(&self, name: &str) -> Result<()>;

    /// Keep the API connection for later calls, even once the shared
    /// provider has been cleaned up
    async fn hold_client(&self) -> Result<()> {
        Ok(())
    }
}

/// Attempts and waits of the node user retry loops
#[derive(Debug, Clone)]
pub struct NodeUserLoops {
    pub get_masters: (usize, Duration),
    pub create: (usize, Duration),
    pub wait_present: (usize, Duration),
}

impl Default for NodeUserLoops {
    fn default() -> Self {
        Self {
            get_masters: (5, Duration::from_secs(5)),
            create: (10, Duration::from_secs(5)),
            wait_present: (20, Duration::from_millis(500)),
        }
    }
}

pub struct KubeNodeUserClient {
    kube: Arc<dyn KubeClientProvider>,
    client: OnceCell<Client>,
    loops: NodeUserLoops,
    cancel: CancellationToken,
}

impl KubeNodeUserClient {
    pub fn new(kube: Arc<dyn KubeClientProvider>, cancel: CancellationToken) -> Self {
        Self {
            kube,
            client: OnceCell::new(),
            loops: NodeUserLoops::default(),
            cancel,
        }
    }

    pub fn with_loops(mut self, loops: NodeUserLoops) -> Self {
        self.loops = loops;
        self
    }

    /// Client taken from the provider on first use and kept afterwards
    async fn client(&self) -> Result<Client> {
        let client = self.client.get_or_try_init(|| self.kube.kube_client()).await?;
        Ok(client.clone())
    }

    fn retry(&self, name: &str, (attempts, wait): (usize, Duration)) -> RetryLoop {
        RetryLoop::new(name, attempts, wait).with_cancel(self.cancel.clone())
    }
}

#[async_trait]
impl NodeUserClient for KubeNodeUserClient {
    async fn master_node_ips(&self) -> Result<Vec<NodeIp>> {
        let nodes = self
            .retry("Get master nodes IPs", self.loops.get_masters)
            .run(|| async move {
                let api: Api<Node> = Api::all(self.client().await?);
                Ok(api.list(&master_nodes_params()).await?)
            })
            .await?;

        let mut ips: Vec<NodeIp> = nodes.items.iter().map(node_ip).collect();
        ips.sort_by(|a, b| a.internal_ip.cmp(&b.internal_ip));
        debug!(masters = ?ips, "Found master nodes");
        Ok(ips)
    }

    async fn create_or_update(&self, user: &NodeUser) -> Result<()> {
        let name = user.metadata.name.clone().unwrap_or_default();
        let name = name.as_str();
        self.retry("Create converger NodeUser", self.loops.create)
            .run(|| async move {
                let api: Api<NodeUser> = Api::all(self.client().await?);
                let params = PatchParams::apply(FIELD_MANAGER).force();
                api.patch(name, &params, &Patch::Apply(user)).await?;
                Ok(())
            })
            .await?;
        info!(node_user = %name, "NodeUser created");
        Ok(())
    }

    async fn wait_present_on_masters(&self) -> Result<()> {
        self.retry("Wait converger user on master nodes", self.loops.wait_present)
            .run(|| async move {
                let api: Api<Node> = Api::all(self.client().await?);
                let nodes = api.list(&master_nodes_params()).await?;
                let missing: Vec<String> = nodes
                    .items
                    .iter()
                    .filter(|n| !has_converger_user(n))
                    .filter_map(|n| n.metadata.name.clone())
                    .collect();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(DestroyError::Remote(format!(
                        "converger user not yet present on nodes: {}",
                        missing.join(", ")
                    )))
                }
            })
            .await?;
        info!("Converger user is present on all master nodes");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let api: Api<NodeUser> = Api::all(self.client().await?);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(node_user = %name, "NodeUser deleted");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => {
                warn!(node_user = %name, error = %e, "Failed to delete NodeUser");
                Err(e.into())
            }
        }
    }

    async fn hold_client(&self) -> Result<()> {
        self.client().await.map(|_| ())
    }
}

#[cfg(test)]
#[path = "nodeuser_test.rs"]
mod tests;
