//! Fixtures and in-memory collaborators for unit tests

#![allow(clippy::unwrap_used)]

use crate::converge::{ConvergeLocker, ConvergeUnlocker};
use crate::destroy::Confirmation;
use crate::error::{DestroyError, Result};
use crate::infra::{InfraEngine, NodeDestroyRequest};
use crate::kubernetes::KubeClientProvider;
use crate::meta::MetaConfig;
use crate::nodeuser::{NodeIp, NodeUser, NodeUserClient};
use crate::resources::TenantResourcesDestroyer;
use crate::ssh::{CommandOutput, SshClient, SshProvider, SshSession};
use crate::state::{ClusterConfigSource, NodeGroupState, NodesState};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) const STATIC_CLUSTER_YAML: &str = r#"
apiVersion: deckhouse.io/v1
kind: ClusterConfiguration
clusterType: Static
kubernetesVersion: "1.33"
podSubnetCIDR: 10.222.0.0/16
serviceSubnetCIDR: 10.111.0.0/16
encryptionAlgorithm: RSA-2048
defaultCRI: Containerd
clusterDomain: cluster.local
podSubnetNodeCIDRPrefix: "24"
"#;

pub(crate) const CLOUD_CLUSTER_YAML: &str = r#"
apiVersion: deckhouse.io/v1
kind: ClusterConfiguration
clusterType: Cloud
cloud:
  provider: Yandex
  prefix: "test"
kubernetesVersion: "1.32"
podSubnetCIDR: 10.222.0.0/16
serviceSubnetCIDR: 10.111.0.0/16
encryptionAlgorithm: RSA-2048
defaultCRI: Containerd
clusterDomain: cluster.local
podSubnetNodeCIDRPrefix: "24"
"#;

pub(crate) const PROVIDER_YAML: &str = r#"
apiVersion: deckhouse.io/v1
kind: YandexClusterConfiguration
layout: WithoutNAT
masterNodeGroup:
  replicas: 1
  instanceClass:
    platform: standard-v2
    cores: 4
    memory: 8192
    imageID: imageId
sshPublicKey: ssh-rsa AAAAB3NzaC1yc2E root@host
nodeNetworkCIDR: 10.100.0.0/21
provider:
  cloudID: cloudId
  folderID: folderId
  serviceAccountJSON: "{}"
"#;

/// Nodes state with one master group holding `nodes`
pub(crate) fn master_nodes_state(nodes: &[&str]) -> NodesState {
    let mut group = NodeGroupState {
        settings: br#"{"replicas":1}"#.to_vec(),
        ..Default::default()
    };
    for node in nodes {
        group
            .state
            .insert(node.to_string(), format!("{{\"node\":\"{node}\"}}").into_bytes());
    }
    NodesState::from([("master".to_string(), group)])
}

/// Kubernetes provider that never hands out a client
#[derive(Default)]
pub(crate) struct FakeKubeProvider {
    pub reachable: bool,
    pub cleanups: AtomicUsize,
    pub ssh_stops: AtomicUsize,
    cleaned: AtomicBool,
}

impl FakeKubeProvider {
    pub fn reachable() -> Self {
        Self {
            reachable: true,
            ..Default::default()
        }
    }

    pub fn unreachable() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KubeClientProvider for FakeKubeProvider {
    async fn kube_client(&self) -> Result<kube::Client> {
        Err(DestroyError::Remote("fake provider has no client".to_string()))
    }

    async fn cleanup(&self, stop_ssh: bool) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if stop_ssh {
            self.ssh_stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn is_reachable(&self) -> bool {
        self.reachable
    }
}

/// In-memory cluster configuration; counts every read
pub(crate) struct FakeConfigSource {
    pub cluster_yaml: String,
    pub provider_yaml: Option<String>,
    pub uuid: String,
    pub nodes: NodesState,
    pub cluster_state: Vec<u8>,
    pub calls: AtomicUsize,
}

impl FakeConfigSource {
    pub fn cloud(nodes: &[&str]) -> Self {
        Self {
            cluster_yaml: CLOUD_CLUSTER_YAML.to_string(),
            provider_yaml: Some(PROVIDER_YAML.to_string()),
            uuid: "f4a2e3b0-uuid".to_string(),
            nodes: master_nodes_state(nodes),
            cluster_state: br#"{"base":"infra"}"#.to_vec(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn static_cluster() -> Self {
        Self {
            cluster_yaml: STATIC_CLUSTER_YAML.to_string(),
            provider_yaml: None,
            uuid: "0b6c-static-uuid".to_string(),
            nodes: NodesState::new(),
            cluster_state: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterConfigSource for FakeConfigSource {
    async fn cluster_configuration(&self) -> Result<String> {
        self.hit();
        Ok(self.cluster_yaml.clone())
    }

    async fn provider_cluster_configuration(&self) -> Result<Option<String>> {
        self.hit();
        Ok(self.provider_yaml.clone())
    }

    async fn cluster_uuid(&self) -> Result<String> {
        self.hit();
        Ok(self.uuid.clone())
    }

    async fn nodes_infra_state(&self) -> Result<NodesState> {
        self.hit();
        Ok(self.nodes.clone())
    }

    async fn cluster_infra_state(&self) -> Result<Vec<u8>> {
        self.hit();
        Ok(self.cluster_state.clone())
    }
}

/// What happened on the fake SSH side, shared by a provider and its clients
#[derive(Default)]
pub(crate) struct SshRecorder {
    /// Hosts cleaned up, in order
    pub cleaned: Mutex<Vec<String>>,
    /// Sessions passed to `switch_client`
    pub switches: Mutex<Vec<SshSession>>,
    pub failing_hosts: Mutex<BTreeSet<String>>,
    /// Hosts refusing the SSH connection
    pub unreachable_hosts: Mutex<BTreeSet<String>>,
    /// Hosts whose connection drops mid-command, as on reboot
    pub rebooting_hosts: Mutex<BTreeSet<String>>,
    pub discovered_ip: Mutex<String>,
    pub downloads: AtomicUsize,
    pub stops: AtomicUsize,
}

impl SshRecorder {
    pub fn cleaned(&self) -> Vec<String> {
        self.cleaned.lock().unwrap().clone()
    }

    pub fn switches(&self) -> Vec<SshSession> {
        self.switches.lock().unwrap().clone()
    }

    pub fn fail_host(&self, host: &str) {
        self.failing_hosts.lock().unwrap().insert(host.to_string());
    }

    pub fn refuse_host(&self, host: &str) {
        self.unreachable_hosts.lock().unwrap().insert(host.to_string());
    }

    pub fn reboot_host(&self, host: &str) {
        self.rebooting_hosts.lock().unwrap().insert(host.to_string());
    }
}

pub(crate) struct FakeSshClient {
    session: SshSession,
    recorder: Arc<SshRecorder>,
}

#[async_trait]
impl SshClient for FakeSshClient {
    fn session(&self) -> &SshSession {
        &self.session
    }

    async fn run_command(&self, _command: &str, _sudo: bool, _timeout: Duration) -> Result<CommandOutput> {
        let host = self.session.host().unwrap_or_default().to_string();
        if self.recorder.unreachable_hosts.lock().unwrap().contains(&host) {
            return Err(DestroyError::Remote(format!("cannot connect to {host}:22: connection refused")));
        }
        if self.recorder.rebooting_hosts.lock().unwrap().contains(&host) {
            self.recorder.cleaned.lock().unwrap().push(host);
            return Ok(CommandOutput {
                exit_code: crate::ssh::CONNECTION_LOST_EXIT_CODE,
                ..Default::default()
            });
        }
        if self.recorder.failing_hosts.lock().unwrap().contains(&host) {
            return Ok(CommandOutput {
                stderr: "cleanup failed".to_string(),
                exit_code: 1,
                ..Default::default()
            });
        }
        self.recorder.cleaned.lock().unwrap().push(host);
        Ok(CommandOutput::default())
    }

    async fn download(&self, _remote_path: &str) -> Result<Vec<u8>> {
        self.recorder.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}\n", self.recorder.discovered_ip.lock().unwrap()).into_bytes())
    }
}

pub(crate) struct FakeSshProvider {
    current: Mutex<SshSession>,
    pub recorder: Arc<SshRecorder>,
    stopped: AtomicBool,
}

impl FakeSshProvider {
    /// Provider connected as `ubuntu` to `hosts`; the first host reports `hosts[0]` as its IP
    pub fn new(hosts: &[&str]) -> Self {
        let recorder = SshRecorder::default();
        *recorder.discovered_ip.lock().unwrap() = hosts.first().copied().unwrap_or_default().to_string();
        Self {
            current: Mutex::new(SshSession::new(
                "ubuntu",
                hosts.iter().map(|h| h.to_string()).collect(),
            )),
            recorder: Arc::new(recorder),
            stopped: AtomicBool::new(false),
        }
    }

    fn client_for(&self, session: SshSession) -> Arc<dyn SshClient> {
        Arc::new(FakeSshClient {
            session,
            recorder: self.recorder.clone(),
        })
    }
}

#[async_trait]
impl SshProvider for FakeSshProvider {
    async fn client(&self) -> Result<Arc<dyn SshClient>> {
        if self.is_stopped() {
            return Err(DestroyError::Internal("ssh used after stop".to_string()));
        }
        Ok(self.client_for(self.current.lock().unwrap().clone()))
    }

    async fn switch_client(&self, session: SshSession) -> Result<Arc<dyn SshClient>> {
        if self.is_stopped() {
            return Err(DestroyError::Internal("ssh used after stop".to_string()));
        }
        self.recorder.switches.lock().unwrap().push(session.clone());
        *self.current.lock().unwrap() = session.clone();
        Ok(self.client_for(session))
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.recorder.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Engine recording destroyed nodes; node state becomes `{"destroyed":true}`
#[derive(Default)]
pub(crate) struct FakeInfraEngine {
    pub destroyed_nodes: Mutex<Vec<String>>,
    pub base_calls: AtomicUsize,
    pub fail_base: AtomicBool,
    pub fail_node: Mutex<Option<String>>,
    /// State reported along with a node failure
    pub partial_state: Mutex<Option<Vec<u8>>>,
}

impl FakeInfraEngine {
    pub fn destroyed_nodes(&self) -> Vec<String> {
        self.destroyed_nodes.lock().unwrap().clone()
    }

    pub fn base_calls(&self) -> usize {
        self.base_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InfraEngine for FakeInfraEngine {
    async fn destroy_node(&self, request: NodeDestroyRequest<'_>) -> Result<Vec<u8>> {
        if self.fail_node.lock().unwrap().as_deref() == Some(request.node_name) {
            let message = format!("cannot destroy {}", request.node_name);
            return Err(match self.partial_state.lock().unwrap().clone() {
                Some(state) => DestroyError::InfraEnginePartial { message, state },
                None => DestroyError::InfraEngine(message),
            });
        }
        self.destroyed_nodes
            .lock()
            .unwrap()
            .push(request.node_name.to_string());
        Ok(br#"{"destroyed":true}"#.to_vec())
    }

    async fn destroy_base_infra(&self, _meta: &MetaConfig, _state: &[u8]) -> Result<Vec<u8>> {
        self.base_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_base.load(Ordering::SeqCst) {
            return Err(DestroyError::InfraEngine("base infrastructure destroy failed".to_string()));
        }
        Ok(br#"{"destroyed":true}"#.to_vec())
    }
}

#[derive(Default)]
pub(crate) struct FakeNodeUserClient {
    pub ips: Vec<NodeIp>,
    pub pushed: Mutex<Vec<NodeUser>>,
    pub waits: AtomicUsize,
    pub deletes: AtomicUsize,
    pub holds: AtomicUsize,
}

impl FakeNodeUserClient {
    pub fn with_masters(ips: &[&str]) -> Self {
        Self {
            ips: ips
                .iter()
                .enumerate()
                .map(|(i, ip)| NodeIp {
                    node_name: format!("master-{i}"),
                    internal_ip: ip.to_string(),
                    external_ip: String::new(),
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn pushes(&self) -> usize {
        self.pushed.lock().unwrap().len()
    }
}

#[async_trait]
impl NodeUserClient for FakeNodeUserClient {
    async fn master_node_ips(&self) -> Result<Vec<NodeIp>> {
        Ok(self.ips.clone())
    }

    async fn create_or_update(&self, user: &NodeUser) -> Result<()> {
        self.pushed.lock().unwrap().push(user.clone());
        Ok(())
    }

    async fn wait_present_on_masters(&self) -> Result<()> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, _name: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn hold_client(&self) -> Result<()> {
        self.holds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeResourcesDestroyer {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl FakeResourcesDestroyer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TenantResourcesDestroyer for FakeResourcesDestroyer {
    async fn delete_resources(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(DestroyError::Remote("load balancer services still present".to_string()));
        }
        Ok(())
    }
}

/// Counts lock, stop-watch and release calls
#[derive(Default)]
pub(crate) struct LockRecorder {
    pub locks: AtomicUsize,
    pub stop_watches: AtomicUsize,
    pub releases: AtomicUsize,
}

#[derive(Default)]
pub(crate) struct FakeConvergeLocker {
    pub recorder: Arc<LockRecorder>,
}

impl FakeConvergeLocker {
    pub fn locks(&self) -> usize {
        self.recorder.locks.load(Ordering::SeqCst)
    }

    pub fn stop_watches(&self) -> usize {
        self.recorder.stop_watches.load(Ordering::SeqCst)
    }
}

struct FakeUnlocker {
    recorder: Arc<LockRecorder>,
}

#[async_trait]
impl ConvergeLocker for FakeConvergeLocker {
    async fn lock(&self, _kube: Arc<dyn KubeClientProvider>) -> Result<Arc<dyn ConvergeUnlocker>> {
        self.recorder.locks.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeUnlocker {
            recorder: self.recorder.clone(),
        }))
    }
}

#[async_trait]
impl ConvergeUnlocker for FakeUnlocker {
    async fn stop_watch(&self) -> Result<()> {
        self.recorder.stop_watches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.recorder.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Answers every prompt with the same value
pub(crate) struct FakeConfirmation(pub bool);

impl Confirmation for FakeConfirmation {
    fn confirm(&self, _message: &str) -> bool {
        self.0
    }
}
