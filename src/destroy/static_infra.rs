use super::{DestroyOutcome, DestroyState, InfraDestroyer, SharedCollaborators};
use crate::error::{DestroyError, Result};
use crate::nodeuser::{is_converger_key_file, NodeUserClient, NodeUserCredentials, NodesWithCredentials};
use crate::retry::RetryLoop;
use crate::ssh::{Bastion, PrivateKey, SshClient, SshProvider, SshSession, CONNECTION_LOST_EXIT_CODE};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// First line holds the IP the node was bootstrapped with
pub const DISCOVERED_NODE_IP_PATH: &str = "/var/lib/bashible/discovered-node-ip";

pub const CLEANUP_COMMAND: &str = "test -f /var/lib/bashible/cleanup_static_node.sh || exit 0 && bash /var/lib/bashible/cleanup_static_node.sh --yes-i-am-sane-and-i-understand-what-i-am-doing";

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct StaticLoops {
    pub cleanup: (usize, Duration),
}

impl Default for StaticLoops {
    fn default() -> Self {
        Self {
            cleanup: (5, Duration::from_secs(15)),
        }
    }
}

/// Cleans static masters over SSH
///
/// With several masters the other masters are reached through the first
/// one (or through the user's bastion) as the converger user, and the
/// first master is cleaned last.
pub struct StaticInfraDestroyer {
    shared: SharedCollaborators,
    state: DestroyState,
    ssh: Arc<dyn SshProvider>,
    node_users: Arc<dyn NodeUserClient>,
    key_dir: PathBuf,
    loops: StaticLoops,
    nodes: Mutex<Option<NodesWithCredentials>>,
}

impl StaticInfraDestroyer {
    pub fn new(
        shared: SharedCollaborators,
        ssh: Arc<dyn SshProvider>,
        node_users: Arc<dyn NodeUserClient>,
        tmp_dir: &Path,
    ) -> Self {
        Self {
            state: DestroyState::new(shared.cache.clone()),
            shared,
            ssh,
            node_users,
            key_dir: tmp_dir.join("destroy"),
            loops: StaticLoops::default(),
            nodes: Mutex::new(None),
        }
    }

    pub fn with_loops(mut self, loops: StaticLoops) -> Self {
        self.loops = loops;
        self
    }

    fn nodes(&self) -> Option<NodesWithCredentials> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_nodes(&self, nodes: NodesWithCredentials) {
        *self.nodes.lock().unwrap_or_else(|e| e.into_inner()) = Some(nodes);
    }

    async fn create_and_save_credentials(&self) -> Result<NodesWithCredentials> {
        let ips = self.node_users.master_node_ips().await?;
        if ips.is_empty() {
            return Err(DestroyError::Config("cluster has no master nodes".to_string()));
        }

        let node_user = if ips.len() == 1 {
            debug!("Single master, no converger user needed");
            NodeUserCredentials::default()
        } else {
            NodeUserCredentials::generate()?
        };
        let nodes = NodesWithCredentials {
            node_user,
            ips,
            processed_ips: Vec::new(),
        };
        // Saved before the push so a crash in between reuses these credentials
        self.state.save_node_user(&nodes)?;
        info!(masters = nodes.ips.len(), "Converger credentials saved");
        Ok(nodes)
    }

    #[instrument(skip_all)]
    async fn ensure_node_user_present(&self, nodes: &NodesWithCredentials) -> Result<()> {
        if self.state.is_node_user_exists()? {
            debug!("Converger user already present on masters");
            return Ok(());
        }
        if nodes.is_single_master() || nodes.node_user.is_empty() {
            debug!("Single master, not waiting for converger user");
        } else {
            self.node_users
                .create_or_update(&nodes.node_user.node_user())
                .await?;
            self.node_users.wait_present_on_masters().await?;
        }
        self.state.set_node_user_exists()
    }

    /// Client for `host` logged in as the converger user
    async fn switch_to_node_user(
        &self,
        host: &str,
        bastion: Option<Bastion>,
        user_session: &SshSession,
    ) -> Result<Arc<dyn SshClient>> {
        let nodes = self.nodes().ok_or_else(|| {
            DestroyError::Internal("no converger credentials, prepare was not run".to_string())
        })?;
        let creds = &nodes.node_user;

        let key_path = creds.write_private_key(&self.key_dir)?;
        let mut private_keys = vec![PrivateKey::new(key_path)];
        private_keys.extend(
            user_session
                .private_keys
                .iter()
                .filter(|k| !is_converger_key_file(&k.path))
                .cloned(),
        );

        let session = SshSession {
            user: creds.name.clone(),
            port: user_session.port,
            hosts: vec![host.to_string()],
            bastion,
            private_keys,
            become_password: Some(creds.password.clone()),
        };
        info!(host = %host, user = %session.user, "Switching to converger user");
        self.ssh.switch_client(session).await
    }

    /// Client for `host` with the identity the user passed
    async fn user_client(&self, host: &str, user_session: &SshSession) -> Result<Arc<dyn SshClient>> {
        if user_session.hosts.len() == 1 && user_session.host() == Some(host) {
            return self.ssh.client().await;
        }
        let mut session = user_session.clone();
        session.hosts = vec![host.to_string()];
        self.ssh.switch_client(session).await
    }

    #[instrument(skip(self, client))]
    async fn process_host(&self, client: Arc<dyn SshClient>, host: &str) -> Result<()> {
        info!(host = %host, "Cleaning up static node");
        let (attempts, wait) = self.loops.cleanup;
        let client = &client;
        RetryLoop::new(format!("Clean up master {host}"), attempts, wait)
            .with_cancel(self.shared.cancel.clone())
            .run(|| async move {
                let output = client.run_command(CLEANUP_COMMAND, true, CLEANUP_TIMEOUT).await?;
                for line in output.stdout.lines().chain(output.stderr.lines()) {
                    debug!(host = %host, "{line}");
                }
                // The script reboots the node, which drops the connection under it
                if output.success() || output.exit_code == CONNECTION_LOST_EXIT_CODE {
                    Ok(())
                } else {
                    Err(DestroyError::Remote(format!(
                        "cleanup on {host} exited with {}: {}",
                        output.exit_code,
                        output.stderr.trim()
                    )))
                }
            })
            .await?;

        {
            let mut guard = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(nodes) = guard.as_mut() {
                nodes.mark_processed(host);
                self.state.save_node_user(nodes)?;
            }
        }
        info!(host = %host, "Static node cleaned up");
        Ok(())
    }

    fn is_processed(&self, host: &str) -> bool {
        self.nodes().is_some_and(|n| n.is_processed(host))
    }

    /// Masters other than the ones the user connects to, sorted by IP
    async fn additional_masters(&self, client: &Arc<dyn SshClient>, user_hosts: &[String]) -> Result<Vec<String>> {
        let Some(nodes) = self.nodes() else {
            return Ok(Vec::new());
        };
        if nodes.ips.len() < 2 {
            return Ok(Vec::new());
        }

        let discovered = client.download(DISCOVERED_NODE_IP_PATH).await?;
        let first_master = String::from_utf8_lossy(&discovered)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        debug!(first_master = %first_master, "Discovered IP of the connected master");

        let mut hosts: Vec<String> = nodes
            .ips
            .iter()
            .filter(|ip| ip.internal_ip != first_master)
            .filter(|ip| {
                !user_hosts
                    .iter()
                    .any(|h| *h == ip.internal_ip || (!ip.external_ip.is_empty() && *h == ip.external_ip))
            })
            .map(|ip| ip.internal_ip.clone())
            .collect();
        hosts.sort();
        Ok(hosts)
    }
}

#[async_trait]
impl InfraDestroyer for StaticInfraDestroyer {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn prepare(&self) -> Result<()> {
        let client = self.ssh.client().await?;
        if !client.session().hosts.is_empty() {
            self.state.save_cluster_hosts(&client.session().hosts)?;
        }

        let nodes = match self.state.node_user()? {
            Some(nodes) => {
                debug!(processed = ?nodes.processed_ips, "Using cached converger credentials");
                nodes
            }
            None => self.create_and_save_credentials().await?,
        };
        self.set_nodes(nodes.clone());
        self.ensure_node_user_present(&nodes).await
    }

    async fn after_resources_delete(&self) -> Result<()> {
        Ok(())
    }

    async fn cleanup_before_destroy(&self) -> Result<()> {
        if let Err(e) = self.node_users.hold_client().await {
            debug!(error = %e, "No API connection kept for NodeUser removal");
        }
        // SSH is still needed to reach the masters
        self.shared.kube.cleanup(false).await;
        Ok(())
    }

    async fn destroy_cluster(&self, _auto_approve: bool) -> Result<DestroyOutcome> {
        let client = self.ssh.client().await?;
        let user_session = client.session().clone();
        let mut user_hosts = user_session.hosts.clone();
        if user_hosts.is_empty() {
            user_hosts = self.state.cluster_hosts()?;
        }
        if user_hosts.is_empty() {
            return Err(DestroyError::Config("no master hosts to clean up".to_string()));
        }

        let additional = self.additional_masters(&client, &user_hosts).await?;
        let mut failures = Vec::new();

        if !additional.is_empty() {
            info!(count = additional.len(), "Cleaning up additional masters");
            let bastion = user_session.bastion.clone().or_else(|| {
                user_hosts.first().map(|host| Bastion {
                    host: host.clone(),
                    port: user_session.port,
                    user: user_session.user.clone(),
                })
            });

            for host in &additional {
                if self.is_processed(host) {
                    info!(host = %host, "Master already cleaned up, skipping");
                    continue;
                }
                let client = self.switch_to_node_user(host, bastion.clone(), &user_session).await?;
                if let Err(e) = self.process_host(client, host).await {
                    if e.is_cancelled() {
                        return Err(e);
                    }
                    warn!(host = %host, error = %e, "Failed to clean up master");
                    failures.push(e);
                }
            }
        }

        if let Some(first) = failures.into_iter().next() {
            // The first master is the jump host of the others, keep it
            return Err(first);
        }

        for host in &user_hosts {
            if self.is_processed(host) {
                info!(host = %host, "Master already cleaned up, skipping");
                continue;
            }
            let client = if additional.is_empty() {
                self.user_client(host, &user_session).await?
            } else {
                self.switch_to_node_user(host, user_session.bastion.clone(), &user_session)
                    .await?
            };
            self.process_host(client, host).await?;
        }

        if let Some(nodes) = self.nodes() {
            if !nodes.node_user.is_empty() {
                if let Err(e) = self.node_users.delete(&nodes.node_user.name).await {
                    info!(error = %e, "Converger NodeUser not removed, it goes away with the cluster");
                }
            }
        }
        Ok(DestroyOutcome::Completed)
    }
}
