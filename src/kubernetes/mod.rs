//! Kubernetes client provider
//!
//! Destroyers never hold a `kube::Client` directly. They ask a
//! [`KubeClientProvider`] for one, so the client is created lazily, shared
//! for the whole run, and torn down exactly once at the point of no return.

use crate::error::{DestroyError, Result};
use crate::ssh::SshProvider;
use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

#[async_trait]
pub trait KubeClientProvider: Send + Sync {
    async fn kube_client(&self) -> Result<Client>;

    /// Stop talking to the cluster; with `stop_ssh` also stop SSH
    ///
    /// Safe to call more than once, later calls do nothing.
    async fn cleanup(&self, stop_ssh: bool);

    /// Whether the API server answers
    async fn is_reachable(&self) -> bool {
        match self.kube_client().await {
            Ok(client) => match client.apiserver_version().await {
                Ok(version) => {
                    debug!(version = %version.git_version, "Kubernetes API is reachable");
                    true
                }
                Err(e) => {
                    warn!(error = %e, "Kubernetes API is not reachable");
                    false
                }
            },
            Err(e) => {
                debug!(error = %e, "No Kubernetes client available");
                false
            }
        }
    }
}

/// Provider creating the client on first use from a kubeconfig
pub struct LazyKubeProvider {
    kubeconfig: Option<PathBuf>,
    client: OnceCell<Client>,
    ssh: Option<Arc<dyn SshProvider>>,
    cleaned: AtomicBool,
}

impl LazyKubeProvider {
    /// # Arguments
    /// * `kubeconfig` - explicit kubeconfig path, or `None` to infer
    /// * `ssh` - SSH provider to stop on `cleanup(true)`
    pub fn new(kubeconfig: Option<PathBuf>, ssh: Option<Arc<dyn SshProvider>>) -> Self {
        Self {
            kubeconfig,
            client: OnceCell::new(),
            ssh,
            cleaned: AtomicBool::new(false),
        }
    }

    async fn build_client(&self) -> Result<Client> {
        let config = match &self.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    DestroyError::Config(format!("cannot read kubeconfig {}: {e}", path.display()))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| DestroyError::Config(format!("invalid kubeconfig: {e}")))?
            }
            None => Config::infer()
                .await
                .map_err(|e| DestroyError::Config(format!("cannot infer kubeconfig: {e}")))?,
        };
        info!(cluster_url = %config.cluster_url, "Connecting to Kubernetes API");
        Ok(Client::try_from(config)?)
    }
}

#[async_trait]
impl KubeClientProvider for LazyKubeProvider {
    async fn kube_client(&self) -> Result<Client> {
        if self.cleaned.load(Ordering::SeqCst) {
            return Err(DestroyError::Internal(
                "kubernetes client requested after cleanup".to_string(),
            ));
        }
        let client = self.client.get_or_try_init(|| self.build_client()).await?;
        Ok(client.clone())
    }

    async fn cleanup(&self, stop_ssh: bool) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            debug!("Kubernetes provider already cleaned up");
            return;
        }
        info!(stop_ssh, "Stopping Kubernetes client");
        if stop_ssh {
            if let Some(ssh) = &self.ssh {
                ssh.stop();
            }
        }
    }
}

/// Provider used when the cluster API must not (or cannot) be contacted
pub struct ErrorKubeProvider {
    reason: String,
    ssh: Option<Arc<dyn SshProvider>>,
    cleaned: AtomicBool,
}

impl ErrorKubeProvider {
    pub fn new(reason: impl Into<String>, ssh: Option<Arc<dyn SshProvider>>) -> Self {
        Self {
            reason: reason.into(),
            ssh,
            cleaned: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl KubeClientProvider for ErrorKubeProvider {
    async fn kube_client(&self) -> Result<Client> {
        Err(DestroyError::Precondition(format!(
            "kubernetes API is not available: {}",
            self.reason
        )))
    }

    async fn cleanup(&self, stop_ssh: bool) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        if stop_ssh {
            if let Some(ssh) = &self.ssh {
                ssh.stop();
            }
        }
    }

    async fn is_reachable(&self) -> bool {
        false
    }
}

#[cfg(test)]
#[path = "provider_test.rs"]
mod tests;
