//! SSH capability
//!
//! The destroy pipeline talks to static nodes through two narrow traits:
//! [`SshClient`] runs commands and downloads files on one host, and
//! [`SshProvider`] owns the current client, swaps it for a client with a
//! different identity, and stops SSH for good at the point of no return.

mod client;

pub use client::{
    shell_quote, NativeSshClient, NativeSshProvider, OutputCollector, CONNECTION_LOST_EXIT_CODE,
};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bastion {
    pub host: String,
    pub port: u16,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateKey {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

impl PrivateKey {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            passphrase: None,
        }
    }
}

/// Connection parameters of one SSH client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshSession {
    pub user: String,
    pub port: u16,
    /// Hosts this session may target; the first one is the default
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bastion: Option<Bastion>,
    #[serde(default)]
    pub private_keys: Vec<PrivateKey>,
    /// Password for sudo, if the user needs one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub become_password: Option<String>,
}

impl SshSession {
    pub fn new(user: impl Into<String>, hosts: Vec<String>) -> Self {
        Self {
            user: user.into(),
            port: DEFAULT_SSH_PORT,
            hosts,
            bastion: None,
            private_keys: Vec::new(),
            become_password: None,
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.hosts.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// [`CONNECTION_LOST_EXIT_CODE`] when the connection dropped while the command ran
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait SshClient: Send + Sync {
    fn session(&self) -> &SshSession;

    /// Run `command` on the session's default host
    ///
    /// Failing to connect or authenticate is an error, not an exit code.
    async fn run_command(
        &self,
        command: &str,
        sudo: bool,
        timeout: Duration,
    ) -> Result<CommandOutput>;

    /// Fetch a remote file from the session's default host
    async fn download(&self, remote_path: &str) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait SshProvider: Send + Sync {
    /// Current client, created on first use
    async fn client(&self) -> Result<Arc<dyn SshClient>>;

    /// Replace the current client with one built from `session`
    async fn switch_client(&self, session: SshSession) -> Result<Arc<dyn SshClient>>;

    /// Stop SSH; later calls are no-ops
    fn stop(&self);

    fn is_stopped(&self) -> bool;
}
