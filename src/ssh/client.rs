use super::{Bastion, CommandOutput, SshClient, SshProvider, SshSession};
use crate::error::{DestroyError, Result};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Reported when the connection went away after the command started,
/// matching what OpenSSH exits with in that case
pub const CONNECTION_LOST_EXIT_CODE: i32 = 255;

/// Quote `value` for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Host keys are not pinned: nodes are reinstalled between bootstraps
struct AcceptHostKey {
    host: String,
}

#[async_trait]
impl client::Handler for AcceptHostKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        debug!(host = %self.host, fingerprint = %server_public_key.fingerprint(), "Accepting host key");
        Ok(true)
    }
}

/// An authenticated session, plus the jump host session it is tunnelled through
struct Connection {
    handle: Handle<AcceptHostKey>,
    _jump: Option<Handle<AcceptHostKey>>,
}

impl Connection {
    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(error = %e, "SSH disconnect failed");
        }
    }
}

/// Output of one remote command as it streams in
#[derive(Debug, Default)]
pub struct OutputCollector {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
}

impl OutputCollector {
    pub fn stdout(&mut self, data: &[u8]) {
        self.stdout.extend_from_slice(data);
    }

    pub fn stderr(&mut self, data: &[u8]) {
        self.stderr.extend_from_slice(data);
    }

    pub fn exit(&mut self, status: u32) {
        self.exit_code = Some(i32::try_from(status).unwrap_or(-1));
    }

    /// The remote process died from a signal, which is what a reboot does to it
    pub fn killed(&mut self, signal: &str) {
        debug!(signal = %signal, "Remote command terminated by signal");
        self.exit_code = Some(CONNECTION_LOST_EXIT_CODE);
    }

    pub fn raw_stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub fn finish(self) -> CommandOutput {
        CommandOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            exit_code: self.exit_code.unwrap_or(CONNECTION_LOST_EXIT_CODE),
        }
    }
}

/// Client speaking SSH natively through `russh`
///
/// Every command gets its own connection, so a node that rebooted under a
/// previous command is reached again on the next attempt. Failures to
/// connect or authenticate are errors; only a connection lost after the
/// command started is reported as [`CONNECTION_LOST_EXIT_CODE`].
#[derive(Debug, Clone)]
pub struct NativeSshClient {
    session: SshSession,
    cancel: CancellationToken,
}

impl NativeSshClient {
    pub fn new(session: SshSession, cancel: CancellationToken) -> Self {
        Self { session, cancel }
    }

    fn host(&self) -> Result<&str> {
        self.session
            .host()
            .ok_or_else(|| DestroyError::Precondition("ssh session has no hosts".to_string()))
    }

    fn config() -> Arc<client::Config> {
        Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(60)),
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..Default::default()
        })
    }

    fn load_keys(&self) -> Result<Vec<Arc<KeyPair>>> {
        self.session
            .private_keys
            .iter()
            .map(|key| {
                russh_keys::load_secret_key(&key.path, key.passphrase.as_deref())
                    .map(Arc::new)
                    .map_err(|e| {
                        DestroyError::Config(format!("cannot load ssh key {}: {e}", key.path.display()))
                    })
            })
            .collect()
    }

    async fn authenticate(handle: &mut Handle<AcceptHostKey>, user: &str, host: &str, keys: &[Arc<KeyPair>]) -> Result<()> {
        for key in keys {
            let accepted = handle
                .authenticate_publickey(user, key.clone())
                .await
                .map_err(|e| DestroyError::Remote(format!("ssh authentication on {host} failed: {e}")))?;
            if accepted {
                return Ok(());
            }
        }
        Err(DestroyError::Remote(format!(
            "ssh authentication rejected for {user}@{host}"
        )))
    }

    async fn open(&self, keys: &[Arc<KeyPair>]) -> Result<Connection> {
        let host = self.host()?.to_string();
        let port = self.session.port;

        let jump = match &self.session.bastion {
            Some(bastion) => Some(self.open_jump(bastion, keys).await?),
            None => None,
        };

        let handler = AcceptHostKey { host: host.clone() };
        let mut handle = match &jump {
            Some(jump) => {
                let channel = jump
                    .channel_open_direct_tcpip(host.clone(), u32::from(port), "127.0.0.1", 0)
                    .await
                    .map_err(|e| {
                        DestroyError::Remote(format!("cannot reach {host}:{port} through bastion: {e}"))
                    })?;
                client::connect_stream(Self::config(), channel.into_stream(), handler)
                    .await
                    .map_err(|e| DestroyError::Remote(format!("ssh handshake with {host} failed: {e}")))?
            }
            None => tokio::time::timeout(
                CONNECT_TIMEOUT,
                client::connect(Self::config(), (host.as_str(), port), handler),
            )
            .await
            .map_err(|_| DestroyError::Remote(format!("ssh connect to {host}:{port} timed out")))?
            .map_err(|e| DestroyError::Remote(format!("cannot connect to {host}:{port}: {e}")))?,
        };

        Self::authenticate(&mut handle, &self.session.user, &host, keys).await?;
        debug!(host = %host, user = %self.session.user, bastion = jump.is_some(), "SSH session established");
        Ok(Connection { handle, _jump: jump })
    }

    async fn open_jump(&self, bastion: &Bastion, keys: &[Arc<KeyPair>]) -> Result<Handle<AcceptHostKey>> {
        let handler = AcceptHostKey {
            host: bastion.host.clone(),
        };
        let mut handle = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(Self::config(), (bastion.host.as_str(), bastion.port), handler),
        )
        .await
        .map_err(|_| DestroyError::Remote(format!("ssh connect to bastion {} timed out", bastion.host)))?
        .map_err(|e| DestroyError::Remote(format!("cannot connect to bastion {}: {e}", bastion.host)))?;
        Self::authenticate(&mut handle, &bastion.user, &bastion.host, keys).await?;
        Ok(handle)
    }

    fn remote_command(&self, command: &str, sudo: bool) -> String {
        if !sudo {
            return command.to_string();
        }
        if self.session.become_password.is_some() {
            format!("sudo -S -p '' bash -c {}", shell_quote(command))
        } else {
            format!("sudo -n bash -c {}", shell_quote(command))
        }
    }

    async fn exec(&self, remote: String, stdin: Option<String>) -> Result<OutputCollector> {
        let keys = self.load_keys()?;
        let connection = self.open(&keys).await?;

        let mut channel = connection
            .handle
            .channel_open_session()
            .await
            .map_err(|e| DestroyError::Remote(format!("cannot open ssh channel: {e}")))?;
        channel
            .exec(true, remote)
            .await
            .map_err(|e| DestroyError::Remote(format!("cannot start remote command: {e}")))?;

        if let Some(input) = stdin {
            let line = format!("{input}\n");
            if let Err(e) = channel.data(line.as_bytes()).await {
                warn!(error = %e, "Cannot write to remote command stdin");
            }
            if let Err(e) = channel.eof().await {
                debug!(error = %e, "Cannot close remote command stdin");
            }
        }

        // From here on a dropped connection means the command was running
        let mut output = OutputCollector::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.stdout(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => output.stderr(data),
                ChannelMsg::ExitStatus { exit_status } => output.exit(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => output.killed(&format!("{signal_name:?}")),
                _ => {}
            }
        }
        connection.close().await;
        Ok(output)
    }

    async fn exec_with_limits(&self, remote: String, stdin: Option<String>, timeout: Duration) -> Result<OutputCollector> {
        debug!(host = ?self.session.host(), user = %self.session.user, "Running ssh command");
        // Dropping the exec future tears the connection down
        tokio::select! {
            out = tokio::time::timeout(timeout, self.exec(remote, stdin)) => match out {
                Ok(output) => output,
                Err(_) => Err(DestroyError::Remote(format!(
                    "ssh command timed out after {}s",
                    timeout.as_secs()
                ))),
            },
            _ = self.cancel.cancelled() => Err(DestroyError::Cancelled),
        }
    }
}

#[async_trait]
impl SshClient for NativeSshClient {
    fn session(&self) -> &SshSession {
        &self.session
    }

    async fn run_command(&self, command: &str, sudo: bool, timeout: Duration) -> Result<CommandOutput> {
        let stdin = if sudo {
            self.session.become_password.clone()
        } else {
            None
        };
        let output = self
            .exec_with_limits(self.remote_command(command, sudo), stdin, timeout)
            .await?;
        Ok(output.finish())
    }

    async fn download(&self, remote_path: &str) -> Result<Vec<u8>> {
        let collected = self
            .exec_with_limits(format!("cat {}", shell_quote(remote_path)), None, DOWNLOAD_TIMEOUT)
            .await?;
        let data = collected.raw_stdout().to_vec();
        let output = collected.finish();
        if !output.success() {
            return Err(DestroyError::Remote(format!(
                "cannot download {remote_path}: {}",
                output.stderr.trim()
            )));
        }
        Ok(data)
    }
}

/// Provider handing out [`NativeSshClient`]s
pub struct NativeSshProvider {
    initial: SshSession,
    current: Mutex<Option<Arc<NativeSshClient>>>,
    stopped: AtomicBool,
    cancel: CancellationToken,
}

impl NativeSshProvider {
    pub fn new(initial: SshSession, cancel: CancellationToken) -> Self {
        Self {
            initial,
            current: Mutex::new(None),
            stopped: AtomicBool::new(false),
            cancel,
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DestroyError::Internal(
                "ssh provider used after it was stopped".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SshProvider for NativeSshProvider {
    async fn client(&self) -> Result<Arc<dyn SshClient>> {
        self.ensure_running()?;
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        let client = current
            .get_or_insert_with(|| Arc::new(NativeSshClient::new(self.initial.clone(), self.cancel.clone())))
            .clone();
        Ok(client)
    }

    async fn switch_client(&self, session: SshSession) -> Result<Arc<dyn SshClient>> {
        self.ensure_running()?;
        info!(user = %session.user, hosts = ?session.hosts, "Switching ssh client");
        let client = Arc::new(NativeSshClient::new(session, self.cancel.clone()));
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(client.clone());
        Ok(client)
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        info!("SSH provider stopped");
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
