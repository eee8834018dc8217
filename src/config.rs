//! Destroy run configuration from `DHCTL_*` environment variables

use crate::error::{DestroyError, Result};
use crate::logging::{default_debug_log_path, LoggingConfig, TraceConfig, TRACE_ENV};
use crate::ssh::{Bastion, PrivateKey, SshSession, DEFAULT_SSH_PORT};
use crate::state::CommanderParams;
use chrono::Utc;
use std::path::PathBuf;

pub const DEFAULT_TMP_DIR: &str = "/tmp/dhctl";
pub const DEFAULT_INFRA_BINARY: &str = "terraform";
pub const DEFAULT_INFRA_MODULES_DIR: &str = "/deckhouse/candi/cloud-providers";
pub const DEFAULT_SSH_USER: &str = "ubuntu";

/// Name this binary answers to in `DHCTL_COMMAND_ALLOW_LIST`
pub const DESTROY_COMMAND: &str = "destroy";

#[derive(Debug, Clone)]
pub struct DestroyConfig {
    pub tmp_dir: PathBuf,
    pub auto_approve: bool,
    pub skip_resources: bool,
    pub commander_mode: bool,
    pub commander_cluster_config: Option<PathBuf>,
    pub commander_provider_config: Option<PathBuf>,
    pub force_from_cache: bool,
    pub abort: bool,
    pub cache_id: Option<String>,
    /// `None` when no SSH hosts were given
    pub ssh: Option<SshSession>,
    pub kubeconfig: Option<PathBuf>,
    pub infra_binary: PathBuf,
    pub infra_modules_dir: PathBuf,
    pub debug: bool,
    pub write_debug_log_file: bool,
    pub debug_log_file_path: Option<PathBuf>,
    pub trace: TraceConfig,
    pub command_allow_list: Option<Vec<String>>,
}

fn parse_bool(name: &str, value: Option<String>) -> Result<bool> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some(v) => match v.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(DestroyError::Config(format!("{name}: expected a boolean, got {v:?}"))),
        },
    }
}

fn parse_port(name: &str, value: Option<String>) -> Result<u16> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(DEFAULT_SSH_PORT),
        Some(v) => v
            .parse()
            .map_err(|_| DestroyError::Config(format!("{name}: invalid port {v:?}"))),
    }
}

fn parse_list(value: Option<String>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl DestroyConfig {
    /// Create config from environment variables
    ///
    /// # Errors
    /// * `Config` - a boolean or port variable does not parse
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`DestroyConfig::from_env`] over an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| non_empty(lookup(name));
        let flag = |name: &str| parse_bool(name, lookup(name));

        let hosts = parse_list(lookup("DHCTL_SSH_HOSTS"));
        let ssh = if hosts.is_empty() {
            None
        } else {
            let mut session = SshSession::new(
                var("DHCTL_SSH_USER").unwrap_or_else(|| DEFAULT_SSH_USER.to_string()),
                hosts,
            );
            session.port = parse_port("DHCTL_SSH_PORT", lookup("DHCTL_SSH_PORT"))?;
            session.private_keys = parse_list(lookup("DHCTL_SSH_AGENT_PRIVATE_KEYS"))
                .into_iter()
                .map(PrivateKey::new)
                .collect();
            session.bastion = match var("DHCTL_SSH_BASTION_HOST") {
                Some(host) => Some(Bastion {
                    host,
                    port: parse_port("DHCTL_SSH_BASTION_PORT", lookup("DHCTL_SSH_BASTION_PORT"))?,
                    user: var("DHCTL_SSH_BASTION_USER").unwrap_or_else(|| session.user.clone()),
                }),
                None => None,
            };
            Some(session)
        };

        let allow_list = parse_list(lookup("DHCTL_COMMAND_ALLOW_LIST"));

        Ok(Self {
            tmp_dir: var("DHCTL_TMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TMP_DIR)),
            auto_approve: flag("DHCTL_AUTO_APPROVE")?,
            skip_resources: flag("DHCTL_SKIP_RESOURCES")?,
            commander_mode: flag("DHCTL_COMMANDER_MODE")?,
            commander_cluster_config: var("DHCTL_COMMANDER_CLUSTER_CONFIG").map(PathBuf::from),
            commander_provider_config: var("DHCTL_COMMANDER_PROVIDER_CONFIG").map(PathBuf::from),
            force_from_cache: flag("DHCTL_FORCE_FROM_CACHE")?,
            abort: flag("DHCTL_ABORT")?,
            cache_id: var("DHCTL_CACHE_ID"),
            ssh,
            kubeconfig: var("DHCTL_KUBECONFIG").map(PathBuf::from),
            infra_binary: var("DHCTL_INFRA_BINARY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_INFRA_BINARY)),
            infra_modules_dir: var("DHCTL_INFRA_MODULES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_INFRA_MODULES_DIR)),
            debug: flag("DHCTL_DEBUG")?,
            write_debug_log_file: !flag("DHCTL_DO_NOT_WRITE_DEBUG_LOG_FILE")?,
            debug_log_file_path: var("DHCTL_DEBUG_LOG_FILE_PATH").map(PathBuf::from),
            trace: TraceConfig::parse(&lookup(TRACE_ENV).unwrap_or_default()),
            command_allow_list: (!allow_list.is_empty()).then_some(allow_list),
        })
    }

    /// # Errors
    /// * `Config` - an allow-list is set and does not contain `command`
    pub fn check_allowed(&self, command: &str) -> Result<()> {
        match &self.command_allow_list {
            Some(allowed) if !allowed.iter().any(|c| c == command) => Err(DestroyError::Config(
                format!("command {command:?} is not allowed, allowed: {}", allowed.join(", ")),
            )),
            _ => Ok(()),
        }
    }

    /// String the cache directory is derived from
    ///
    /// The explicit id wins, then the SSH host list, then the kubeconfig path.
    pub fn cache_identity(&self) -> String {
        if let Some(id) = &self.cache_id {
            return id.clone();
        }
        if let Some(ssh) = &self.ssh {
            return format!("ssh:{}", ssh.hosts.join(","));
        }
        match &self.kubeconfig {
            Some(path) => format!("kubeconfig:{}", path.display()),
            None => "kubeconfig:default".to_string(),
        }
    }

    /// Configuration files supplied up front in commander mode
    ///
    /// # Errors
    /// * `Config` - commander mode without a cluster configuration file
    /// * `Io` - a file cannot be read
    pub fn commander_params(&self) -> Result<Option<CommanderParams>> {
        if !self.commander_mode {
            return Ok(None);
        }
        let cluster_path = self.commander_cluster_config.as_ref().ok_or_else(|| {
            DestroyError::Config(
                "commander mode requires DHCTL_COMMANDER_CLUSTER_CONFIG".to_string(),
            )
        })?;
        let provider_cluster_configuration = match &self.commander_provider_config {
            Some(path) => Some(std::fs::read_to_string(path)?),
            None => None,
        };
        Ok(Some(CommanderParams {
            cluster_configuration: std::fs::read_to_string(cluster_path)?,
            provider_cluster_configuration,
        }))
    }

    pub fn logging(&self) -> LoggingConfig {
        let debug_log_file = if self.write_debug_log_file {
            Some(
                self.debug_log_file_path
                    .clone()
                    .unwrap_or_else(|| default_debug_log_path(&self.tmp_dir, Utc::now())),
            )
        } else {
            None
        };
        LoggingConfig {
            debug: self.debug,
            debug_log_file,
            trace: self.trace.clone(),
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
