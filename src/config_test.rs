#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity

use super::*;
use crate::error::ErrorKind;
use std::collections::HashMap;

fn config(vars: &[(&str, &str)]) -> Result<DestroyConfig> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    DestroyConfig::from_lookup(|name| vars.get(name).cloned())
}

/// Test DestroyConfig defaults with an empty environment
#[test]
fn test_defaults() {
    let config = config(&[]).unwrap();

    assert_eq!(config.tmp_dir, PathBuf::from("/tmp/dhctl"));
    assert!(!config.auto_approve);
    assert!(!config.skip_resources);
    assert!(!config.commander_mode);
    assert!(!config.abort);
    assert!(config.ssh.is_none());
    assert_eq!(config.infra_binary, PathBuf::from("terraform"));
    assert_eq!(config.infra_modules_dir, PathBuf::from("/deckhouse/candi/cloud-providers"));
    assert!(config.write_debug_log_file);
    assert_eq!(config.trace, TraceConfig::Disabled);
    assert!(config.command_allow_list.is_none());
    assert_eq!(config.cache_identity(), "kubeconfig:default");
}

#[test]
fn test_ssh_session_from_env() {
    let config = config(&[
        ("DHCTL_SSH_HOSTS", "10.0.0.1, 10.0.0.2"),
        ("DHCTL_SSH_USER", "admin"),
        ("DHCTL_SSH_PORT", "2222"),
        ("DHCTL_SSH_AGENT_PRIVATE_KEYS", "/home/admin/.ssh/id_rsa"),
        ("DHCTL_SSH_BASTION_HOST", "bastion.example.com"),
    ])
    .unwrap();

    let ssh = config.ssh.clone().unwrap();
    assert_eq!(ssh.user, "admin");
    assert_eq!(ssh.port, 2222);
    assert_eq!(ssh.hosts, vec!["10.0.0.1", "10.0.0.2"]);
    assert_eq!(ssh.private_keys, vec![PrivateKey::new("/home/admin/.ssh/id_rsa")]);
    let bastion = ssh.bastion.unwrap();
    assert_eq!(bastion.host, "bastion.example.com");
    assert_eq!(bastion.port, 22);
    assert_eq!(bastion.user, "admin");
    assert_eq!(config.cache_identity(), "ssh:10.0.0.1,10.0.0.2");
}

#[test]
fn test_flags() {
    let config = config(&[
        ("DHCTL_AUTO_APPROVE", "true"),
        ("DHCTL_SKIP_RESOURCES", "yes"),
        ("DHCTL_ABORT", "1"),
        ("DHCTL_DO_NOT_WRITE_DEBUG_LOG_FILE", "TRUE"),
        ("DHCTL_TRACE", "yes"),
    ])
    .unwrap();

    assert!(config.auto_approve);
    assert!(config.skip_resources);
    assert!(config.abort);
    assert!(!config.write_debug_log_file);
    assert!(config.logging().debug_log_file.is_none());
    assert!(config.trace.is_enabled());
}

#[test]
fn test_invalid_bool_is_config_error() {
    let err = config(&[("DHCTL_AUTO_APPROVE", "sure")]).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("DHCTL_AUTO_APPROVE"));
}

#[test]
fn test_invalid_port_is_config_error() {
    let err = config(&[("DHCTL_SSH_HOSTS", "10.0.0.1"), ("DHCTL_SSH_PORT", "70000")]).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn test_allow_list() {
    let open = config(&[]).unwrap();
    let allowed = config(&[("DHCTL_COMMAND_ALLOW_LIST", "bootstrap,destroy")]).unwrap();
    let denied = config(&[("DHCTL_COMMAND_ALLOW_LIST", "bootstrap, converge")]).unwrap();

    assert!(open.check_allowed(DESTROY_COMMAND).is_ok());
    assert!(allowed.check_allowed(DESTROY_COMMAND).is_ok());
    assert_eq!(
        denied.check_allowed(DESTROY_COMMAND).unwrap_err().kind(),
        ErrorKind::Config
    );
}

#[test]
fn test_explicit_cache_id_wins() {
    let config = config(&[("DHCTL_CACHE_ID", "prod-eu"), ("DHCTL_SSH_HOSTS", "10.0.0.1")]).unwrap();

    assert_eq!(config.cache_identity(), "prod-eu");
}

#[test]
fn test_debug_log_path_override() {
    let config = config(&[("DHCTL_DEBUG_LOG_FILE_PATH", "/var/log/dhctl.log"), ("DHCTL_DEBUG", "true")]).unwrap();

    let logging = config.logging();

    assert!(logging.debug);
    assert_eq!(logging.debug_log_file, Some(PathBuf::from("/var/log/dhctl.log")));
}

#[test]
fn test_commander_params_read_files() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = dir.path().join("cluster.yaml");
    std::fs::write(&cluster, crate::testing::STATIC_CLUSTER_YAML).unwrap();
    let config = config(&[
        ("DHCTL_COMMANDER_MODE", "true"),
        ("DHCTL_COMMANDER_CLUSTER_CONFIG", cluster.to_str().unwrap()),
    ])
    .unwrap();

    let params = config.commander_params().unwrap().unwrap();

    assert_eq!(params.cluster_configuration, crate::testing::STATIC_CLUSTER_YAML);
    assert!(params.provider_cluster_configuration.is_none());
}

#[test]
fn test_commander_mode_without_config_is_error() {
    let config = config(&[("DHCTL_COMMANDER_MODE", "true")]).unwrap();

    assert_eq!(config.commander_params().unwrap_err().kind(), ErrorKind::Config);
}
