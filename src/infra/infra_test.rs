#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity

use super::*;
use crate::error::DestroyError;
use crate::testing::{CLOUD_CLUSTER_YAML, PROVIDER_YAML};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

fn meta() -> MetaConfig {
    MetaConfig::parse(CLOUD_CLUSTER_YAML, Some(PROVIDER_YAML), "uuid").unwrap()
}

#[cfg(unix)]
fn script(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("engine.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[test]
fn test_step_for_node_group() {
    assert_eq!(InfraStep::for_node_group("master"), InfraStep::MasterNode);
    assert_eq!(InfraStep::for_node_group("khm"), InfraStep::StaticNode);
    assert_eq!(InfraStep::BaseInfrastructure.to_string(), "base-infrastructure");
}

#[test]
fn test_module_dir_and_args() {
    let engine = TerraformEngine::new(
        "terraform",
        "/deckhouse/candi/cloud-providers",
        "/tmp/work",
        CancellationToken::new(),
    );

    let dir = engine.module_dir(&meta(), InfraStep::MasterNode);
    let args = engine.destroy_args(&dir, Path::new("/tmp/work/n.tfstate"), Path::new("/tmp/work/n.tfvars.json"));

    assert_eq!(
        dir,
        PathBuf::from("/deckhouse/candi/cloud-providers/yandex/layouts/without-nat/master-node")
    );
    assert_eq!(
        args,
        vec![
            "-chdir=/deckhouse/candi/cloud-providers/yandex/layouts/without-nat/master-node",
            "destroy",
            "-auto-approve",
            "-input=false",
            "-no-color",
            "-state=/tmp/work/n.tfstate",
            "-var-file=/tmp/work/n.tfvars.json",
        ]
    );
}

/// Test the state written by the engine is returned
#[cfg(unix)]
#[tokio::test]
async fn test_destroy_node_returns_new_state() {
    // ARRANGE
    let dir = tempfile::tempdir().unwrap();
    let bin = script(
        dir.path(),
        r#"for arg in "$@"; do
  case "$arg" in
    -state=*) state="${arg#-state=}" ;;
  esac
done
printf 'destroyed' > "$state""#,
    );
    let engine = TerraformEngine::new(bin, dir.path(), dir.path().join("work"), CancellationToken::new());
    let meta = meta();

    // ACT
    let state = engine
        .destroy_node(NodeDestroyRequest {
            meta: &meta,
            node_group: "master",
            node_name: "test-master-0",
            node_index: 0,
            step: InfraStep::MasterNode,
            settings: br#"{"replicas":1}"#,
            state: b"{\"before\":true}",
        })
        .await
        .unwrap();

    // ASSERT
    assert_eq!(state, b"destroyed");
    assert!(!dir.path().join("work/test-master-0.tfvars.json").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_non_zero_exit_is_engine_error() {
    let dir = tempfile::tempdir().unwrap();
    let bin = script(dir.path(), "echo 'Error: quota exceeded' >&2\nexit 3");
    let engine = TerraformEngine::new(bin, dir.path(), dir.path().join("work"), CancellationToken::new());

    let err = engine.destroy_base_infra(&meta(), b"{}").await.unwrap_err();

    match err {
        DestroyError::InfraEngine(msg) => {
            assert!(msg.contains("quota exceeded"));
            assert!(msg.contains("test-base-infrastructure"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_cancellation_stops_engine() {
    let dir = tempfile::tempdir().unwrap();
    let bin = script(dir.path(), "sleep 30");
    let cancel = CancellationToken::new();
    let engine = TerraformEngine::new(bin, dir.path(), dir.path().join("work"), cancel.clone());
    cancel.cancel();

    let err = engine.destroy_base_infra(&meta(), b"{}").await.unwrap_err();

    assert!(err.is_cancelled());
}

/// Test a failed destroy hands back the state the engine managed to write
#[cfg(unix)]
#[tokio::test]
async fn test_failed_destroy_keeps_partial_state() {
    // ARRANGE
    let dir = tempfile::tempdir().unwrap();
    let bin = script(
        dir.path(),
        r#"for arg in "$@"; do
  case "$arg" in
    -state=*) state="${arg#-state=}" ;;
  esac
done
printf 'half-destroyed' > "$state"
echo 'Error: disk still attached' >&2
exit 1"#,
    );
    let engine = TerraformEngine::new(bin, dir.path(), dir.path().join("work"), CancellationToken::new());

    // ACT
    let err = engine.destroy_base_infra(&meta(), b"{}").await.unwrap_err();

    // ASSERT
    assert_eq!(err.kind(), crate::error::ErrorKind::InfraEngine);
    assert_eq!(err.partial_state(), Some(&b"half-destroyed"[..]));
    assert!(err.to_string().contains("disk still attached"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_failed_destroy_without_state_change_has_no_partial_state() {
    let dir = tempfile::tempdir().unwrap();
    let bin = script(dir.path(), "exit 2");
    let engine = TerraformEngine::new(bin, dir.path(), dir.path().join("work"), CancellationToken::new());

    let err = engine.destroy_base_infra(&meta(), b"{}").await.unwrap_err();

    assert!(err.partial_state().is_none());
}
