#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity

use super::*;
use crate::ssh::{NativeSshProvider, SshSession};
use tokio_util::sync::CancellationToken;

fn ssh_provider() -> Arc<NativeSshProvider> {
    Arc::new(NativeSshProvider::new(
        SshSession::new("ubuntu", vec!["10.0.0.1".to_string()]),
        CancellationToken::new(),
    ))
}

#[tokio::test]
async fn test_error_provider_never_returns_client() {
    let provider = ErrorKubeProvider::new("abort mode", None);

    let err = provider.kube_client().await.err().unwrap();

    assert!(matches!(err, DestroyError::Precondition(_)));
    assert!(err.to_string().contains("abort mode"));
    assert!(!provider.is_reachable().await);
}

#[tokio::test]
async fn test_error_provider_cleanup_stops_ssh_once() {
    let ssh = ssh_provider();
    let provider = ErrorKubeProvider::new("cached state", Some(ssh.clone()));

    provider.cleanup(true).await;
    provider.cleanup(true).await;

    assert!(ssh.is_stopped());
}

#[tokio::test]
async fn test_lazy_provider_cleanup_without_ssh_stop_keeps_ssh() {
    let ssh = ssh_provider();
    let provider = LazyKubeProvider::new(None, Some(ssh.clone()));

    provider.cleanup(false).await;
    // Second call is a no-op even though it asks to stop ssh
    provider.cleanup(true).await;

    assert!(!ssh.is_stopped());
}

#[tokio::test]
async fn test_lazy_provider_refuses_client_after_cleanup() {
    let provider = LazyKubeProvider::new(None, None);
    provider.cleanup(false).await;

    let err = provider.kube_client().await.err().unwrap();

    assert!(matches!(err, DestroyError::Internal(_)));
}

#[tokio::test]
async fn test_lazy_provider_missing_kubeconfig_is_config_error() {
    let provider = LazyKubeProvider::new(Some("/nonexistent/kubeconfig".into()), None);

    let err = provider.kube_client().await.err().unwrap();

    assert!(matches!(err, DestroyError::Config(_)));
}
