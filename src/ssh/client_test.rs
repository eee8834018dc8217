#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity

use super::*;
use crate::error::ErrorKind;
use crate::ssh::PrivateKey;

fn session() -> SshSession {
    let mut session = SshSession::new("d8-dhctl-converger", vec!["10.0.0.2".to_string()]);
    session.private_keys = vec![PrivateKey::new("/tmp/dhctl/destroy/id_rsa_destroyer.key.abc")];
    session
}

/// Session pointing at a local port nothing listens on
fn refused_session() -> SshSession {
    let mut session = SshSession::new("ubuntu", vec!["127.0.0.1".to_string()]);
    session.port = 1;
    session
}

#[test]
fn test_shell_quote_escapes_single_quotes() {
    assert_eq!(shell_quote("echo ok"), "'echo ok'");
    assert_eq!(shell_quote("it's"), r"'it'\''s'");
}

#[test]
fn test_sudo_command_wrapping() {
    let mut with_password = session();
    with_password.become_password = Some("secret".to_string());
    let client = NativeSshClient::new(with_password, CancellationToken::new());
    let passwordless = NativeSshClient::new(session(), CancellationToken::new());

    assert_eq!(
        client.remote_command("whoami", true),
        "sudo -S -p '' bash -c 'whoami'"
    );
    assert_eq!(
        passwordless.remote_command("whoami", true),
        "sudo -n bash -c 'whoami'"
    );
    assert_eq!(passwordless.remote_command("whoami", false), "whoami");
}

/// Test a host that refuses the connection is an error, never an exit code
#[tokio::test]
async fn test_refused_connection_is_remote_error() {
    // ARRANGE
    let client = NativeSshClient::new(refused_session(), CancellationToken::new());

    // ACT
    let err = client
        .run_command("true", true, Duration::from_secs(10))
        .await
        .unwrap_err();

    // ASSERT
    assert_eq!(err.kind(), ErrorKind::Remote);
    assert!(err.to_string().contains("127.0.0.1:1"));
}

#[tokio::test]
async fn test_download_from_refused_host_is_remote_error() {
    let client = NativeSshClient::new(refused_session(), CancellationToken::new());

    let err = client.download("/var/lib/bashible/discovered-node-ip").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Remote);
}

#[tokio::test]
async fn test_missing_key_file_is_config_error() {
    let client = NativeSshClient::new(session(), CancellationToken::new());

    let err = client
        .run_command("true", false, Duration::from_secs(10))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Config);
}

#[tokio::test]
async fn test_session_without_hosts_is_precondition_error() {
    let client = NativeSshClient::new(SshSession::new("ubuntu", Vec::new()), CancellationToken::new());

    let err = client
        .run_command("true", false, Duration::from_secs(10))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Precondition);
}

#[tokio::test]
async fn test_cancelled_client_stops_before_connecting() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let client = NativeSshClient::new(refused_session(), cancel);

    let err = client
        .run_command("true", false, Duration::from_secs(10))
        .await
        .unwrap_err();

    // Either branch may win the race with an instant refusal
    assert!(matches!(err.kind(), ErrorKind::Cancelled | ErrorKind::Remote));
}

/// Test the exit status the command reported is kept as is
#[test]
fn test_collector_keeps_reported_exit_status() {
    let mut output = OutputCollector::default();
    output.stdout(b"cleaning\n");
    output.stderr(b"warning\n");
    output.exit(1);

    let output = output.finish();

    assert_eq!(output.exit_code, 1);
    assert_eq!(output.stdout, "cleaning\n");
    assert_eq!(output.stderr, "warning\n");
}

/// Test a started command whose connection dropped reports the lost-connection code
#[test]
fn test_collector_without_exit_status_is_connection_lost() {
    let mut output = OutputCollector::default();
    output.stdout(b"rebooting\n");

    assert_eq!(output.finish().exit_code, CONNECTION_LOST_EXIT_CODE);
}

#[test]
fn test_collector_signal_is_connection_lost() {
    let mut output = OutputCollector::default();
    output.killed("TERM");

    assert_eq!(output.finish().exit_code, CONNECTION_LOST_EXIT_CODE);
}

#[tokio::test]
async fn test_provider_switch_and_stop() {
    let provider = NativeSshProvider::new(
        SshSession::new("ubuntu", vec!["10.0.0.1".to_string()]),
        CancellationToken::new(),
    );

    let initial = provider.client().await.unwrap();
    assert_eq!(initial.session().user, "ubuntu");

    provider.switch_client(session()).await.unwrap();
    let switched = provider.client().await.unwrap();
    assert_eq!(switched.session().user, "d8-dhctl-converger");

    provider.stop();
    provider.stop();
    assert!(provider.is_stopped());
    assert!(provider.client().await.is_err());
}
