use super::*;

#[test]
fn test_kind_sees_through_phase_wrapper() {
    let err = DestroyError::InfraEngine("exit status 1".to_string()).in_phase("AllNodesPhase");

    assert_eq!(err.kind(), ErrorKind::InfraEngine);
    assert!(err.to_string().contains("AllNodesPhase"));
    assert!(err.to_string().contains("exit status 1"));
}

#[test]
fn test_nested_phase_wrappers_keep_innermost_kind() {
    let err = DestroyError::Config("no masters".to_string())
        .in_phase("inner")
        .in_phase("outer");

    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn test_cancelled_is_not_wrapped() {
    let err = DestroyError::Cancelled.in_phase("BaseInfraPhase");

    assert!(matches!(err, DestroyError::Cancelled));
    assert!(err.is_cancelled());
}

#[test]
fn test_tmp_lock_held_maps_to_lock_contended() {
    let err: DestroyError = TmpLockError::Held {
        path: "/tmp/dhctl/.dhctl-tmp-dir.lock".into(),
        holder: "alice@workstation $ dhctl destroy".to_string(),
    }
    .into();

    assert_eq!(err.kind(), ErrorKind::LockContended);
    assert!(err.to_string().contains("alice@workstation"));
}

#[test]
fn test_kind_names_are_stable() {
    assert_eq!(ErrorKind::LockContended.to_string(), "lock-contended");
    assert_eq!(ErrorKind::InfraEngine.as_str(), "infra-engine");
}

#[test]
fn test_partial_state_survives_phase_wrapping() {
    let err = DestroyError::InfraEnginePartial {
        message: "exit status 1".to_string(),
        state: b"{\"left\":1}".to_vec(),
    }
    .in_phase("AllNodesPhase");

    assert_eq!(err.kind(), ErrorKind::InfraEngine);
    assert_eq!(err.partial_state(), Some(&b"{\"left\":1}"[..]));
    assert!(DestroyError::InfraEngine("x".to_string()).partial_state().is_none());
}
