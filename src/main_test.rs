use super::*;
use dhctl::ErrorKind;

#[test]
fn test_invalid_invocation_exits_with_two() {
    let failure = Failure::Invalid(DestroyError::Config(
        "command \"destroy\" is not allowed, allowed: bootstrap".to_string(),
    ));

    assert_eq!(failure.exit_code(), 2);
    assert!(failure.message().starts_with("Error [config]: "));
}

#[test]
fn test_pipeline_failure_exits_with_one() {
    let failure = Failure::Pipeline(DestroyError::InfraEngine("quota exceeded".to_string()).in_phase("BaseInfra"));

    assert_eq!(failure.exit_code(), 1);
    assert_eq!(
        failure.message(),
        "Error [infra-engine]: phase BaseInfra: Infrastructure engine failed: quota exceeded"
    );
}

/// Test cancellation is a pipeline failure, not a clean exit
#[test]
fn test_cancellation_exits_with_one() {
    let failure = Failure::Pipeline(DestroyError::Cancelled);

    assert_eq!(failure.exit_code(), 1);
    assert!(matches!(&failure, Failure::Pipeline(e) if e.kind() == ErrorKind::Cancelled));
}
