use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
async fn test_retry_succeeds_after_transient_failures() {
    let calls = Arc::new(AtomicUsize::new(0));
    let retry = RetryLoop::new("wait deployment", 5, Duration::from_millis(1));

    let counter = calls.clone();
    let result = retry
        .run(|| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(DestroyError::Remote("still present".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

    assert_eq!(result.ok(), Some(3));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_returns_last_error_when_exhausted() {
    let calls = Arc::new(AtomicUsize::new(0));
    let retry = RetryLoop::new("wait pvc", 4, Duration::from_millis(1));

    let counter = calls.clone();
    let result: Result<()> = retry
        .run(|| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(DestroyError::Remote(format!("attempt {n}")))
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(result.unwrap_err().to_string().contains("attempt 3"));
}

#[tokio::test]
async fn test_config_errors_are_not_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let retry = RetryLoop::new("parse", 10, Duration::from_millis(1));

    let counter = calls.clone();
    let result: Result<()> = retry
        .run(|| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DestroyError::Config("bad yaml".to_string()))
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(result, Err(DestroyError::Config(_))));
}

/// Test cancellation interrupts the wait between attempts
#[tokio::test]
async fn test_cancel_interrupts_sleep() {
    let token = CancellationToken::new();
    let retry = RetryLoop::new("wait pv", 100, Duration::from_secs(3600)).with_cancel(token.clone());

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let result: Result<()> = retry
        .run(|| async { Err(DestroyError::Remote("not yet".to_string())) })
        .await;

    assert!(matches!(result, Err(DestroyError::Cancelled)));
}

#[tokio::test]
async fn test_cancelled_before_start_never_calls_op() {
    let token = CancellationToken::new();
    token.cancel();
    let calls = Arc::new(AtomicUsize::new(0));
    let retry = RetryLoop::new("noop", 3, Duration::from_millis(1)).with_cancel(token);

    let counter = calls.clone();
    let result = retry
        .run(|| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

    assert!(matches!(result, Err(DestroyError::Cancelled)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_zero_attempts_means_one() {
    assert_eq!(RetryLoop::new("x", 0, Duration::ZERO).attempts(), 1);
}
