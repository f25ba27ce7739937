use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::utils::async_task::spawn_task;
use crate::utils::async_task::with_timeout;
use crate::utils::async_task::Backoff;
use crate::BackoffPolicy;
use crate::Error;

fn policy(
    max_retries: usize,
    base_delay_ms: u64,
    max_delay_ms: u64,
) -> BackoffPolicy {
    BackoffPolicy {
        max_retries,
        timeout_ms: 100,
        base_delay_ms,
        max_delay_ms,
    }
}

#[test]
fn test_backoff_delay_grows_and_is_capped() {
    let mut backoff = Backoff::new(policy(0, 10, 80));

    let expected_ceilings = [10u64, 20, 40, 80, 80, 80];
    for ceiling in expected_ceilings {
        let delay = backoff.next_delay().expect("unlimited retries");
        let ms = delay.as_millis() as u64;
        assert!(ms >= ceiling / 2, "delay {ms} below half of {ceiling}");
        assert!(ms <= ceiling, "delay {ms} above {ceiling}");
    }
    assert_eq!(backoff.attempts(), 6);
}

#[test]
fn test_backoff_exhausts_after_max_retries() {
    let mut backoff = Backoff::new(policy(3, 1, 10));

    assert!(backoff.next_delay().is_some());
    assert!(backoff.next_delay().is_some());
    assert!(backoff.next_delay().is_some());
    assert!(backoff.next_delay().is_none());

    backoff.reset();
    assert_eq!(backoff.attempts(), 0);
    assert!(backoff.next_delay().is_some());
}

#[test]
fn test_backoff_zero_base_never_sleeps() {
    let mut backoff = Backoff::new(policy(2, 0, 0));
    assert_eq!(backoff.next_delay(), Some(Duration::ZERO));
    assert_eq!(backoff.op_timeout(), Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_with_timeout_reports_unavailable() {
    let result: crate::Result<()> = with_timeout(Duration::from_millis(50), "slow call", async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(())
    })
    .await;

    let err = result.unwrap_err();
    assert!(err.is_unavailable());
    assert!(err.to_string().contains("slow call"));
}

#[tokio::test]
async fn test_with_timeout_passes_through_result() {
    let ok = with_timeout(Duration::from_secs(1), "fast", async { Ok(7) }).await;
    assert_eq!(ok.unwrap(), 7);

    let err: crate::Result<u8> = with_timeout(Duration::from_secs(1), "fast", async {
        Err(Error::Fatal("boom".to_string()))
    })
    .await;
    assert!(matches!(err, Err(Error::Fatal(_))));
}

#[tokio::test]
async fn test_spawn_task_runs_to_completion() {
    let ran = Arc::new(AtomicBool::new(false));
    let ran_clone = ran.clone();

    let handle = spawn_task("probe", move || async move {
        ran_clone.store(true, Ordering::SeqCst);
        Ok(())
    });
    handle.await.unwrap();

    assert!(ran.load(Ordering::SeqCst));
}
