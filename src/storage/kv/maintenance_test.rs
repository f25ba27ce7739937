use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use mockall::predicate::eq;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use super::*;
use crate::ApiStoreConfig;

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_expiry_worker_runs_every_interval() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut mock = MockKvBackend::new();
    mock.expect_expire().returning(move |_now| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(vec!["/lease/a".to_string()])
    });

    let shutdown = CancellationToken::new();
    let handle = spawn_expiry_worker(Arc::new(mock), 100, shutdown.clone());

    // Ticks at 0, 100 and 200 ms
    tokio::time::sleep(Duration::from_millis(250)).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_expire_deletes_through_write_path() {
    let backend = MemoryBackend::new(16);
    backend.create("/lease/a", b"1".to_vec(), Some(1)).await.unwrap();
    let mut stream = backend.watch("/lease/", 0).await.unwrap();

    let expired = backend.expire(u64::MAX).await.unwrap();
    assert_eq!(expired, vec!["/lease/a".to_string()]);

    let event = stream.recv().await.unwrap().unwrap();
    assert_eq!(event.event_type, KvEventType::Delete);
    assert_eq!(event.key(), "/lease/a");
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_compaction_worker_compacts_previous_tick_revision() {
    let mut mock = MockKvBackend::new();
    let mut seq = mockall::Sequence::new();

    // First tick only observes; second tick compacts what the first observed
    mock.expect_current_revision().times(1).in_sequence(&mut seq).return_const(5u64);
    mock.expect_compact()
        .with(eq(5u64))
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(()));
    mock.expect_current_revision().return_const(9u64);
    mock.expect_compact().with(eq(9u64)).returning(|_| Ok(()));

    let shutdown = CancellationToken::new();
    let handle = spawn_compaction_worker(Arc::new(mock), 1_000, shutdown.clone());

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn test_workers_stop_on_shutdown() {
    let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new(16));
    let shutdown = CancellationToken::new();

    let expiry = spawn_expiry_worker(backend.clone(), 10, shutdown.clone());
    let compaction = spawn_compaction_worker(backend, 10, shutdown.clone());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), expiry).await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(1), compaction).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_spawn_maintenance_follows_config() {
    let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new(16));
    let shutdown = CancellationToken::new();

    let mut config = ApiStoreConfig::default();
    assert_eq!(spawn_maintenance(backend.clone(), &config, shutdown.clone()).len(), 1);

    config.lease.enabled = true;
    config.storage.compaction_interval_ms = 0;
    let workers = spawn_maintenance(backend.clone(), &config, shutdown.clone());
    assert_eq!(workers.len(), 1);

    config.storage.compaction_interval_ms = 50;
    let mut all = spawn_maintenance(backend, &config, shutdown.clone());
    assert_eq!(all.len(), 2);
    all.extend(workers);

    shutdown.cancel();
    for worker in all {
        tokio::time::timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();
    }
}
