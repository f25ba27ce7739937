use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use super::KvBackend;
use super::KvEvent;
use super::KvEventType;
use super::KvWatchStream;
use super::TxnOutcome;
use crate::Error;
use crate::StorageError;

/// Test suite for KvBackend implementations
///
/// Every backend must pass the same behavioural checks. Implement
/// `KvBackendBuilder` for the backend and call `run_all_tests`.
pub struct KvBackendTestSuite;

/// Builder trait for creating KvBackend instances for testing
#[async_trait]
pub trait KvBackendBuilder: Send + Sync {
    /// Create a new, empty backend instance
    async fn build(&self) -> Result<Arc<dyn KvBackend>, Error>;

    /// Clean up any resources after testing
    async fn cleanup(&self) -> Result<(), Error>;
}

async fn next_event(stream: &mut KvWatchStream) -> KvEvent {
    timeout(Duration::from_secs(2), stream.recv())
        .await
        .expect("watch event in time")
        .expect("stream open")
        .expect("event, not error")
}

fn succeeded_revision(outcome: TxnOutcome) -> u64 {
    match outcome {
        TxnOutcome::Succeeded { revision } => revision,
        TxnOutcome::Failed { current } => panic!("expected success, current: {current:?}"),
    }
}

impl KvBackendTestSuite {
    pub async fn run_all_tests<B: KvBackendBuilder>(builder: B) -> Result<(), Error> {
        Self::test_empty_backend(builder.build().await?).await?;
        Self::test_create_and_get(builder.build().await?).await?;
        Self::test_compare_and_swap(builder.build().await?).await?;
        Self::test_compare_and_delete(builder.build().await?).await?;
        Self::test_range_and_count(builder.build().await?).await?;
        Self::test_historical_range(builder.build().await?).await?;
        Self::test_compaction(builder.build().await?).await?;
        Self::test_watch_replay_then_live(builder.build().await?).await?;
        Self::test_watch_from_now(builder.build().await?).await?;
        Self::test_expire(builder.build().await?).await?;

        builder.cleanup().await?;
        Ok(())
    }

    async fn test_empty_backend(backend: Arc<dyn KvBackend>) -> Result<(), Error> {
        assert_eq!(backend.current_revision(), 1);
        assert!(backend.get("/a").await?.is_none());
        assert_eq!(backend.count("/").await?, 0);
        assert!(backend.range("/", 0).await?.kvs.is_empty());
        Ok(())
    }

    async fn test_create_and_get(backend: Arc<dyn KvBackend>) -> Result<(), Error> {
        let rev = succeeded_revision(backend.create("/a", b"one".to_vec(), None).await?);
        assert_eq!(rev, 2);

        let kv = backend.get("/a").await?.unwrap();
        assert_eq!(kv.value, b"one");
        assert_eq!(kv.create_revision, 2);
        assert_eq!(kv.mod_revision, 2);
        assert_eq!(kv.version, 1);

        // Second create fails and reports what is there
        match backend.create("/a", b"two".to_vec(), None).await? {
            TxnOutcome::Failed { current } => assert_eq!(current.unwrap().value, b"one"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(backend.current_revision(), 2);
        Ok(())
    }

    async fn test_compare_and_swap(backend: Arc<dyn KvBackend>) -> Result<(), Error> {
        backend.create("/a", b"v1".to_vec(), None).await?;

        let rev = succeeded_revision(backend.compare_and_swap("/a", 2, b"v2".to_vec(), None).await?);
        assert_eq!(rev, 3);
        let kv = backend.get("/a").await?.unwrap();
        assert_eq!(kv.create_revision, 2);
        assert_eq!(kv.mod_revision, 3);
        assert_eq!(kv.version, 2);

        // Stale expectation loses and sees the winner
        match backend.compare_and_swap("/a", 2, b"v3".to_vec(), None).await? {
            TxnOutcome::Failed { current } => assert_eq!(current.unwrap().mod_revision, 3),
            other => panic!("unexpected {other:?}"),
        }

        // Missing key
        assert_eq!(
            backend.compare_and_swap("/missing", 1, b"x".to_vec(), None).await?,
            TxnOutcome::Failed { current: None }
        );
        Ok(())
    }

    async fn test_compare_and_delete(backend: Arc<dyn KvBackend>) -> Result<(), Error> {
        backend.create("/a", b"v1".to_vec(), None).await?;
        backend.create("/b", b"v1".to_vec(), None).await?;

        assert!(matches!(
            backend.compare_and_delete("/a", 7).await?,
            TxnOutcome::Failed { current: Some(_) }
        ));
        assert_eq!(succeeded_revision(backend.compare_and_delete("/a", 2).await?), 4);
        assert!(backend.get("/a").await?.is_none());

        // Unconditional
        assert_eq!(succeeded_revision(backend.compare_and_delete("/b", 0).await?), 5);
        assert_eq!(
            backend.compare_and_delete("/b", 0).await?,
            TxnOutcome::Failed { current: None }
        );
        Ok(())
    }

    async fn test_range_and_count(backend: Arc<dyn KvBackend>) -> Result<(), Error> {
        backend.create("/pods/ns1/b", b"b".to_vec(), None).await?;
        backend.create("/pods/ns1/a", b"a".to_vec(), None).await?;
        backend.create("/pods/ns2/c", b"c".to_vec(), None).await?;
        backend.create("/services/ns1/x", b"x".to_vec(), None).await?;

        let result = backend.range("/pods/", 0).await?;
        let keys: Vec<_> = result.kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/pods/ns1/a", "/pods/ns1/b", "/pods/ns2/c"]);
        assert_eq!(result.revision, 5);

        assert_eq!(backend.count("/pods/ns1/").await?, 2);
        assert_eq!(backend.count("/").await?, 4);
        Ok(())
    }

    async fn test_historical_range(backend: Arc<dyn KvBackend>) -> Result<(), Error> {
        backend.create("/p/a", b"a1".to_vec(), None).await?; // 2
        backend.create("/p/b", b"b1".to_vec(), None).await?; // 3
        backend.compare_and_swap("/p/a", 2, b"a2".to_vec(), None).await?; // 4
        backend.compare_and_delete("/p/b", 0).await?; // 5
        backend.create("/p/c", b"c1".to_vec(), None).await?; // 6

        let at3 = backend.range("/p/", 3).await?;
        assert_eq!(at3.revision, 3);
        let values: Vec<_> = at3.kvs.iter().map(|kv| kv.value.clone()).collect();
        assert_eq!(values, vec![b"a1".to_vec(), b"b1".to_vec()]);

        let at5 = backend.range("/p/", 5).await?;
        let values: Vec<_> = at5.kvs.iter().map(|kv| kv.value.clone()).collect();
        assert_eq!(values, vec![b"a2".to_vec()]);

        let err = backend.range("/p/", 9).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Storage(StorageError::Timeout {
                requested: 9,
                current: 6
            })
        ));
        Ok(())
    }

    async fn test_compaction(backend: Arc<dyn KvBackend>) -> Result<(), Error> {
        for i in 0..5 {
            backend.create(&format!("/c/{i}"), vec![i], None).await?;
        }

        backend.compact(4).await?;
        // Idempotent below the floor
        backend.compact(3).await?;
        assert!(backend.compact(7).await.unwrap_err().is_invalid());

        assert!(backend.range("/c/", 3).await.unwrap_err().is_too_old());
        assert_eq!(backend.range("/c/", 4).await?.kvs.len(), 3);

        let err = backend.watch("/c/", 4).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Storage(StorageError::TooOld {
                requested: 4,
                oldest: 5
            })
        ));

        let mut stream = backend.watch("/c/", 5).await?;
        assert_eq!(next_event(&mut stream).await.revision, 5);
        assert_eq!(next_event(&mut stream).await.revision, 6);
        Ok(())
    }

    async fn test_watch_replay_then_live(backend: Arc<dyn KvBackend>) -> Result<(), Error> {
        backend.create("/w/a", b"1".to_vec(), None).await?; // 2
        backend.create("/other/x", b"1".to_vec(), None).await?; // 3
        backend.compare_and_swap("/w/a", 2, b"2".to_vec(), None).await?; // 4

        let mut stream = backend.watch("/w/", 2).await?;
        backend.compare_and_delete("/w/a", 0).await?; // 5

        let first = next_event(&mut stream).await;
        assert_eq!((first.revision, first.event_type), (2, KvEventType::Put));
        assert!(first.prev_kv.is_none());

        let second = next_event(&mut stream).await;
        assert_eq!(second.revision, 4);
        assert_eq!(second.prev_kv.as_ref().unwrap().value, b"1");

        let third = next_event(&mut stream).await;
        assert_eq!((third.revision, third.event_type), (5, KvEventType::Delete));
        assert_eq!(third.kv.mod_revision, 5);
        assert_eq!(third.prev_kv.unwrap().value, b"2");
        Ok(())
    }

    async fn test_watch_from_now(backend: Arc<dyn KvBackend>) -> Result<(), Error> {
        backend.create("/n/old", b"1".to_vec(), None).await?;

        let mut stream = backend.watch("/n/", 0).await?;
        backend.create("/n/new", b"1".to_vec(), None).await?;

        let event = next_event(&mut stream).await;
        assert_eq!(event.key(), "/n/new");
        assert_eq!(event.revision, 3);
        Ok(())
    }

    async fn test_expire(backend: Arc<dyn KvBackend>) -> Result<(), Error> {
        backend.create("/t/short", b"1".to_vec(), Some(1)).await?;
        backend.create("/t/forever", b"1".to_vec(), None).await?;

        let deadline = backend.get("/t/short").await?.unwrap().expires_at.unwrap();
        assert!(backend.expire(deadline - 1).await?.is_empty());

        let expired = backend.expire(deadline).await?;
        assert_eq!(expired, vec!["/t/short".to_string()]);
        assert!(backend.get("/t/short").await?.is_none());
        assert!(backend.get("/t/forever").await?.is_some());
        Ok(())
    }
}
