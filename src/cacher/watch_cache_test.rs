use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing_test::traced_test;

use super::*;
use crate::test_utils::make_pod;
use crate::test_utils::pod_attrs;
use crate::test_utils::pod_key_func;
use crate::test_utils::pod_with_rv;
use crate::test_utils::Pod;
use crate::ApiObjectVersioner;
use crate::Error;
use crate::EventType;
use crate::StorageError;
use crate::StorageMetrics;

fn new_cache(capacity: usize) -> WatchCache<Pod> {
    WatchCache::new(
        capacity,
        pod_key_func(),
        pod_attrs(),
        Arc::new(ApiObjectVersioner),
        Duration::from_secs(3),
    )
}

fn on_node(
    name: &str,
    node: &str,
    resource_version: u64,
) -> Pod {
    let mut pod = pod_with_rv("ns", name, resource_version);
    pod.spec.node_name = node.to_string();
    pod
}

fn versions(events: &[Arc<WatchCacheEvent<Pod>>]) -> Vec<u64> {
    events.iter().map(|e| e.resource_version).collect()
}

fn node_indexers() -> Indexers<Pod> {
    let mut indexers = Indexers::new();
    let by_node: IndexFunc<Pod> = Arc::new(|pod: &Pod| Ok(vec![pod.spec.node_name.clone()]));
    indexers.insert("spec.nodeName".to_string(), by_node);
    indexers
}

// ============== Window ============== //

#[test]
fn test_window_of_two_evicts_oldest() {
    let cache = new_cache(2);
    cache.replace(vec![], 0).unwrap();

    cache.add(pod_with_rv("ns", "a", 1)).unwrap();
    cache.update(pod_with_rv("ns", "a", 2)).unwrap();
    cache.update(pod_with_rv("ns", "a", 3)).unwrap();

    let err = cache.get_all_events_since(0).unwrap_err();
    assert!(matches!(
        err,
        Error::Storage(StorageError::TooOld {
            requested: 0,
            oldest: 2
        })
    ));
    assert_eq!(versions(&cache.get_all_events_since(1).unwrap()), vec![2, 3]);
    assert_eq!(versions(&cache.get_all_events_since(2).unwrap()), vec![3]);
    assert!(cache.get_all_events_since(3).unwrap().is_empty());
}

#[test]
fn test_events_since_returns_ordered_history_with_prev_state() {
    let cache = new_cache(10);
    cache.replace(vec![], 1).unwrap();

    cache.add(on_node("a", "n1", 2)).unwrap();
    cache.update(on_node("a", "n2", 3)).unwrap();
    cache.add(on_node("b", "n1", 4)).unwrap();
    cache.delete(on_node("a", "n2", 5)).unwrap();

    let events = cache.get_all_events_since(1).unwrap();
    assert_eq!(versions(&events), vec![2, 3, 4, 5]);
    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![EventType::Added, EventType::Modified, EventType::Added, EventType::Deleted]
    );

    assert!(events[0].prev_object.is_none());
    assert_eq!(events[1].prev_object.as_ref().unwrap().spec.node_name, "n1");
    assert_eq!(events[1].prev_fields.get("spec.nodeName").map(String::as_str), Some("n1"));
    assert_eq!(events[1].fields.get("spec.nodeName").map(String::as_str), Some("n2"));
    assert_eq!(events[3].prev_object.as_ref().unwrap().metadata.resource_version, "3");

    assert_eq!(versions(&cache.get_all_events_since(3).unwrap()), vec![4, 5]);
    assert_eq!(cache.resource_version(), 5);
    assert_eq!(cache.list().len(), 1);
}

#[test]
fn test_replace_leaves_marker() {
    let cache = new_cache(5);
    cache.replace(vec![], 1).unwrap();
    for rv in 2..=6 {
        cache.add(pod_with_rv("ns", &format!("p{rv}"), rv)).unwrap();
    }

    cache
        .replace(vec![pod_with_rv("ns", "x", 8), pod_with_rv("ns", "y", 10)], 10)
        .unwrap();

    assert!(cache.get_all_events_since(10).unwrap().is_empty());
    assert!(cache.get_all_events_since(9).unwrap_err().is_too_old());
    assert_eq!(cache.resource_version(), 10);
    let keys: Vec<String> = cache.list().into_iter().map(|e| e.key).collect();
    assert_eq!(keys, vec!["/pods/ns/x".to_string(), "/pods/ns/y".to_string()]);

    cache.add(pod_with_rv("ns", "z", 11)).unwrap();
    assert_eq!(versions(&cache.get_all_events_since(10).unwrap()), vec![11]);
}

#[test]
fn test_largest_resource_version_does_not_overflow() {
    let cache = new_cache(3);
    cache.replace(vec![], 1).unwrap();
    cache.add(pod_with_rv("ns", "a", 2)).unwrap();
    assert!(cache.get_all_events_since(u64::MAX).unwrap().is_empty());

    let empty = new_cache(3);
    empty.replace(vec![], u64::MAX).unwrap();
    assert!(empty.get_all_events_since(u64::MAX).unwrap().is_empty());
    assert!(empty.get_all_events_since(u64::MAX - 2).unwrap_err().is_too_old());
}

#[test]
fn test_uninitialized_cache_is_unavailable() {
    let cache = new_cache(5);
    assert!(!cache.is_initialized());
    assert!(cache.get_all_events_since(0).unwrap_err().is_unavailable());
    assert!(cache.with_snapshot(|_, _| ()).unwrap_err().is_unavailable());

    cache.replace(vec![], 3).unwrap();
    assert!(cache.is_initialized());
    let (len, rv) = cache.with_snapshot(|elements, rv| (elements.len(), rv)).unwrap();
    assert_eq!((len, rv), (0, 3));
}

// ============== Event normalisation ============== //

#[test]
fn test_add_of_existing_key_becomes_modified() {
    let cache = new_cache(10);
    cache.replace(vec![pod_with_rv("ns", "a", 1)], 1).unwrap();

    cache.add(pod_with_rv("ns", "a", 2)).unwrap();
    cache.update(pod_with_rv("ns", "b", 3)).unwrap();

    let events = cache.get_all_events_since(1).unwrap();
    assert_eq!(events[0].event_type, EventType::Modified);
    assert!(events[0].prev_object.is_some());
    assert_eq!(events[1].event_type, EventType::Added);
    assert!(events[1].prev_object.is_none());
}

#[test]
fn test_delete_of_unknown_key_only_advances_version() {
    let cache = new_cache(10);
    cache.replace(vec![], 1).unwrap();

    cache.delete(pod_with_rv("ns", "ghost", 4)).unwrap();
    assert_eq!(cache.resource_version(), 4);
    assert!(cache.get_all_events_since(1).unwrap().is_empty());
}

#[test]
fn test_stale_resource_version_is_rejected() {
    let cache = new_cache(10);
    cache.replace(vec![], 5).unwrap();

    assert!(cache.add(pod_with_rv("ns", "a", 5)).unwrap_err().is_invalid());
    assert!(cache.add(pod_with_rv("ns", "a", 3)).unwrap_err().is_invalid());
    assert!(cache.list().is_empty());
}

#[test]
fn test_get_by_object_and_key() {
    let cache = new_cache(10);
    cache.replace(vec![on_node("a", "n1", 2)], 2).unwrap();

    let element = cache.get(&make_pod("ns", "a")).unwrap().unwrap();
    assert_eq!(element.key, "/pods/ns/a");
    assert_eq!(element.fields.get("spec.nodeName").map(String::as_str), Some("n1"));
    assert!(cache.get_by_key("/pods/ns/missing").is_none());
    assert!(cache.get(&make_pod("ns", "")).is_err());
}

// ============== Freshness ============== //

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_wait_until_fresh_blocks_until_version_lands() {
    let cache = Arc::new(new_cache(10));
    cache.replace(vec![], 1).unwrap();

    let waiter = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.wait_until_fresh_and_list(3, &[]).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    cache.add(pod_with_rv("ns", "a", 2)).unwrap();
    cache.add(pod_with_rv("ns", "b", 3)).unwrap();

    let (elements, rv) = waiter.await.unwrap().unwrap();
    assert_eq!(rv, 3);
    assert_eq!(elements.len(), 2);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_wait_until_fresh_times_out() {
    let cache = new_cache(10);
    cache.replace(vec![], 1).unwrap();

    let started = tokio::time::Instant::now();
    let err = cache.wait_until_fresh_and_get(7, "/pods/ns/a").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Storage(StorageError::Timeout {
            requested: 7,
            current: 1
        })
    ));
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test]
async fn test_wait_until_fresh_and_get_returns_element() {
    let cache = new_cache(10);
    cache.replace(vec![pod_with_rv("ns", "a", 2)], 2).unwrap();

    let (element, rv) = cache.wait_until_fresh_and_get(0, "/pods/ns/a").await.unwrap();
    assert_eq!(rv, 2);
    assert_eq!(element.unwrap().object.metadata.name, "a");
}

#[test]
fn test_update_resource_version_notifies_bookmark() {
    let cache = new_cache(10);
    cache.replace(vec![], 1).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    cache.set_event_handler(Arc::new(move |event| sink.lock().push(event)));

    cache.update_resource_version(5);
    // Not newer; ignored
    cache.update_resource_version(4);

    assert_eq!(cache.resource_version(), 5);
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].event_type, EventType::Bookmark);
    assert_eq!(seen[0].object.metadata.resource_version, "5");
    // Bookmarks are not history
    assert!(cache.get_all_events_since(1).unwrap().is_empty());
}

// ============== Indexes ============== //

#[tokio::test]
async fn test_list_by_index() {
    let cache = new_cache(10).with_indexers(node_indexers());
    cache
        .replace(vec![on_node("a", "n1", 2), on_node("b", "n2", 3), on_node("c", "n1", 4)], 4)
        .unwrap();

    let by_node = |node: &str| {
        vec![MatchValue {
            index_name: "spec.nodeName".to_string(),
            value: node.to_string(),
        }]
    };
    let names = |elements: Vec<StoreElement<Pod>>| -> Vec<String> {
        elements.into_iter().map(|e| e.object.metadata.name).collect()
    };

    let (n1, _) = cache.wait_until_fresh_and_list(0, &by_node("n1")).await.unwrap();
    assert_eq!(names(n1), vec!["a", "c"]);

    // Moving a pod re-indexes it
    cache.update(on_node("a", "n2", 5)).unwrap();
    let (n2, rv) = cache.wait_until_fresh_and_list(5, &by_node("n2")).await.unwrap();
    assert_eq!(names(n2), vec!["a", "b"]);
    assert_eq!(rv, 5);

    cache.delete(on_node("b", "n2", 6)).unwrap();
    let (n2, _) = cache.wait_until_fresh_and_list(6, &by_node("n2")).await.unwrap();
    assert_eq!(names(n2), vec!["a"]);

    // Unknown index falls back to everything
    let unknown = vec![MatchValue {
        index_name: "metadata.uid".to_string(),
        value: "x".to_string(),
    }];
    let (all, _) = cache.wait_until_fresh_and_list(0, &unknown).await.unwrap();
    assert_eq!(all.len(), 2);
}

// ============== Handler ============== //

#[test]
fn test_event_handler_runs_outside_the_lock() {
    let cache = Arc::new(new_cache(10));
    cache.replace(vec![], 1).unwrap();

    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    let reader = Arc::downgrade(&cache);
    cache.set_event_handler(Arc::new(move |event| {
        // Re-entering the cache would deadlock if the lock were still held
        let rv = reader.upgrade().map(|c| c.resource_version()).unwrap_or_default();
        sink.lock().push((event.resource_version, rv));
    }));

    cache.add(pod_with_rv("ns", "a", 2)).unwrap();
    cache.update(pod_with_rv("ns", "a", 3)).unwrap();

    assert_eq!(*observed.lock(), vec![(2, 2), (3, 3)]);
}

#[test]
fn test_metrics_track_evictions_and_too_old() {
    let metrics = Arc::new(StorageMetrics::new().unwrap());
    let cache = new_cache(2).with_metrics(metrics.clone(), "pods");
    cache.replace(vec![], 1).unwrap();
    for rv in 2..=4 {
        cache.add(pod_with_rv("ns", &format!("p{rv}"), rv)).unwrap();
    }
    assert!(cache.get_all_events_since(1).is_err());

    assert_eq!(metrics.watch_cache_evictions.with_label_values(&["pods"]).get(), 2);
    assert_eq!(metrics.watch_cache_too_old.with_label_values(&["pods"]).get(), 1);
    assert_eq!(metrics.watch_cache_replaces.with_label_values(&["pods"]).get(), 1);
    assert_eq!(
        metrics
            .watch_cache_events
            .with_label_values(&["pods", "ADDED"])
            .get(),
        3
    );
    assert_eq!(metrics.watch_cache_resource_version.with_label_values(&["pods"]).get(), 4);
}
