use std::sync::Arc;
use std::time::Duration;

use d_watch_cache::CacheError;
use d_watch_cache::Cacher;
use d_watch_cache::Error;
use d_watch_cache::EventType;
use d_watch_cache::ListOptions;
use d_watch_cache::MemStore;
use d_watch_cache::ReadyState;
use d_watch_cache::ReflectorState;
use d_watch_cache::SelectionPredicate;
use d_watch_cache::WatchEvent;
use tokio_util::sync::CancellationToken;

use crate::common::caught_up;
use crate::common::config;
use crate::common::drain;
use crate::common::enable_logger;
use crate::common::next_change;
use crate::common::pod;
use crate::common::ready_cacher;
use crate::common::seeded_store;
use crate::common::wait_until;
use crate::common::within;
use crate::common::PREFIX;

#[tokio::test]
async fn test_reads_wait_for_first_successful_list() {
    enable_logger();
    let store = seeded_store(&["a", "b"]);
    store.fail_next_lists(3);
    let cacher = Cacher::new(config(), store.clone()).unwrap();
    let ctx = CancellationToken::new();

    assert!(matches!(
        cacher.get_list(&ctx, PREFIX, &ListOptions::recursive("0")).await,
        Err(Error::Cache(CacheError::NotReady))
    ));

    // a watch blocks until the cache is ready instead of failing
    let mut stream = within(cacher.watch(&ctx, PREFIX, &ListOptions::recursive("0")))
        .await
        .unwrap();
    assert_eq!(cacher.ready().state(), ReadyState::Ready);
    wait_until(|| cacher.reflector_state() == ReflectorState::Watching).await;
    let list = cacher.get_list(&ctx, PREFIX, &ListOptions::recursive("0")).await.unwrap();
    assert_eq!(list.items.len(), 2);
    assert_eq!(list.resource_version, 2);
    assert!(matches!(next_change(&mut stream).await, WatchEvent::Added(_)));
}

#[tokio::test]
async fn test_stop_ends_every_watch_and_rejects_requests() {
    enable_logger();
    let store = seeded_store(&["a"]);
    let cacher = ready_cacher(store.clone(), config()).await;
    let ctx = CancellationToken::new();

    let mut streams = Vec::new();
    for _ in 0..3 {
        streams.push(cacher.watch(&ctx, PREFIX, &ListOptions::recursive("1")).await.unwrap());
    }
    store.create(pod("default", "b")).unwrap();
    caught_up(&cacher, 2).await;

    cacher.stop();
    within(cacher.join()).await;
    assert_eq!(cacher.watcher_count(), 0);

    for stream in &mut streams {
        // whatever was already delivered stays readable, then the stream ends
        let events = drain(stream).await;
        assert!(events.len() <= 1);
    }
    assert!(matches!(
        cacher.watch(&ctx, PREFIX, &ListOptions::recursive("1")).await,
        Err(Error::Cache(CacheError::Stopped))
    ));
}

/// Watchers that come and go leave nothing registered behind.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_watcher_churn_leaves_no_registrations() {
    enable_logger();
    let store = seeded_store(&["a"]);
    let cacher = Arc::new(ready_cacher(store.clone(), config()).await);

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let cacher = cacher.clone();
        tasks.push(tokio::spawn(async move {
            let ctx = CancellationToken::new();
            for i in 0..250 {
                let mut opts = ListOptions::recursive("0");
                if i % 2 == 0 {
                    opts.predicate = SelectionPredicate::everything().with_bookmarks();
                }
                if i % 5 == 0 {
                    opts.predicate = SelectionPredicate::new("", &format!("metadata.name=p{worker}-{i}")).unwrap();
                }
                if i % 7 == 0 {
                    opts.timeout = Some(Duration::from_millis(20));
                }
                let mut stream = cacher.watch(&ctx, PREFIX, &opts).await.unwrap();
                if i % 3 == 0 {
                    let _ = stream.try_recv();
                }
                drop(stream);
            }
        }));
    }
    for i in 0..50 {
        store.create(pod("default", &format!("churn-{i}"))).unwrap();
    }
    for task in tasks {
        within(task).await.unwrap();
    }

    wait_until(|| cacher.watcher_count() == 0 && cacher.bookmark_watcher_count() == 0).await;
}

/// A watch that hits its timeout ends and unregisters itself.
#[tokio::test]
async fn test_watch_timeout_closes_stream() {
    enable_logger();
    let store = seeded_store(&["a"]);
    let cacher = ready_cacher(store.clone(), config()).await;

    let opts = ListOptions {
        timeout: Some(Duration::from_millis(100)),
        predicate: SelectionPredicate::everything().with_bookmarks(),
        ..ListOptions::recursive("1")
    };
    let mut stream = cacher.watch(&CancellationToken::new(), PREFIX, &opts).await.unwrap();
    assert_eq!(cacher.watcher_count(), 1);

    drain(&mut stream).await;
    wait_until(|| cacher.watcher_count() == 0 && cacher.bookmark_watcher_count() == 0).await;
}

/// A relist that only adds or changes objects is merged into history.
#[tokio::test]
async fn test_relist_without_deletions_keeps_watchers() {
    enable_logger();
    let store = seeded_store(&["a", "b"]);
    let cacher = ready_cacher(store.clone(), config()).await;
    let mut stream = cacher
        .watch(&CancellationToken::new(), PREFIX, &ListOptions::recursive("2"))
        .await
        .unwrap();

    store.close_watchers();
    store.create(pod("default", "c")).unwrap();
    store.update(pod("default", "a").with_label("v", "2")).unwrap();

    match next_change(&mut stream).await {
        WatchEvent::Added(obj) => assert_eq!((obj.name(), obj.resource_version()), ("c", 3)),
        other => panic!("unexpected event {:?}", other),
    }
    match next_change(&mut stream).await {
        WatchEvent::Modified(obj) => assert_eq!((obj.name(), obj.resource_version()), ("a", 4)),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(cacher.watcher_count(), 1);
    wait_until(|| cacher.ready().generation() >= 2).await;
}

/// A relist that removes objects invalidates history and ends older watches.
#[tokio::test]
async fn test_relist_with_deletions_terminates_watchers() {
    enable_logger();
    let store = seeded_store(&["a", "b"]);
    let cacher = ready_cacher(store.clone(), config()).await;
    let ctx = CancellationToken::new();
    let mut stream = cacher.watch(&ctx, PREFIX, &ListOptions::recursive("2")).await.unwrap();

    store.close_watchers();
    store.delete(Some("default"), "b").unwrap();

    let events = drain(&mut stream).await;
    assert!(events.iter().all(|e| e.event_type() != Some(EventType::Deleted)));
    wait_until(|| cacher.watcher_count() == 0).await;

    within(cacher.ready().wait(&ctx)).await.unwrap();
    caught_up(&cacher, 3).await;
    let list = cacher.get_list(&ctx, PREFIX, &ListOptions::recursive("0")).await.unwrap();
    let names: Vec<&str> = list.items.iter().map(|o| o.name()).collect();
    assert_eq!(names, vec!["a"]);

    // history now starts at the relist
    let mut fresh = cacher.watch(&ctx, PREFIX, &ListOptions::recursive("3")).await.unwrap();
    assert_eq!(cacher.watcher_count(), 1);
    store.create(pod("default", "c")).unwrap();
    assert_eq!(next_change(&mut fresh).await.resource_version(), Some(4));
}

#[tokio::test]
async fn test_reflector_recovers_after_storage_compaction() {
    enable_logger();
    let store = Arc::new(MemStore::with_limits(PREFIX, 1, 100));
    store.create(pod("default", "a")).unwrap();
    let cacher = ready_cacher(store.clone(), config()).await;

    store.close_watchers();
    store.create(pod("default", "b")).unwrap();
    store.create(pod("default", "c")).unwrap();
    store.compact();

    caught_up(&cacher, 3).await;
    let list = cacher
        .get_list(&CancellationToken::new(), PREFIX, &ListOptions::recursive("0"))
        .await
        .unwrap();
    assert_eq!(list.items.len(), 3);
}

/// Watches registered while the reflector keeps relisting all end up
/// receiving every later change.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_watch_registration_during_relists() {
    enable_logger();
    let store = seeded_store(&["a"]);
    let cacher = Arc::new(ready_cacher(store.clone(), config()).await);
    let opts = ListOptions {
        send_initial_events: Some(false),
        ..ListOptions::recursive("0")
    };

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let cacher = cacher.clone();
        let opts = opts.clone();
        tasks.push(tokio::spawn(async move {
            let ctx = CancellationToken::new();
            let mut streams = Vec::new();
            for _ in 0..20 {
                streams.push(cacher.watch(&ctx, PREFIX, &opts).await.unwrap());
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            streams
        }));
    }
    for _ in 0..10 {
        store.close_watchers();
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    let mut streams = Vec::new();
    for task in tasks {
        streams.extend(within(task).await.unwrap());
    }
    assert_eq!(cacher.watcher_count(), 120);

    let mut expected = Vec::new();
    for i in 0..5 {
        let created = store.create(pod("default", &format!("late-{i}"))).unwrap();
        expected.push(created.resource_version());
    }
    for stream in &mut streams {
        let mut versions = Vec::new();
        for _ in 0..expected.len() {
            match next_change(stream).await {
                WatchEvent::Added(obj) => versions.push(obj.resource_version()),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(versions, expected);
    }
    assert_eq!(cacher.watcher_count(), 120);
}
