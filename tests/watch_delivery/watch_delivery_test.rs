use std::time::Duration;

use d_watch_cache::EventType;
use d_watch_cache::ListOptions;
use d_watch_cache::MemStore;
use d_watch_cache::SelectionPredicate;
use d_watch_cache::WatchEvent;
use tokio_util::sync::CancellationToken;

use crate::common::caught_up;
use crate::common::config;
use crate::common::enable_logger;
use crate::common::next_change;
use crate::common::next_event;
use crate::common::pod;
use crate::common::ready_cacher;
use crate::common::seeded_store;
use crate::common::within;
use crate::common::PREFIX;

fn summary(event: &WatchEvent) -> (Option<EventType>, String, u64) {
    (
        event.event_type(),
        event.object().map(|o| o.name().to_string()).unwrap_or_default(),
        event.resource_version().unwrap_or_default(),
    )
}

/// Every watcher sees the same changes in the order they were committed.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_watchers_see_identical_ordered_history() {
    enable_logger();
    let store = seeded_store(&["a", "b"]);
    let cacher = ready_cacher(store.clone(), config()).await;
    let ctx = CancellationToken::new();

    let mut first = cacher.watch(&ctx, PREFIX, &ListOptions::recursive("2")).await.unwrap();
    let mut second = cacher.watch(&ctx, PREFIX, &ListOptions::recursive("2")).await.unwrap();

    store.create(pod("default", "c")).unwrap();
    store.update(pod("default", "a").with_label("v", "2")).unwrap();
    store.delete(Some("default"), "b").unwrap();
    store.create(pod("kube-system", "d")).unwrap();

    let expected = vec![
        (Some(EventType::Added), "c".to_string(), 3),
        (Some(EventType::Modified), "a".to_string(), 4),
        (Some(EventType::Deleted), "b".to_string(), 5),
        (Some(EventType::Added), "d".to_string(), 6),
    ];
    for stream in [&mut first, &mut second] {
        let mut seen = Vec::new();
        for _ in 0..expected.len() {
            seen.push(summary(&next_change(stream).await));
        }
        assert_eq!(seen, expected);
    }
}

/// Watching from version N delivers every change after N exactly once.
#[tokio::test]
async fn test_watch_from_version_delivers_each_change_once() {
    enable_logger();
    let store = seeded_store(&["p1", "p2", "p3"]);
    let cacher = ready_cacher(store.clone(), config()).await;
    for i in 4..=8 {
        store.create(pod("default", &format!("p{i}"))).unwrap();
    }
    caught_up(&cacher, 8).await;

    let mut stream = cacher
        .watch(&CancellationToken::new(), PREFIX, &ListOptions::recursive("5"))
        .await
        .unwrap();
    store.create(pod("default", "p9")).unwrap();

    let mut versions = Vec::new();
    for _ in 0..4 {
        versions.push(next_change(&mut stream).await.resource_version().unwrap());
    }
    assert_eq!(versions, vec![6, 7, 8, 9]);
    assert!(stream.try_recv().is_none());
}

/// A start version older than the cache's history is served by the backing store.
#[tokio::test]
async fn test_watch_before_cached_history_is_served_by_storage() {
    enable_logger();
    let store = seeded_store(&["p1", "p2", "p3", "p4"]);
    let cacher = ready_cacher(store.clone(), config()).await;

    let mut stream = cacher
        .watch(&CancellationToken::new(), PREFIX, &ListOptions::recursive("2"))
        .await
        .unwrap();
    assert_eq!(cacher.watcher_count(), 0);

    assert_eq!(summary(&next_event(&mut stream).await), (Some(EventType::Added), "p3".to_string(), 3));
    assert_eq!(summary(&next_event(&mut stream).await), (Some(EventType::Added), "p4".to_string(), 4));
}

#[tokio::test]
async fn test_deleted_event_carries_last_state() {
    enable_logger();
    let store = std::sync::Arc::new(MemStore::new(PREFIX));
    store.create(pod("default", "a").with_label("app", "web")).unwrap();
    let cacher = ready_cacher(store.clone(), config()).await;

    let mut stream = cacher
        .watch(&CancellationToken::new(), PREFIX, &ListOptions::recursive("1"))
        .await
        .unwrap();
    store.delete(Some("default"), "a").unwrap();

    match next_change(&mut stream).await {
        WatchEvent::Deleted(obj) => {
            assert_eq!(obj.name(), "a");
            assert_eq!(obj.resource_version(), 2);
            assert_eq!(obj.labels().get("app").map(String::as_str), Some("web"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

/// Initial events are followed by an annotated bookmark, then live changes.
#[tokio::test]
async fn test_initial_events_end_with_annotated_bookmark() {
    enable_logger();
    let store = seeded_store(&["a", "b", "c"]);
    let cacher = ready_cacher(store.clone(), config()).await;
    caught_up(&cacher, 3).await;

    let opts = ListOptions {
        predicate: SelectionPredicate::everything().with_bookmarks(),
        send_initial_events: Some(true),
        ..ListOptions::recursive("")
    };
    let mut stream = cacher.watch(&CancellationToken::new(), PREFIX, &opts).await.unwrap();

    let mut names = Vec::new();
    for _ in 0..3 {
        match next_event(&mut stream).await {
            WatchEvent::Added(obj) => names.push(obj.name().to_string()),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(names, vec!["a", "b", "c"]);

    match next_event(&mut stream).await {
        WatchEvent::Bookmark(obj) => {
            assert!(obj.is_initial_events_end());
            assert_eq!(obj.resource_version(), 3);
        }
        other => panic!("unexpected event {:?}", other),
    }

    store.create(pod("default", "d")).unwrap();
    assert_eq!(summary(&next_change(&mut stream).await), (Some(EventType::Added), "d".to_string(), 4));
}

#[tokio::test]
async fn test_watch_filters_by_selector_and_key() {
    enable_logger();
    let store = std::sync::Arc::new(MemStore::new(PREFIX));
    store.create(pod("default", "a")).unwrap();
    let cacher = ready_cacher(store.clone(), config()).await;
    let ctx = CancellationToken::new();

    let labelled = ListOptions {
        predicate: SelectionPredicate::new("app=web", "").unwrap(),
        ..ListOptions::recursive("1")
    };
    let mut web = cacher.watch(&ctx, PREFIX, &labelled).await.unwrap();
    let single = ListOptions {
        recursive: false,
        ..ListOptions::recursive("0")
    };
    let mut only_a = cacher.watch(&ctx, "/registry/pods/default/a", &single).await.unwrap();
    // the current state of "a" is replayed first
    assert_eq!(summary(&next_event(&mut only_a).await), (Some(EventType::Added), "a".to_string(), 1));

    store.create(pod("default", "db").with_label("app", "db")).unwrap();
    store.create(pod("default", "web").with_label("app", "web")).unwrap();
    store.update(pod("default", "a").with_label("app", "web")).unwrap();

    assert_eq!(summary(&next_change(&mut web).await), (Some(EventType::Added), "web".to_string(), 3));
    assert_eq!(summary(&next_change(&mut web).await), (Some(EventType::Added), "a".to_string(), 4));
    assert_eq!(summary(&next_change(&mut only_a).await), (Some(EventType::Modified), "a".to_string(), 4));
}

/// Idle bookmark watchers get a bookmark roughly once per frequency.
#[tokio::test(start_paused = true)]
async fn test_idle_watcher_receives_periodic_bookmarks() {
    enable_logger();
    let store = seeded_store(&["a"]);
    let cacher = ready_cacher(store.clone(), config()).await;

    let opts = ListOptions {
        predicate: SelectionPredicate::everything().with_bookmarks(),
        ..ListOptions::recursive("1")
    };
    let mut stream = cacher.watch(&CancellationToken::new(), PREFIX, &opts).await.unwrap();

    match next_event(&mut stream).await {
        WatchEvent::Bookmark(obj) => {
            assert_eq!(obj.resource_version(), 1);
            assert!(!obj.is_initial_events_end());
        }
        other => panic!("unexpected event {:?}", other),
    }

    store.create(pod("default", "b")).unwrap();
    assert_eq!(summary(&next_event(&mut stream).await), (Some(EventType::Added), "b".to_string(), 2));

    let next_bookmark = within(async {
        loop {
            if let Some(WatchEvent::Bookmark(obj)) = stream.recv().await {
                return obj.resource_version();
            }
        }
    })
    .await;
    assert_eq!(next_bookmark, 2);

    // nothing newer to report
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(stream.try_recv().is_none());
}

/// A flood of writes read by a fast and a slow watcher never goes back in time.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flood_is_delivered_in_increasing_order_to_readers_of_any_speed() {
    enable_logger();
    const EVENTS: usize = 300;
    let store = std::sync::Arc::new(MemStore::with_limits(PREFIX, 1000, 1000));
    let mut config = config();
    config.dispatch.watcher_channel_size = 1000;
    let cacher = ready_cacher(store.clone(), config).await;
    let ctx = CancellationToken::new();
    let opts = ListOptions {
        send_initial_events: Some(false),
        ..ListOptions::recursive("0")
    };

    let mut readers = Vec::new();
    for pause in [None, Some(Duration::from_millis(1))] {
        let mut stream = cacher.watch(&ctx, PREFIX, &opts).await.unwrap();
        readers.push(tokio::spawn(async move {
            let mut last = 0;
            for _ in 0..EVENTS {
                let rv = next_change(&mut stream).await.resource_version().unwrap();
                assert!(rv > last, "version {} delivered after {}", rv, last);
                last = rv;
                if let Some(pause) = pause {
                    tokio::time::sleep(pause).await;
                }
            }
            last
        }));
    }

    for i in 0..EVENTS {
        store.create(pod("default", &format!("flood-{i}"))).unwrap();
    }
    for reader in readers {
        let last = tokio::time::timeout(Duration::from_secs(20), reader)
            .await
            .expect("reader timed out")
            .unwrap();
        assert_eq!(last, EVENTS as u64);
    }
}
