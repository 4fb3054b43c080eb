use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::async_task::spawn_task;
use crate::async_task::task_with_timeout_and_exponential_backoff;
use crate::BackoffPolicy;
use crate::Error;
use crate::StorageError;

fn policy(max_retries: usize) -> BackoffPolicy {
    BackoffPolicy {
        base_delay_ms: 10,
        max_delay_ms: 100,
        timeout_ms: 100,
        max_retries,
    }
}

fn unavailable() -> Error {
    StorageError::Unavailable("dummy".to_string()).into()
}

#[tokio::test]
async fn test_task_with_timeout_and_exponential_backoff_success() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let task = move || {
        let counter = counter_clone.clone();
        async move {
            let current = counter.fetch_add(1, Ordering::SeqCst);
            if current == 0 {
                Err(unavailable())
            } else {
                Ok::<_, Error>(current)
            }
        }
    };

    let result = task_with_timeout_and_exponential_backoff(task, policy(3)).await;

    assert_eq!(result.unwrap(), 1);
    assert_eq!(counter.load(Ordering::SeqCst), 2); // 1 failure + 1 success
}

#[tokio::test]
async fn test_task_with_timeout_and_exponential_backoff_max_retries() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let task = move || {
        let counter = counter_clone.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<u32, _>(unavailable())
        }
    };

    let result = task_with_timeout_and_exponential_backoff(task, policy(3)).await;

    assert!(matches!(result, Err(Error::Storage(StorageError::Unavailable(_)))));
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_task_with_timeout_and_exponential_backoff_timeout() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let task = move || {
        let counter = counter_clone.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<u32, Error>(1)
        }
    };

    let result = task_with_timeout_and_exponential_backoff(task, policy(2)).await;

    assert!(result.is_err());
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unlimited_retries_keep_going_until_success() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let task = move || {
        let counter = counter_clone.clone();
        async move {
            let current = counter.fetch_add(1, Ordering::SeqCst);
            if current < 20 {
                Err(unavailable())
            } else {
                Ok::<_, Error>(current)
            }
        }
    };

    let result = task_with_timeout_and_exponential_backoff(task, policy(0)).await;

    assert_eq!(result.unwrap(), 20);
    assert_eq!(counter.load(Ordering::SeqCst), 21);
}

#[tokio::test]
async fn test_spawn_task_tracks_handles() {
    let counter = Arc::new(AtomicU32::new(0));
    let mut handles = Vec::new();

    for _ in 0..3 {
        let counter = counter.clone();
        spawn_task(
            "increment",
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Some(&mut handles),
        );
    }
    spawn_task("failing", async { Err(unavailable()) }, Some(&mut handles));

    assert_eq!(handles.len(), 4);
    futures::future::join_all(handles).await;
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}
