use std::sync::Arc;
use std::time::Duration;

use d_watch_cache::gather_metrics;
use d_watch_cache::Cacher;
use d_watch_cache::CacherConfig;
use d_watch_cache::ListOptions;
use d_watch_cache::MemStore;
use d_watch_cache::Object;
use d_watch_cache::Result;
use d_watch_cache::SelectionPredicate;
use d_watch_cache::WatchEvent;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Demo: a cacher in front of an in-memory store that keeps changing until
/// SIGINT/SIGTERM.
#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = CacherConfig::new()?.validate()?;
    let prefix = config.resource_prefix.clone();
    let store = Arc::new(MemStore::new(&prefix));
    for name in ["web-0", "web-1", "db-0"] {
        store.create(Object::new(Some("default"), name))?;
    }

    let cacher = Cacher::new(config, store.clone())?;
    let ctx = CancellationToken::new();
    cacher.ready().wait(&ctx).await?;
    info!(prefix = %prefix, rv = cacher.resource_version(), "cache ready");

    let opts = ListOptions {
        predicate: SelectionPredicate::everything().with_bookmarks(),
        send_initial_events: Some(true),
        ..ListOptions::recursive("")
    };
    let mut stream = cacher.watch(&ctx, &prefix, &opts).await?;
    tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            match &event {
                WatchEvent::Bookmark(obj) => {
                    info!(rv = obj.resource_version(), initial_end = obj.is_initial_events_end(), "bookmark")
                }
                WatchEvent::Error(status) => error!("watch error: {:?}", status),
                _ => info!(
                    rv = event.resource_version().unwrap_or_default(),
                    "{:?} {}",
                    event.event_type(),
                    event.object().map(Object::name).unwrap_or_default()
                ),
            }
        }
        info!("watch closed");
    });

    let writer_store = store.clone();
    let writer_ctx = ctx.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        let mut generation = 0u64;
        loop {
            tokio::select! {
                _ = writer_ctx.cancelled() => return,
                _ = ticker.tick() => {}
            }
            generation += 1;
            let obj = Object::new(Some("default"), "web-0").with_label("generation", &generation.to_string());
            if let Err(e) = writer_store.update(obj) {
                error!("update failed: {:?}", e);
            }
        }
    });

    wait_for_signal().await;
    ctx.cancel();
    cacher.stop();
    cacher.join().await;

    println!("{}", gather_metrics());
    println!("Exiting program.");
    Ok(())
}

async fn wait_for_signal() {
    let (mut sigint, mut sigterm) = match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        _ => {
            error!("failed to install signal handlers, falling back to ctrl_c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT detected."),
        _ = sigterm.recv() => info!("SIGTERM detected."),
    }
}
