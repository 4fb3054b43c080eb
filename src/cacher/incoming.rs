use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Notify;

use super::watch_cache::CacheUpdate;

struct Shared {
    pending: AtomicUsize,
    capacity: usize,
    space: Notify,
}

/// Producer side of the queue between the watch cache and the dispatcher.
///
/// `push` never blocks: it is called while the watch cache write lock is held.
/// Back-pressure is applied one step earlier, by the reflector awaiting
/// [`IncomingQueue::wait_for_capacity`] before it applies the next event.
#[derive(Clone)]
pub(crate) struct IncomingQueue {
    tx: mpsc::UnboundedSender<CacheUpdate>,
    shared: Arc<Shared>,
}

pub(crate) struct IncomingReceiver {
    rx: mpsc::UnboundedReceiver<CacheUpdate>,
    shared: Arc<Shared>,
}

impl IncomingQueue {
    pub(crate) fn new(capacity: usize) -> (Self, IncomingReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending: AtomicUsize::new(0),
            capacity,
            space: Notify::new(),
        });
        (
            Self {
                tx,
                shared: shared.clone(),
            },
            IncomingReceiver { rx, shared },
        )
    }

    pub(crate) fn push(
        &self,
        update: CacheUpdate,
    ) {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(update).is_err() {
            // dispatcher is gone
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub(crate) async fn wait_for_capacity(&self) {
        loop {
            let notified = self.shared.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.pending.load(Ordering::Acquire) < self.shared.capacity {
                return;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }
}

impl IncomingReceiver {
    pub(crate) async fn recv(&mut self) -> Option<CacheUpdate> {
        let update = self.rx.recv().await?;
        self.shared.pending.fetch_sub(1, Ordering::AcqRel);
        self.shared.space.notify_waiters();
        Some(update)
    }
}
