use std::fmt;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use tokio::sync::mpsc;

use super::WatchEvent;

type StopHook = Box<dyn FnOnce() + Send>;

/// Receiving end of a watch.
///
/// Stopping (explicitly or by dropping the stream) unregisters the producer.
/// Events that were already buffered can still be received; the stream ends
/// once they are drained.
pub struct WatchStream {
    receiver: mpsc::Receiver<WatchEvent>,
    on_stop: Option<StopHook>,
}

impl WatchStream {
    pub fn new(receiver: mpsc::Receiver<WatchEvent>) -> Self {
        Self {
            receiver,
            on_stop: None,
        }
    }

    pub fn with_stop_hook(
        receiver: mpsc::Receiver<WatchEvent>,
        on_stop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            receiver,
            on_stop: Some(Box::new(on_stop)),
        }
    }

    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.receiver.recv().await
    }

    /// Next buffered event, without waiting.
    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn stop(&mut self) {
        if let Some(on_stop) = self.on_stop.take() {
            on_stop();
        }
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Stream for WatchStream {
    type Item = WatchEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl fmt::Debug for WatchStream {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("WatchStream").field("stopped", &self.on_stop.is_none()).finish()
    }
}
