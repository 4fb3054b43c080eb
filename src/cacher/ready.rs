use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::CacheError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Pending,
    Ready,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status {
    state: ReadyState,
    generation: u64,
}

/// Readiness gate of a cacher: `Pending -> Ready -> Stopped`.
///
/// Every `Pending -> Ready` transition bumps the generation, so a caller can
/// tell whether the cache was re-initialized in between two observations.
/// `Stopped` is terminal.
#[derive(Debug)]
pub struct Ready {
    tx: watch::Sender<Status>,
}

impl Default for Ready {
    fn default() -> Self {
        Self::new()
    }
}

impl Ready {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Status {
            state: ReadyState::Pending,
            generation: 0,
        });
        Self { tx }
    }

    /// Blocks until the cache is Ready and returns its generation.
    pub async fn wait(
        &self,
        ctx: &CancellationToken,
    ) -> Result<u64> {
        let mut rx = self.tx.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            match status.state {
                ReadyState::Ready => return Ok(status.generation),
                ReadyState::Stopped => return Err(CacheError::Stopped.into()),
                ReadyState::Pending => {}
            }

            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(CacheError::InitializationTimeout.into()),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(CacheError::Stopped.into());
                    }
                }
            }
        }
    }

    /// Non-blocking variant of [`Ready::wait`].
    pub fn check(&self) -> Result<u64> {
        let status = *self.tx.borrow();
        match status.state {
            ReadyState::Ready => Ok(status.generation),
            ReadyState::Pending => Err(CacheError::NotReady.into()),
            ReadyState::Stopped => Err(CacheError::Stopped.into()),
        }
    }

    pub fn set(
        &self,
        ready: bool,
    ) {
        self.tx.send_if_modified(|status| match (status.state, ready) {
            (ReadyState::Pending, true) => {
                status.state = ReadyState::Ready;
                status.generation += 1;
                true
            }
            (ReadyState::Ready, false) => {
                status.state = ReadyState::Pending;
                true
            }
            _ => false,
        });
    }

    pub fn stop(&self) {
        self.tx.send_if_modified(|status| {
            if status.state == ReadyState::Stopped {
                return false;
            }
            status.state = ReadyState::Stopped;
            true
        });
    }

    pub fn state(&self) -> ReadyState {
        self.tx.borrow().state
    }

    pub fn generation(&self) -> u64 {
        self.tx.borrow().generation
    }
}
