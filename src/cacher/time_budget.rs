use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

struct BudgetState {
    available: Duration,
    last_refresh: Instant,
}

/// Time the dispatcher may spend waiting on blocked watchers.
///
/// The budget is refilled by `refresh_per_second` for every elapsed second,
/// up to `max`. Refill happens lazily whenever the budget is read.
pub(crate) struct TimeBudget {
    state: Mutex<BudgetState>,
    max: Duration,
    refresh_per_second: Duration,
}

impl TimeBudget {
    pub(crate) fn new(
        max: Duration,
        refresh_per_second: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(BudgetState {
                available: max,
                last_refresh: Instant::now(),
            }),
            max,
            refresh_per_second,
        }
    }

    /// Takes the whole accumulated budget, leaving zero behind.
    pub(crate) fn take_available(&self) -> Duration {
        let mut state = self.state.lock();
        self.refill_locked(&mut state);
        std::mem::take(&mut state.available)
    }

    /// Gives back the part of a taken budget that was not spent.
    pub(crate) fn return_unused(
        &self,
        unused: Duration,
    ) {
        let mut state = self.state.lock();
        state.available = (state.available + unused).min(self.max);
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> Duration {
        let mut state = self.state.lock();
        self.refill_locked(&mut state);
        state.available
    }

    fn refill_locked(
        &self,
        state: &mut BudgetState,
    ) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refresh);
        if elapsed.is_zero() {
            return;
        }
        let refill = self.refresh_per_second.mul_f64(elapsed.as_secs_f64());
        state.available = (state.available + refill).min(self.max);
        state.last_refresh = now;
    }
}
