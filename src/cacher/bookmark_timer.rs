use rand::Rng;
use tokio::time::Duration;
use tokio::time::Instant;

/// Jittered tick driving bookmark delivery.
#[derive(Clone, Debug)]
pub(crate) struct BookmarkTimer {
    next_deadline: Instant,
    tick_interval: Duration,
    jitter_factor: f64,
}

impl BookmarkTimer {
    pub(crate) fn new(
        tick_interval: Duration,
        jitter_factor: f64,
    ) -> Self {
        Self {
            next_deadline: Instant::now() + Self::random_duration(tick_interval, jitter_factor),
            tick_interval,
            jitter_factor,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.next_deadline = Instant::now() + Self::random_duration(self.tick_interval, self.jitter_factor);
    }

    /// `interval` scaled by a random factor in `[1 - jitter, 1 + jitter]`.
    pub(crate) fn random_duration(
        interval: Duration,
        jitter_factor: f64,
    ) -> Duration {
        if jitter_factor <= 0.0 {
            return interval;
        }
        let mut rng = rand::thread_rng();
        let factor = rng.gen_range((1.0 - jitter_factor)..=(1.0 + jitter_factor));
        interval.mul_f64(factor)
    }

    pub(crate) fn next_deadline(&self) -> Instant {
        self.next_deadline
    }

    #[cfg(test)]
    pub(crate) fn remaining(&self) -> Duration {
        self.next_deadline.saturating_duration_since(Instant::now())
    }

    #[cfg(test)]
    pub(crate) fn is_expired(&self) -> bool {
        self.next_deadline <= Instant::now()
    }
}
