use std::thread;
use std::time::{Duration, Instant};

/// Time source for every poll loop and backoff in the engine.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);

    fn elapsed_since(&self, start: Instant) -> Duration {
        self.now().saturating_duration_since(start)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

pub fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}
