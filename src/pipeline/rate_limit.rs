use std::{
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

/// Admits at most one frame per `interval`, measured between accepted frames.
///
/// Only called from inside the processor's in-flight guard, so the lock is
/// never contended on the frame path.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last_accepted: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_accepted: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns true and records `now` when enough time passed since the last
    /// accepted frame.
    pub fn try_admit(&self, now: Instant) -> bool {
        let mut last = self.last();
        if let Some(previous) = *last {
            // Out-of-order stamps yield `None` and are dropped.
            match now.checked_duration_since(previous) {
                Some(elapsed) if elapsed >= self.interval => {}
                _ => return false,
            }
        }
        *last = Some(now);
        true
    }

    pub fn reset(&self) {
        *self.last() = None;
    }

    fn last(&self) -> MutexGuard<'_, Option<Instant>> {
        match self.last_accepted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_is_always_admitted() {
        let limiter = RateLimiter::new(Duration::from_millis(125));
        assert!(limiter.try_admit(Instant::now()));
    }

    #[test]
    fn frames_inside_interval_are_dropped() {
        let limiter = RateLimiter::new(Duration::from_millis(125));
        let base = Instant::now();
        assert!(limiter.try_admit(base));
        assert!(!limiter.try_admit(base + Duration::from_millis(33)));
        assert!(!limiter.try_admit(base + Duration::from_millis(124)));
        assert!(limiter.try_admit(base + Duration::from_millis(125)));
        // Measured from the last accepted frame, not the last seen one.
        assert!(!limiter.try_admit(base + Duration::from_millis(200)));
        assert!(limiter.try_admit(base + Duration::from_millis(250)));
    }

    #[test]
    fn frames_stamped_before_creation_are_spaced_normally() {
        let earlier = Instant::now();
        std::thread::sleep(Duration::from_millis(20));
        let limiter = RateLimiter::new(Duration::from_millis(125));

        assert!(limiter.try_admit(earlier));
        assert!(!limiter.try_admit(earlier + Duration::from_millis(10)));
        assert!(limiter.try_admit(earlier + Duration::from_millis(130)));
    }

    #[test]
    fn out_of_order_timestamp_is_dropped() {
        let limiter = RateLimiter::new(Duration::from_millis(125));
        let base = Instant::now() + Duration::from_secs(1);
        assert!(limiter.try_admit(base));
        assert!(!limiter.try_admit(base - Duration::from_millis(500)));
    }

    #[test]
    fn reset_forgets_last_frame() {
        let limiter = RateLimiter::new(Duration::from_millis(125));
        let base = Instant::now();
        assert!(limiter.try_admit(base));
        limiter.reset();
        assert!(limiter.try_admit(base + Duration::from_millis(1)));
    }
}
