use rand::Rng;
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Sleep for exact milliseconds (no jitter).
pub fn sleep_ms(ms: u64) {
    thread::sleep(Duration::from_millis(ms));
}

/// Sleep for a uniformly random number of milliseconds in `[min_ms, max_ms]`.
pub fn sleep_between_ms(min_ms: u64, max_ms: u64) {
    let (lo, hi) = if min_ms <= max_ms { (min_ms, max_ms) } else { (max_ms, min_ms) };
    sleep_ms(rand::thread_rng().gen_range(lo..=hi));
}

/// Uniform draw in `[min, max]` seconds, tolerating swapped or equal bounds.
pub fn uniform_secs<R: Rng + ?Sized>(rng: &mut R, min: f64, max: f64) -> f64 {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    if hi - lo < f64::EPSILON {
        return lo;
    }
    rng.gen_range(lo..=hi)
}

/// Cooperative cancellation flag whose waits wake up as soon as it is raised.
///
/// Every background loop sleeps through `wait` instead of `thread::sleep`, so
/// `stop()` never has to sit out a multi-second poll interval.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        if let Ok(mut s) = self.stopped.lock() {
            *s = true;
        }
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        if let Ok(mut s) = self.stopped.lock() {
            *s = false;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.lock().map(|s| *s).unwrap_or(true)
    }

    /// Block for up to `dur`. Returns true if the signal was raised.
    pub fn wait(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        let Ok(mut stopped) = self.stopped.lock() else { return true };
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.cond.wait_timeout(stopped, deadline - now) {
                Ok((guard, _)) => stopped = guard,
                Err(_) => return true,
            }
        }
        true
    }

    pub fn wait_secs(&self, secs: f64) -> bool {
        self.wait(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    #[test]
    fn test_wait_times_out_when_not_stopped() {
        let sig = StopSignal::new();
        let start = Instant::now();
        assert!(!sig.wait(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_stop_wakes_waiter_early() {
        let sig = Arc::new(StopSignal::new());
        let waiter = Arc::clone(&sig);
        let start = Instant::now();
        let h = thread::spawn(move || waiter.wait(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        sig.stop();
        assert!(h.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_reset_rearms() {
        let sig = StopSignal::new();
        sig.stop();
        assert!(sig.wait(Duration::from_secs(1)));
        sig.reset();
        assert!(!sig.is_stopped());
        assert!(!sig.wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_uniform_secs_handles_swapped_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let v = uniform_secs(&mut rng, 10.0, 4.0);
            assert!((4.0..=10.0).contains(&v));
        }
        assert_eq!(uniform_secs(&mut rng, 3.0, 3.0), 3.0);
    }
}
