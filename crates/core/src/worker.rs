use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::sleep::StopSignal;

/// How long `stop()` waits for a background loop before detaching it.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// A named background thread with its own cancellation signal.
pub struct Worker {
    name: String,
    handle: JoinHandle<()>,
    done_rx: mpsc::Receiver<()>,
    stop: Arc<StopSignal>,
}

impl Worker {
    /// Spawn `f`, handing it the signal that `stop` will raise.
    pub fn spawn<F>(name: &str, f: F) -> std::io::Result<Self>
    where
        F: FnOnce(&StopSignal) + Send + 'static,
    {
        let stop = Arc::new(StopSignal::new());
        let signal = Arc::clone(&stop);
        let (done_tx, done_rx) = mpsc::channel();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            f(&signal);
            done_tx.send(()).ok();
        })?;
        Ok(Self { name: name.to_string(), handle, done_rx, stop })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Raise the signal without waiting.
    pub fn signal(&self) {
        self.stop.stop();
    }

    /// Raise the signal and join with the default deadline.
    pub fn stop(self) -> bool {
        self.stop.stop();
        self.join_timeout(JOIN_TIMEOUT)
    }

    /// Wait up to `timeout` for the thread to exit. A thread that overruns
    /// is detached and `false` is returned.
    pub fn join_timeout(self, timeout: Duration) -> bool {
        match self.done_rx.recv_timeout(timeout) {
            // Disconnected means the closure panicked before signalling.
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.handle.join().ok();
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_join_timeout_returns_when_done() {
        let w = Worker::spawn("quick", |_| {}).unwrap();
        assert_eq!(w.name(), "quick");
        assert!(w.join_timeout(Duration::from_secs(1)));
    }

    #[test]
    fn test_join_timeout_gives_up_on_slow_thread() {
        let w = Worker::spawn("slow", |_| thread::sleep(Duration::from_millis(500))).unwrap();
        let start = Instant::now();
        assert!(!w.join_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn test_stop_interrupts_long_wait() {
        let w = Worker::spawn("waiter", |stop| {
            stop.wait(Duration::from_secs(30));
        })
        .unwrap();
        let start = Instant::now();
        assert!(w.stop());
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
