//! Cancellable one-shot timers backing zone auto-advance.
//!
//! Each timer owns a named thread that sleeps on a condvar until its deadline
//! or until cancelled. Cancelling joins the thread, so once `cancel` returns
//! the timer can no longer fire.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

/// Result of one attempt to apply the timer's effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireAttempt {
    /// The effect ran (or no longer applies); the timer is finished.
    Done,
    /// The target state was busy; try again shortly unless cancelled.
    Retry,
}

const RETRY_INTERVAL: Duration = Duration::from_millis(5);

struct TimerState {
    cancelled: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

impl TimerShared {
    /// Wait until `deadline` or cancellation; returns true if cancelled.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut guard = self.state.lock().expect("timer mutex poisoned");
        loop {
            if guard.cancelled {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .wake
                .wait_timeout(guard, deadline - now)
                .expect("timer condvar wait failed");
            guard = next;
        }
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().expect("timer mutex poisoned").cancelled
    }
}

/// Handle to an armed timer.
pub struct PhaseTimer {
    name: String,
    shared: Arc<TimerShared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PhaseTimer {
    /// Arm a timer that calls `fire` once `delay` has elapsed.
    ///
    /// `fire` may be invoked repeatedly while it returns `Retry`.
    pub fn spawn<F>(name: impl Into<String>, delay: Duration, mut fire: F) -> std::io::Result<Self>
    where
        F: FnMut() -> FireAttempt + Send + 'static,
    {
        let name = name.into();
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState { cancelled: false }),
            wake: Condvar::new(),
        });
        let deadline = Instant::now() + delay;
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            if thread_shared.wait_until(deadline) {
                return;
            }
            loop {
                if thread_shared.is_cancelled() {
                    return;
                }
                match fire() {
                    FireAttempt::Done => return,
                    FireAttempt::Retry => {
                        if thread_shared.wait_until(Instant::now() + RETRY_INTERVAL) {
                            return;
                        }
                    }
                }
            }
        })?;
        debug!(timer = %name, delay_ms = delay.as_millis() as u64, "timer armed");
        Ok(Self {
            name,
            shared,
            handle: Some(handle),
        })
    }

    /// Cancel and wait for the timer thread to terminate.
    pub fn cancel(mut self) {
        self.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    fn stop(&mut self) {
        {
            let mut guard = self.shared.state.lock().expect("timer mutex poisoned");
            guard.cancelled = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                debug!(timer = %self.name, "timer thread panicked");
            }
        }
        debug!(timer = %self.name, "timer cancelled");
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

impl fmt::Debug for PhaseTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseTimer")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn fires_after_delay() {
        let (tx, rx) = mpsc::channel();
        let timer = PhaseTimer::spawn("t-fire", Duration::from_millis(20), move || {
            tx.send(()).expect("send fired");
            FireAttempt::Done
        })
        .expect("spawn timer");
        rx.recv_timeout(Duration::from_secs(2)).expect("timer fired");
        timer.cancel();
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = PhaseTimer::spawn("t-cancel", Duration::from_millis(200), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            FireAttempt::Done
        })
        .expect("spawn timer");
        timer.cancel();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn retries_until_done_and_cancel_stops_retrying() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let timer = PhaseTimer::spawn("t-retry", Duration::from_millis(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            FireAttempt::Retry
        })
        .expect("spawn timer");
        let start = Instant::now();
        while attempts.load(Ordering::SeqCst) < 3 && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        timer.cancel();
        let after_cancel = attempts.load(Ordering::SeqCst);
        assert!(after_cancel >= 3);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(attempts.load(Ordering::SeqCst), after_cancel);
    }
}
