// SPDX-License-Identifier: MIT OR Apache-2.0

// src/core/util/timer.rs
// Interval timer backed by a dedicated thread. The callback runs on the
// timer thread; anything long-running should dispatch onto an engine queue.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Default)]
struct TimerState {
    stopped: Mutex<bool>,
    wake: Condvar,
}

#[derive(Debug)]
pub struct PeriodicTimer {
    state: Arc<TimerState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTimer {
    /// Start firing `tick` every `interval` until [`PeriodicTimer::stop`].
    pub fn start<F>(name: &str, interval: Duration, tick: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let state = Arc::new(TimerState::default());
        let worker_state = Arc::clone(&state);
        let worker = thread::Builder::new()
            .name(format!("timer-{name}"))
            .spawn(move || loop {
                let stopped = worker_state.stopped.lock().unwrap();
                let (stopped, wait) = worker_state
                    .wake
                    .wait_timeout(stopped, interval)
                    .unwrap();
                if *stopped {
                    return;
                }
                if wait.timed_out() {
                    drop(stopped);
                    tick();
                }
            })
            .expect("failed to spawn timer thread");
        Self {
            state,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Stop the timer and join its thread. Safe to call more than once.
    pub fn stop(&self) {
        {
            let mut stopped = self.state.stopped.lock().unwrap();
            *stopped = true;
        }
        self.state.wake.notify_all();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_timer_fires_repeatedly() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = PeriodicTimer::start("test", Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(150));
        timer.stop();
        let count = fired.load(Ordering::SeqCst);
        assert!(count >= 2, "expected at least 2 ticks, got {count}");
        // no further ticks after stop
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), count);
    }
}
