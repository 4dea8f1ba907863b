// SPDX-License-Identifier: MIT OR Apache-2.0

// src/core/util/dispatch_queue.rs

//! Serial fire-and-forget work queue.
//!
//! Each engine owns one [`DispatchQueue`]; everything dispatched onto it
//! runs on a single dedicated worker thread in submission order. Callers
//! never wait for the work itself, only [`DispatchQueue::wait_until_empty`]
//! blocks, and only during shutdown.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct PendingCount {
    count: Mutex<usize>,
    drained: Condvar,
}

pub struct DispatchQueue {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    pending: Arc<PendingCount>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchQueue {
    /// Spawn the worker thread and return the queue handle.
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let pending = Arc::new(PendingCount::default());
        let worker_pending = Arc::clone(&pending);
        let worker = thread::Builder::new()
            .name(format!("dispatch-{name}"))
            .spawn(move || {
                // recv drains buffered jobs before reporting disconnect, so
                // dropping the sender doubles as a graceful stop request.
                while let Ok(job) = receiver.recv() {
                    job();
                    let mut count = worker_pending.count.lock().unwrap();
                    *count -= 1;
                    worker_pending.drained.notify_all();
                }
            })
            .expect("failed to spawn dispatch worker");
        Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            pending,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue a job for asynchronous execution. Jobs submitted after
    /// shutdown are dropped.
    pub fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap();
        if let Some(sender) = sender.as_ref() {
            {
                let mut count = self.pending.count.lock().unwrap();
                *count += 1;
            }
            if sender.send(Box::new(job)).is_err() {
                let mut count = self.pending.count.lock().unwrap();
                *count -= 1;
                self.pending.drained.notify_all();
            }
        } else {
            log::warn!("dispatch queue '{}' is stopped, job dropped", self.name);
        }
    }

    pub fn pending(&self) -> usize {
        *self.pending.count.lock().unwrap()
    }

    /// Block until all queued work has run, or the timeout lapses.
    /// Returns true when the queue drained.
    pub fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.pending.count.lock().unwrap();
        while *count > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, wait) = self
                .pending
                .drained
                .wait_timeout(count, remaining)
                .unwrap();
            count = guard;
            if wait.timed_out() && *count > 0 {
                return false;
            }
        }
        true
    }

    /// Stop accepting work, let the worker finish what is queued, and join
    /// it. Safe to call more than once.
    pub fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            if worker.join().is_err() {
                log::error!("dispatch queue '{}' worker panicked", self.name);
            }
        }
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_jobs_run_in_submission_order() {
        let queue = DispatchQueue::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let seen = Arc::clone(&seen);
            queue.dispatch(move || seen.lock().unwrap().push(i));
        }
        assert!(queue.wait_until_empty(Duration::from_secs(5)));
        assert_eq!(*seen.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_shutdown_drains_queued_work() {
        let queue = DispatchQueue::new("drain");
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let ran = Arc::clone(&ran);
            queue.dispatch(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_wait_until_empty_times_out() {
        let queue = DispatchQueue::new("slow");
        queue.dispatch(|| thread::sleep(Duration::from_millis(200)));
        assert!(!queue.wait_until_empty(Duration::from_millis(10)));
        assert!(queue.wait_until_empty(Duration::from_secs(5)));
    }
}
