//! Bounded fire-and-forget worker pool.
//!
//! Jobs are pushed onto a `crossbeam-channel` queue and picked up by a fixed
//! set of named threads. Submission never waits for earlier jobs, so several
//! jobs of the same kind may run at once and finish in any order.

use crossbeam_channel::{Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default number of background workers.
pub const DEFAULT_WORKERS: usize = 8;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Count of queued plus running jobs, with a condvar for idle waits.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    lock: Mutex<()>,
    idle: Condvar,
}

impl InFlight {
    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            self.idle.notify_all();
        }
    }
}

pub struct WorkerPool {
    name: String,
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<InFlight>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one) named `{name}-{i}`.
    pub fn new(name: &str, size: usize) -> std::io::Result<Self> {
        let size = size.max(1);
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let in_flight = Arc::new(InFlight::default());

        let workers = (0..size)
            .map(|i| {
                let rx = rx.clone();
                let in_flight = Arc::clone(&in_flight);
                let worker_name = format!("{name}-{i}");
                std::thread::Builder::new()
                    .name(worker_name.clone())
                    .spawn(move || run_worker(&worker_name, rx, &in_flight))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        tracing::debug!(pool = name, size, "worker pool started");

        Ok(Self {
            name: name.to_string(),
            tx: Some(tx),
            workers,
            in_flight,
        })
    }

    /// Queue a job without waiting. Returns false once the pool is shut down.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(tx) = &self.tx else {
            return false;
        };
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        if tx.send(Box::new(job)).is_err() {
            self.in_flight.finish();
            return false;
        }
        true
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Jobs queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Block until no job is queued or running, or `timeout` elapses.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.in_flight.lock.lock().unwrap_or_else(|e| e.into_inner());
        while self.in_flight() > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.in_flight.idle.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }

    /// Stop accepting jobs, let queued jobs finish, and join the workers.
    pub fn shutdown(&mut self) {
        if self.tx.take().is_none() {
            return;
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!(pool = %self.name, "worker thread panicked outside a job");
            }
        }
        tracing::debug!(pool = %self.name, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(name: &str, rx: Receiver<Job>, in_flight: &InFlight) {
    while let Ok(job) = rx.recv() {
        // A panicking job must not take the worker down with it.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            tracing::error!(worker = name, panic = %panic_message(&*payload), "background job panicked");
        }
        in_flight.finish();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_runs_submitted_jobs() {
        let pool = WorkerPool::new("test", 4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            assert!(pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 32);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_submit_does_not_block_on_running_jobs() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.submit(move || {
            let _ = release_rx.recv();
        });
        // The single worker is busy; submission still returns immediately.
        let started = Instant::now();
        assert!(pool.submit(|| {}));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(pool.in_flight(), 2);

        release_tx.send(()).unwrap();
        assert!(pool.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_survives_panicking_job() {
        let pool = WorkerPool::new("test", 1).unwrap();
        pool.submit(|| panic!("malformed frame"));
        let (tx, rx) = mpsc::channel();
        pool.submit(move || tx.send(42).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        assert!(pool.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_shutdown_drains_queue_and_rejects_new_jobs() {
        let mut pool = WorkerPool::new("test", 2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                std::thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(!pool.submit(|| {}));
    }

    #[test]
    fn test_size_is_at_least_one() {
        assert_eq!(WorkerPool::new("test", 0).unwrap().size(), 1);
        assert_eq!(WorkerPool::new("test", DEFAULT_WORKERS).unwrap().size(), 8);
    }
}
