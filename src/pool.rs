//! Fixed-size worker pool with per-task cooperative stop signals.
//!
//! Tasks are queued on a channel shared by all workers. Each running task is
//! handed its own [`StopSignal`], registered in a slab for the duration of
//! the task so that [`WorkerPool::stop_all`] and shutdown can reach it.

use slab::Slab;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// A unit of work run on a pool worker.
pub type Task = Box<dyn FnOnce(&StopSignal) + Send + 'static>;

/// Cooperative cancellation flag shared between the pool and one task.
///
/// Set at most once and never reset.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the owning task to stop at its next check.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct Shared {
    receiver: Mutex<Receiver<Task>>,
    /// Stop signals of tasks currently running on a worker.
    running: Mutex<Slab<StopSignal>>,
    closed: AtomicBool,
}

impl Shared {
    fn running(&self) -> MutexGuard<'_, Slab<StopSignal>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded pool of named worker threads.
pub struct WorkerPool {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<Task>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
}

impl WorkerPool {
    /// Spawn `workers` threads (at least one).
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let (sender, receiver) = channel::<Task>();

        let shared = Arc::new(Shared {
            receiver: Mutex::new(receiver),
            running: Mutex::new(Slab::with_capacity(workers)),
            closed: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &shared))?;
            handles.push(handle);
        }

        debug!(workers, "Worker pool started");

        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
            workers,
        })
    }

    /// Queue a task. Returns `false` (dropping the task) once the pool is shut down.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce(&StopSignal) + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// Raise the stop signal of every running task.
    pub fn stop_all(&self) {
        for (_, signal) in self.shared.running().iter() {
            signal.stop();
        }
    }

    /// Number of tasks currently running.
    pub fn active(&self) -> usize {
        self.shared.running().len()
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Stop accepting work, stop running tasks, drop queued ones and join
    /// every worker. Safe to call more than once.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.stop_all();

        // Disconnecting the channel wakes idle workers.
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        if handles.is_empty() {
            return;
        }

        for handle in handles {
            if handle.join().is_err() {
                warn!("Worker thread terminated abnormally");
            }
        }
        info!(workers = self.workers, "Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, shared: &Shared) {
    loop {
        let task = {
            let receiver = shared
                .receiver
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            receiver.recv()
        };

        let Ok(task) = task else {
            break;
        };

        let signal = StopSignal::new();
        let key = {
            let mut running = shared.running();
            // Checked under the registry lock so shutdown cannot miss a task
            // that starts while it is stopping the others.
            if shared.closed.load(Ordering::SeqCst) {
                debug!(worker = worker_id, "Dropping queued task after shutdown");
                continue;
            }
            running.insert(signal.clone())
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| task(&signal)));
        shared.running().remove(key);

        if result.is_err() {
            error!(worker = worker_id, "Task panicked");
        }
    }

    debug!(worker = worker_id, "Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_stop_signal() {
        let signal = StopSignal::new();
        let shared = signal.clone();
        assert!(!shared.is_stopped());

        signal.stop();
        assert!(shared.is_stopped());

        // Never reset
        signal.stop();
        assert!(shared.is_stopped());
    }

    #[test]
    fn test_runs_submitted_tasks() {
        let pool = WorkerPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();

        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            let done_tx = done_tx.clone();
            assert!(pool.submit(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                done_tx.send(()).unwrap();
            }));
        }

        for _ in 0..32 {
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_zero_workers_rounds_up() {
        let pool = WorkerPool::new(0).unwrap();
        assert_eq!(pool.workers(), 1);
    }

    #[test]
    fn test_shutdown_stops_running_task() {
        let pool = WorkerPool::new(1).unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (stopped_tx, stopped_rx) = mpsc::channel();

        pool.submit(move |stop| {
            started_tx.send(()).unwrap();
            while !stop.is_stopped() {
                thread::sleep(Duration::from_millis(5));
            }
            stopped_tx.send(()).unwrap();
        });

        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.active(), 1);

        let start = Instant::now();
        pool.shutdown();
        assert!(start.elapsed() < Duration::from_secs(2));
        stopped_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        assert!(!pool.submit(|_| {}));
    }

    #[test]
    fn test_queued_tasks_dropped_on_shutdown() {
        let pool = WorkerPool::new(1).unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let ran = Arc::new(AtomicBool::new(false));

        pool.submit(move |stop| {
            started_tx.send(()).unwrap();
            while !stop.is_stopped() {
                thread::sleep(Duration::from_millis(5));
            }
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let ran_clone = Arc::clone(&ran);
        pool.submit(move |_| ran_clone.store(true, Ordering::SeqCst));

        pool.shutdown();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_task_keeps_worker() {
        let pool = WorkerPool::new(1).unwrap();
        let (done_tx, done_rx) = mpsc::channel();

        pool.submit(|_| panic!("task failure"));
        pool.submit(move |_| done_tx.send(()).unwrap());

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
