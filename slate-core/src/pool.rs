//! Callback pool for running completion callbacks off the hot path.
//!
//! Consensus completion callbacks must never run under the replica state
//! lock. The pool owns a fixed set of worker threads draining a channel;
//! callers enqueue boxed closures and return immediately.

use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use tracing::warn;

use crate::limits::CALLBACK_POOL_WORKERS_MAX;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of worker threads executing submitted tasks.
///
/// Tasks are executed in submission order per worker; with more than one
/// worker, cross-task ordering is not guaranteed. Dropping the pool closes
/// the channel, drains already-submitted tasks, and joins the workers.
#[derive(Debug)]
pub struct CallbackPool {
    tx: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl CallbackPool {
    /// Creates a pool with the given number of worker threads.
    ///
    /// # Panics
    /// Panics if `workers` is zero or exceeds [`CALLBACK_POOL_WORKERS_MAX`].
    #[must_use]
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "pool requires at least one worker");
        assert!(
            workers <= CALLBACK_POOL_WORKERS_MAX,
            "worker count {workers} exceeds maximum {CALLBACK_POOL_WORKERS_MAX}"
        );

        let (tx, rx) = channel::unbounded::<Task>();
        let handles = (0..workers)
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("callback-pool-{i}"))
                    .spawn(move || {
                        while let Ok(task) = rx.recv() {
                            task();
                        }
                    })
                    .expect("failed to spawn callback pool worker")
            })
            .collect();

        Self {
            tx: Some(tx),
            workers: handles,
        }
    }

    /// Creates a single-worker pool.
    ///
    /// With one worker, all tasks run sequentially in submission order.
    /// This is the configuration used by tests that assert callback order.
    #[must_use]
    pub fn single() -> Self {
        Self::new(1)
    }

    /// Submits a task for execution on a worker thread.
    ///
    /// Tasks submitted after the pool has shut down are dropped with a
    /// warning; completion callbacks must tolerate never running once their
    /// owner is being torn down.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        let Some(tx) = self.tx.as_ref() else {
            warn!("callback pool already shut down; dropping task");
            return;
        };
        if tx.send(Box::new(task)).is_err() {
            warn!("callback pool workers gone; dropping task");
        }
    }
}

impl Drop for CallbackPool {
    fn drop(&mut self) {
        // Close the channel so workers drain and exit.
        self.tx = None;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("callback pool worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::CountdownLatch;

    #[test]
    fn test_submit_runs_task() {
        let pool = CallbackPool::single();
        let ran = Arc::new(AtomicU64::new(0));
        let latch = Arc::new(CountdownLatch::new(1));

        let ran2 = Arc::clone(&ran);
        let latch2 = Arc::clone(&latch);
        pool.submit(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
            latch2.count_down();
        });

        latch.wait();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_single_worker_preserves_order() {
        let pool = CallbackPool::single();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let latch = Arc::new(CountdownLatch::new(10));

        for i in 0..10 {
            let seen = Arc::clone(&seen);
            let latch = Arc::clone(&latch);
            pool.submit(move || {
                seen.lock().unwrap().push(i);
                latch.count_down();
            });
        }

        latch.wait();
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_drains_submitted_tasks() {
        let ran = Arc::new(AtomicU64::new(0));
        {
            let pool = CallbackPool::new(2);
            for _ in 0..100 {
                let ran = Arc::clone(&ran);
                pool.submit(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        // Drop joined the workers after draining the queue.
        assert_eq!(ran.load(Ordering::SeqCst), 100);
    }

    #[test]
    #[should_panic(expected = "at least one worker")]
    fn test_zero_workers_panics() {
        let _ = CallbackPool::new(0);
    }
}
