//! Resizable worker pool
//!
//! Workers pull jobs from one shared unbounded channel. Shrinking the
//! pool sends retire markers through the same channel, so jobs queued
//! before a resize are still run.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

type Job = Box<dyn FnOnce() + Send>;

enum Task {
    Run(Job),
    Retire,
}

struct Inner {
    tx: Sender<Task>,
    rx: Receiver<Task>,
    target: Mutex<usize>,
    live: AtomicUsize,
    spawned: AtomicUsize,
    name: String,
}

/// A pool of threads draining a shared job queue
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    /// Start a pool with `threads` workers (at least one)
    pub fn new(name: impl Into<String>, threads: usize) -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        let pool = WorkerPool {
            inner: Arc::new(Inner {
                tx,
                rx,
                target: Mutex::new(0),
                live: AtomicUsize::new(0),
                spawned: AtomicUsize::new(0),
                name: name.into(),
            }),
        };
        pool.resize(threads)?;
        Ok(pool)
    }

    /// Queue a job
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.tx.send(Task::Run(Box::new(job))).is_err() {
            tracing::warn!(pool = %self.inner.name, "worker queue closed; job dropped");
        }
    }

    /// Grow or shrink to `threads` workers (at least one)
    ///
    /// Shrinking never interrupts a running job: surplus workers exit
    /// after finishing what they are doing.
    pub fn resize(&self, threads: usize) -> std::io::Result<()> {
        let threads = threads.max(1);
        let mut target = self.inner.target.lock();

        while *target < threads {
            let id = self.inner.spawned.fetch_add(1, Ordering::Relaxed);
            let inner = self.inner.clone();
            thread::Builder::new()
                .name(format!("{}-worker-{}", self.inner.name, id))
                .spawn(move || work(inner))?;
            *target += 1;
        }
        while *target > threads {
            let _ = self.inner.tx.send(Task::Retire);
            *target -= 1;
        }

        tracing::debug!(pool = %self.inner.name, threads, "worker pool resized");
        Ok(())
    }

    /// Requested number of workers
    pub fn size(&self) -> usize {
        *self.inner.target.lock()
    }

    /// Workers currently running
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Jobs waiting for a worker
    pub fn queued(&self) -> usize {
        self.inner.rx.len()
    }

    /// Retire every worker once the queue ahead of it is drained
    pub fn shutdown(&self) {
        let mut target = self.inner.target.lock();
        for _ in 0..*target {
            let _ = self.inner.tx.send(Task::Retire);
        }
        *target = 0;
    }
}

fn work(inner: Arc<Inner>) {
    inner.live.fetch_add(1, Ordering::SeqCst);
    while let Ok(task) = inner.rx.recv() {
        match task {
            Task::Run(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!(pool = %inner.name, "worker job panicked");
                }
            }
            Task::Retire => break,
        }
    }
    inner.live.fetch_sub(1, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_runs_jobs() {
        let pool = WorkerPool::new("test", 2).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..10 {
            let tx = tx.clone();
            pool.execute(move || tx.send(i).unwrap());
        }
        let mut got: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn test_resize() {
        let pool = WorkerPool::new("resize", 1).unwrap();
        wait_for(|| pool.live() == 1);

        pool.resize(4).unwrap();
        assert_eq!(pool.size(), 4);
        wait_for(|| pool.live() == 4);

        pool.resize(2).unwrap();
        assert_eq!(pool.size(), 2);
        wait_for(|| pool.live() == 2);

        pool.resize(0).unwrap();
        assert_eq!(pool.size(), 1);
        pool.shutdown();
        wait_for(|| pool.live() == 0);
    }

    #[test]
    fn test_shrinking_keeps_queued_work() {
        let pool = WorkerPool::new("shrink", 3).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..20 {
            let tx = tx.clone();
            pool.execute(move || {
                thread::sleep(Duration::from_millis(2));
                tx.send(i).unwrap();
            });
        }
        pool.resize(1).unwrap();

        for _ in 0..20 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        pool.shutdown();
    }

    #[test]
    fn test_panic_is_contained() {
        let pool = WorkerPool::new("panic", 1).unwrap();
        pool.execute(|| panic!("job failure"));

        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.execute(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.live(), 1);
        pool.shutdown();
    }
}
