//! Deadline scheduler
//!
//! A single thread sleeps until the earliest deadline in a min-heap and
//! runs the task scheduled for it. Cancelled tasks are removed from the
//! task table immediately and their heap entries skipped when they come
//! up. Tasks run on the timer thread and must not block.

use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send>;

struct State {
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, Task>,
    next_id: u64,
    shutdown: bool,
}

struct Inner {
    state: Mutex<State>,
    changed: Condvar,
}

/// Handle to the timer thread; clones share the thread
#[derive(Clone)]
pub struct Timer {
    inner: Arc<Inner>,
}

impl Timer {
    /// Start the timer thread
    pub fn start() -> std::io::Result<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                queue: BinaryHeap::new(),
                tasks: HashMap::new(),
                next_id: 1,
                shutdown: false,
            }),
            changed: Condvar::new(),
        });

        let worker = inner.clone();
        thread::Builder::new()
            .name("rpcwire-timer".to_string())
            .spawn(move || run(worker))?;

        Ok(Timer { inner })
    }

    /// Run `task` once `delay` has elapsed
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.queue.push(Reverse((Instant::now() + delay, id)));
        state.tasks.insert(id, Box::new(task));
        drop(state);
        self.inner.changed.notify_one();

        TimerHandle {
            id,
            timer: Arc::downgrade(&self.inner),
        }
    }

    /// Number of tasks that have neither run nor been cancelled
    pub fn pending(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    /// Stop the thread; tasks that have not run yet are dropped
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        state.tasks.clear();
        state.queue.clear();
        drop(state);
        self.inner.changed.notify_all();
    }
}

fn run(inner: Arc<Inner>) {
    let mut state = inner.state.lock();
    loop {
        if state.shutdown {
            return;
        }

        let now = Instant::now();
        match state.queue.peek().map(|Reverse(entry)| *entry) {
            Some((deadline, id)) if deadline <= now => {
                state.queue.pop();
                if let Some(task) = state.tasks.remove(&id) {
                    drop(state);
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)).is_err() {
                        tracing::error!(task = id, "timer task panicked");
                    }
                    state = inner.state.lock();
                }
            }
            Some((deadline, _)) => {
                inner.changed.wait_until(&mut state, deadline);
            }
            None => inner.changed.wait(&mut state),
        }
    }
}

/// A scheduled task that can still be cancelled
#[derive(Debug)]
pub struct TimerHandle {
    id: u64,
    timer: Weak<Inner>,
}

impl TimerHandle {
    /// Cancel the task; returns false if it already ran or was cancelled
    pub fn cancel(&self) -> bool {
        match self.timer.upgrade() {
            Some(inner) => inner.state.lock().tasks.remove(&self.id).is_some(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_tasks_fire_in_deadline_order() {
        let timer = Timer::start().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (delay, tag) in [(60u64, 'c'), (20, 'a'), (40, 'b')] {
            let order = order.clone();
            timer.schedule(Duration::from_millis(delay), move || order.lock().push(tag));
        }

        thread::sleep(Duration::from_millis(200));
        assert_eq!(*order.lock(), vec!['a', 'b', 'c']);
        assert_eq!(timer.pending(), 0);
        timer.shutdown();
    }

    #[test]
    fn test_cancel() {
        let timer = Timer::start().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let handle = timer.schedule(Duration::from_millis(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.cancel());
        assert!(!handle.cancel());

        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.shutdown();
    }

    #[test]
    fn test_cancel_after_fire_reports_false() {
        let timer = Timer::start().unwrap();
        let handle = timer.schedule(Duration::from_millis(1), || {});
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.cancel());
        timer.shutdown();
    }

    #[test]
    fn test_panicking_task_does_not_stop_timer() {
        let timer = Timer::start().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        timer.schedule(Duration::from_millis(5), || panic!("boom"));
        let counter = fired.clone();
        timer.schedule(Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        timer.shutdown();
    }
}
