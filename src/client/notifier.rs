//! Completion of one in-flight request
//!
//! A `Notifier` is resolved exactly once, by whichever of the response
//! path, an error, or the request deadline gets there first. Later
//! resolutions are ignored and reported as such.

use crate::http::HttpResponse;
use crate::net::{Error, Result, WorkerPool};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Where a request stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierState {
    Pending,
    Responded,
    Failed,
    TimedOut,
}

impl NotifierState {
    pub fn is_terminal(&self) -> bool {
        *self != NotifierState::Pending
    }
}

/// Callback receiving the outcome of an asynchronous request
///
/// Runs on a worker thread. Panics are caught and logged.
pub trait ResponseHandler: Send + 'static {
    fn on_response(self: Box<Self>, response: HttpResponse);
    fn on_failure(self: Box<Self>, error: Error);
}

impl<F> ResponseHandler for F
where
    F: FnOnce(Result<HttpResponse>) + Send + 'static,
{
    fn on_response(self: Box<Self>, response: HttpResponse) {
        (*self)(Ok(response))
    }

    fn on_failure(self: Box<Self>, error: Error) {
        (*self)(Err(error))
    }
}

enum Delivery {
    Blocking(Option<Result<HttpResponse>>),
    Callback {
        handler: Option<Box<dyn ResponseHandler>>,
        workers: WorkerPool,
    },
}

struct Inner {
    state: NotifierState,
    delivery: Delivery,
}

pub struct Notifier {
    inner: Mutex<Inner>,
    resolved: Condvar,
}

impl Notifier {
    /// A notifier the requesting thread waits on
    pub fn blocking() -> Arc<Self> {
        Arc::new(Notifier {
            inner: Mutex::new(Inner {
                state: NotifierState::Pending,
                delivery: Delivery::Blocking(None),
            }),
            resolved: Condvar::new(),
        })
    }

    /// A notifier that hands its outcome to `handler` on `workers`
    pub fn callback(handler: impl ResponseHandler, workers: WorkerPool) -> Arc<Self> {
        Arc::new(Notifier {
            inner: Mutex::new(Inner {
                state: NotifierState::Pending,
                delivery: Delivery::Callback {
                    handler: Some(Box::new(handler)),
                    workers,
                },
            }),
            resolved: Condvar::new(),
        })
    }

    pub fn state(&self) -> NotifierState {
        self.inner.lock().state
    }

    pub fn respond(&self, response: HttpResponse) -> bool {
        self.resolve(Ok(response))
    }

    /// Fail the request; a `RequestTimeout` error marks it timed out
    pub fn fail(&self, error: Error) -> bool {
        self.resolve(Err(error))
    }

    /// Move out of `Pending`; returns false if already resolved
    pub fn resolve(&self, outcome: Result<HttpResponse>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            tracing::trace!(state = ?inner.state, "notifier already resolved");
            return false;
        }
        inner.state = match &outcome {
            Ok(_) => NotifierState::Responded,
            Err(Error::RequestTimeout(_)) => NotifierState::TimedOut,
            Err(_) => NotifierState::Failed,
        };

        match &mut inner.delivery {
            Delivery::Blocking(slot) => {
                *slot = Some(outcome);
                drop(inner);
                self.resolved.notify_all();
            }
            Delivery::Callback { handler, workers } => {
                let handler = handler.take();
                let workers = workers.clone();
                drop(inner);
                if let Some(handler) = handler {
                    workers.execute(move || deliver(handler, outcome));
                }
            }
        }
        true
    }

    /// Block until resolved and take the outcome
    ///
    /// Only meaningful for blocking notifiers; the outcome can be taken
    /// once.
    pub fn wait(&self) -> Result<HttpResponse> {
        let mut inner = self.inner.lock();
        loop {
            match &mut inner.delivery {
                Delivery::Blocking(slot) => {
                    if let Some(outcome) = slot.take() {
                        return outcome;
                    }
                    if inner.state.is_terminal() {
                        return Err(Error::Processing("outcome already taken".to_string()));
                    }
                }
                Delivery::Callback { .. } => {
                    return Err(Error::Processing(
                        "callback notifier cannot be waited on".to_string(),
                    ))
                }
            }
            self.resolved.wait(&mut inner);
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("state", &self.state())
            .finish()
    }
}

fn deliver(handler: Box<dyn ResponseHandler>, outcome: Result<HttpResponse>) {
    let result = catch_unwind(AssertUnwindSafe(move || match outcome {
        Ok(response) => handler.on_response(response),
        Err(error) => handler.on_failure(error),
    }));
    if result.is_err() {
        tracing::error!("response callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Status;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_blocking_single_transition() {
        let notifier = Notifier::blocking();
        assert_eq!(notifier.state(), NotifierState::Pending);

        let resolver = {
            let notifier = notifier.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                notifier.respond(HttpResponse::new(Status::OK))
            })
        };

        let response = notifier.wait().unwrap();
        assert_eq!(response.status(), Status::OK);
        assert!(resolver.join().unwrap());

        assert!(!notifier.fail(Error::RequestTimeout(Duration::from_millis(1))));
        assert_eq!(notifier.state(), NotifierState::Responded);
    }

    #[test]
    fn test_timeout_state() {
        let notifier = Notifier::blocking();
        assert!(notifier.fail(Error::RequestTimeout(Duration::from_millis(5))));
        assert!(!notifier.respond(HttpResponse::new(Status::OK)));
        assert_eq!(notifier.state(), NotifierState::TimedOut);
        assert!(matches!(notifier.wait(), Err(Error::RequestTimeout(_))));
    }

    #[test]
    fn test_racing_resolutions_pick_one() {
        for _ in 0..50 {
            let notifier = Notifier::blocking();
            let a = {
                let n = notifier.clone();
                thread::spawn(move || n.respond(HttpResponse::new(Status::OK)))
            };
            let b = {
                let n = notifier.clone();
                thread::spawn(move || n.fail(Error::RequestTimeout(Duration::from_millis(1))))
            };
            let wins = [a.join().unwrap(), b.join().unwrap()];
            assert_eq!(wins.iter().filter(|w| **w).count(), 1);
            assert!(notifier.state().is_terminal());
        }
    }

    #[test]
    fn test_callback_runs_on_worker() {
        let workers = WorkerPool::new("notifier-test", 1).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let notifier = Notifier::callback(
            move |outcome: Result<HttpResponse>| {
                tx.send(outcome.map(|r| r.status())).unwrap();
            },
            workers.clone(),
        );

        assert!(notifier.fail(Error::ConnectionClosed));
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(got, Err(Error::ConnectionClosed)));
        assert_eq!(notifier.state(), NotifierState::Failed);
        workers.shutdown();
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let workers = WorkerPool::new("notifier-panic", 1).unwrap();
        let notifier = Notifier::callback(
            |_outcome: Result<HttpResponse>| panic!("callback failure"),
            workers.clone(),
        );
        assert!(notifier.respond(HttpResponse::new(Status::OK)));

        let (tx, rx) = crossbeam_channel::bounded(1);
        workers.execute(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        workers.shutdown();
    }
}
