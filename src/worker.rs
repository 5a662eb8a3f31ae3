//! The worker thread shared by every stage: spawning, cooperative stop
//! requests, and bounded joining.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::error::StageError;

/// A one-way flag that threads can block on.
#[derive(Debug, Default)]
pub(crate) struct Latch {
    set: Mutex<bool>,
    changed: Condvar,
}

impl Latch {
    pub(crate) fn set(&self) {
        *self.set.lock() = true;
        self.changed.notify_all();
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Blocks until the latch is set or `timeout` elapses. Returns whether the
    /// latch is set.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut set = self.set.lock();
        match Instant::now().checked_add(timeout) {
            Some(deadline) => {
                while !*set {
                    if self.changed.wait_until(&mut set, deadline).timed_out() {
                        break;
                    }
                }
            }
            None => {
                while !*set {
                    self.changed.wait(&mut set);
                }
            }
        }
        *set
    }
}

/// Runs a closure when dropped, including while unwinding.
struct OnExit<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for OnExit<F> {
    fn drop(&mut self) {
        if let Some(on_exit) = self.0.take() {
            on_exit();
        }
    }
}

/// A running worker thread.
#[derive(Debug)]
pub(crate) struct Worker {
    name: String,
    thread: Option<JoinHandle<()>>,
    stop: Arc<Latch>,
    exited: Arc<Latch>,
}

impl Worker {
    /// Spawns a thread named `name` running `body`.
    ///
    /// `body` receives the stop latch and must check it between cycles.
    /// `on_exit` runs on the worker thread after `body` returns or panics.
    pub(crate) fn spawn<B, X>(name: &str, body: B, on_exit: X) -> Result<Self, StageError>
    where
        B: FnOnce(&Latch) + Send + 'static,
        X: FnOnce() + Send + 'static,
    {
        let stop = Arc::new(Latch::default());
        let exited = Arc::new(Latch::default());
        let thread = thread::Builder::new().name(name.to_owned()).spawn({
            let stop = stop.clone();
            let exited = exited.clone();
            let name = name.to_owned();
            move || {
                tracing::debug!(stage = %name, "worker started");
                let _exit = OnExit(Some(move || {
                    on_exit();
                    exited.set();
                    tracing::debug!(stage = %name, "worker exited");
                }));
                body(&stop);
            }
        })?;

        Ok(Self {
            name: name.to_owned(),
            thread: Some(thread),
            stop,
            exited,
        })
    }

    /// Asks the worker to stop at its next cancellation point.
    pub(crate) fn request_stop(&self) {
        tracing::debug!(stage = %self.name, "stop requested");
        self.stop.set();
    }

    /// Returns true once the worker's body has returned or panicked and its
    /// exit hook has run.
    pub(crate) fn has_exited(&self) -> bool {
        self.exited.is_set()
    }

    /// Waits up to `grace` for the worker to exit, then joins it.
    ///
    /// On timeout the thread handle is kept, so joining can be retried.
    pub(crate) fn join(&mut self, grace: Duration) -> Result<(), StageError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        if !self.exited.wait_timeout(grace) {
            self.thread = Some(thread);
            return Err(StageError::ShutdownTimeout(grace));
        }

        thread.join().map_err(|_| StageError::WorkerPanicked)
    }
}

/// Where a stage is in its life. `W` is whatever the worker needs to be
/// started, usually the producer.
#[derive(Debug)]
pub(crate) enum Lifecycle<W> {
    Idle(W),
    Running(Worker),
    Stopped,
}

impl<W> Lifecycle<W> {
    /// Takes the start payload, leaving the stage [`Lifecycle::Stopped`] until
    /// the caller stores the running worker.
    pub(crate) fn begin_start(&mut self) -> Result<W, StageError> {
        match std::mem::replace(self, Self::Stopped) {
            Self::Idle(payload) => Ok(payload),
            other => {
                *self = other;
                Err(StageError::AlreadyStarted)
            }
        }
    }

    pub(crate) fn has_started(&self) -> bool {
        !matches!(self, Self::Idle(_))
    }

    /// Returns true while a worker thread exists and hasn't exited, even if
    /// nobody has joined it yet.
    pub(crate) fn is_running(&self) -> bool {
        matches!(self, Self::Running(worker) if !worker.has_exited())
    }

    /// Stops a running worker: requests the stop, runs `wake` so the worker
    /// notices it, and joins within `grace`. A stage that never started is
    /// left as it is.
    pub(crate) fn shutdown(
        &mut self,
        grace: Duration,
        wake: impl FnOnce(),
    ) -> Result<(), StageError> {
        let Self::Running(worker) = self else {
            return Ok(());
        };

        worker.request_stop();
        wake();
        let result = worker.join(grace);
        if !matches!(result, Err(StageError::ShutdownTimeout(_))) {
            *self = Self::Stopped;
        }
        result
    }
}

#[test]
fn latch_timeout() {
    let latch = Latch::default();
    let start = Instant::now();
    assert!(!latch.wait_timeout(Duration::from_millis(50)));
    assert!(start.elapsed() >= Duration::from_millis(45));
    latch.set();
    assert!(latch.is_set());
    assert!(latch.wait_timeout(Duration::MAX));
}

#[test]
fn worker_runs_exit_hook() {
    let (sender, receiver) = std::sync::mpsc::channel();
    let mut worker = Worker::spawn(
        "test-worker",
        |stop| {
            while !stop.wait_timeout(Duration::from_secs(10)) {}
        },
        move || sender.send(()).unwrap(),
    )
    .unwrap();

    assert!(!worker.has_exited());
    worker.request_stop();
    worker.join(Duration::from_secs(5)).unwrap();
    assert!(worker.has_exited());
    receiver.try_recv().unwrap();
    // Joining twice is harmless.
    worker.join(Duration::from_secs(5)).unwrap();
}

#[test]
fn join_times_out_and_retries() {
    let release = Arc::new(Latch::default());
    let mut worker = Worker::spawn(
        "stuck-worker",
        {
            let release = release.clone();
            move |_| {
                release.wait_timeout(Duration::from_secs(10));
            }
        },
        || {},
    )
    .unwrap();

    worker.request_stop();
    assert!(matches!(
        worker.join(Duration::from_millis(20)),
        Err(StageError::ShutdownTimeout(_))
    ));
    release.set();
    worker.join(Duration::from_secs(5)).unwrap();
}

#[test]
fn lifecycle_rejects_second_start() {
    let mut lifecycle = Lifecycle::Idle(1_u8);
    assert!(!lifecycle.has_started());
    assert_eq!(lifecycle.begin_start().unwrap(), 1);
    assert!(lifecycle.has_started());
    assert!(!lifecycle.is_running());
    assert!(matches!(
        lifecycle.begin_start(),
        Err(StageError::AlreadyStarted)
    ));
    lifecycle.shutdown(Duration::ZERO, || {}).unwrap();
}

#[test]
fn panicked_worker_is_not_running() {
    let mut lifecycle = Lifecycle::<()>::Running(
        Worker::spawn(
            "doomed-worker",
            |_| panic!("worker body crashed"),
            || {},
        )
        .unwrap(),
    );
    crate::eventually(|| !lifecycle.is_running());
    assert!(matches!(
        lifecycle.shutdown(Duration::from_secs(5), || {}),
        Err(StageError::WorkerPanicked)
    ));
    assert!(!lifecycle.is_running());
}
