use std::{fmt, sync::Arc, time::Duration};

use crate::{
    config::StageConfig,
    error::{StageError, WaitError},
    reader::LatestReader,
    slot::LatestValueSlot,
    stats::{StageMetrics, StageStats},
    trigger::UpdateTrigger,
    work::Producer,
    worker::{Lifecycle, Worker},
};

/// A stage whose worker produces one value per requested update.
///
/// The worker sleeps until [`Self::request_update()`] is called, runs the
/// producer with no locks held, publishes the result, and goes back to sleep.
/// Requests made while an update is pending or running are dropped, so a slow
/// producer is never asked to catch up on a backlog.
///
/// Dropping the stage shuts the worker down.
pub struct TriggeredStage<T, P> {
    config: StageConfig,
    output: Arc<LatestValueSlot<T>>,
    trigger: Arc<UpdateTrigger>,
    metrics: Arc<StageMetrics>,
    lifecycle: Lifecycle<P>,
}

impl<T, P> TriggeredStage<T, P>
where
    T: Send + 'static,
    P: Producer<T>,
{
    /// Returns a stage that will run `producer` once started.
    pub fn new(producer: P) -> Self {
        Self::with_config(producer, StageConfig::default())
    }

    /// Returns a stage that will run `producer` with `config` once started.
    pub fn with_config(producer: P, config: StageConfig) -> Self {
        Self {
            config,
            output: Arc::new(LatestValueSlot::new()),
            trigger: Arc::new(UpdateTrigger::new()),
            metrics: Arc::default(),
            lifecycle: Lifecycle::Idle(producer),
        }
    }

    /// Spawns the worker thread. A request made before starting is served as
    /// soon as the worker runs.
    ///
    /// # Errors
    ///
    /// - [`StageError::AlreadyStarted`]: the stage was started before.
    /// - [`StageError::Spawn`]: the thread could not be spawned. The stage
    ///   can't be started again.
    pub fn start(&mut self) -> Result<(), StageError> {
        let mut producer = self.lifecycle.begin_start()?;
        let name = self.config.name().to_owned();
        let output = self.output.clone();
        let trigger = self.trigger.clone();
        let metrics = self.metrics.clone();

        let worker = Worker::spawn(
            self.config.name(),
            move |stop| {
                while let Some(claim) = trigger.await_and_claim() {
                    if stop.is_set() {
                        break;
                    }

                    tracing::trace!(stage = %name, "producing");
                    let cycle = metrics.begin_cycle();
                    match producer.produce() {
                        Ok(value) => {
                            metrics.record_published();
                            output.publish(value);
                        }
                        Err(err) => metrics.record_failure(&name, &err),
                    }
                    drop(cycle);
                    claim.release();
                }
            },
            {
                let output = self.output.clone();
                let trigger = self.trigger.clone();
                move || {
                    trigger.close();
                    output.close();
                }
            },
        );

        match worker {
            Ok(worker) => {
                self.lifecycle = Lifecycle::Running(worker);
                Ok(())
            }
            Err(err) => {
                self.trigger.close();
                self.output.close();
                Err(err)
            }
        }
    }
}

impl<T, P> TriggeredStage<T, P> {
    /// Requests an update.
    ///
    /// Returns false if an update is already pending or running, or if the
    /// stage has shut down. Dropped requests are not an error: the update
    /// already under way will publish a value.
    pub fn request_update(&self) -> bool {
        self.trigger.request_update()
    }

    /// Returns true if an update is pending or running. The answer is only a
    /// snapshot.
    #[must_use]
    pub fn is_updating(&self) -> bool {
        self.trigger.is_busy()
    }

    /// Takes the latest value if it hasn't been consumed yet. Never blocks.
    #[must_use]
    pub fn try_get_latest(&self) -> Option<T> {
        self.output.try_consume()
    }

    /// Returns a copy of the latest value, consumed or not.
    #[must_use]
    pub fn peek_latest(&self) -> Option<T>
    where
        T: Clone,
    {
        self.output.peek()
    }

    /// Blocks until a new value is published and takes it.
    ///
    /// # Errors
    ///
    /// - [`WaitError::NotStarted`]: the stage was never started.
    /// - [`WaitError::Disconnected`]: the worker has stopped and the last
    ///   value has been consumed.
    pub fn wait_get_latest(&self) -> Result<T, WaitError> {
        self.ensure_started()?;
        Ok(self.output.wait_consume()?)
    }

    /// Blocks until a new value is published or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// - [`WaitError::NotStarted`]: the stage was never started.
    /// - [`WaitError::Disconnected`]: the worker has stopped and the last
    ///   value has been consumed.
    /// - [`WaitError::Timeout`]: nothing was published in time.
    pub fn wait_get_latest_timeout(&self, timeout: Duration) -> Result<T, WaitError> {
        self.ensure_started()?;
        Ok(self.output.wait_consume_timeout(timeout)?)
    }

    /// Returns a handle for reading this stage's output from other threads.
    pub fn reader(&self) -> LatestReader<T> {
        LatestReader::new(self.output.clone())
    }

    /// Returns a snapshot of the worker's activity.
    #[must_use]
    pub fn stats(&self) -> StageStats {
        self.metrics.snapshot()
    }

    /// Returns true while the worker thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// Returns the stage's configuration.
    #[must_use]
    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Stops the worker and joins it.
    ///
    /// A production cycle that is already running is allowed to finish. Once
    /// this returns `Ok`, the worker has exited and nothing more will be
    /// published. Calling it again, or on a stage that never started, does
    /// nothing.
    ///
    /// # Errors
    ///
    /// - [`StageError::ShutdownTimeout`]: the producer did not return within
    ///   the configured grace period. Shutting down can be retried.
    /// - [`StageError::WorkerPanicked`]: the producer panicked.
    pub fn shutdown(&mut self) -> Result<(), StageError> {
        let trigger = &self.trigger;
        self.lifecycle
            .shutdown(self.config.shutdown_grace(), || trigger.close())
    }

    fn ensure_started(&self) -> Result<(), WaitError> {
        if self.lifecycle.has_started() {
            Ok(())
        } else {
            Err(WaitError::NotStarted)
        }
    }
}

impl<T, P> Drop for TriggeredStage<T, P> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(
                stage = %self.config.name(),
                error = %err,
                "failed to shut down worker"
            );
        }
    }
}

impl<T, P> fmt::Debug for TriggeredStage<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggeredStage")
            .field("name", &self.config.name())
            .field("running", &self.lifecycle.is_running())
            .field("updating", &self.trigger.is_busy())
            .field("output", &self.output.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
const PATIENCE: Duration = Duration::from_secs(5);

#[test]
fn produces_on_request() {
    use std::convert::Infallible;

    let mut stage = TriggeredStage::new(|| Ok::<_, Infallible>(42_u32));
    stage.start().unwrap();
    assert!(stage.request_update());
    assert_eq!(stage.wait_get_latest_timeout(PATIENCE), Ok(42));
    assert_eq!(stage.try_get_latest(), None);
    // The value is gone from the slot once it has been consumed.
    assert_eq!(stage.peek_latest(), None);
    stage.shutdown().unwrap();
}

#[test]
fn overlapping_requests_coalesce() {
    use std::{
        convert::Infallible,
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
    };

    use crate::eventually;

    let calls = Arc::new(AtomicUsize::new(0));
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let mut stage = TriggeredStage::new({
        let calls = calls.clone();
        move || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = entered_tx.send(());
            let _ = release_rx.recv();
            Ok::<_, Infallible>(call)
        }
    });
    stage.start().unwrap();

    assert!(stage.request_update());
    entered_rx.recv_timeout(PATIENCE).unwrap();
    assert!(stage.is_updating());
    assert!(!stage.request_update());
    assert!(!stage.request_update());
    release_tx.send(()).unwrap();

    assert_eq!(stage.wait_get_latest_timeout(PATIENCE), Ok(1));
    eventually(|| !stage.is_updating());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The trigger is usable again once the update finished.
    assert!(stage.request_update());
    entered_rx.recv_timeout(PATIENCE).unwrap();
    release_tx.send(()).unwrap();
    assert_eq!(stage.wait_get_latest_timeout(PATIENCE), Ok(2));
    assert_eq!(stage.stats().published, 2);
}

#[test]
fn failing_producer_publishes_nothing() {
    use crate::eventually;

    let mut stage = TriggeredStage::new(|| Err::<u32, _>("sensor offline"));
    stage.start().unwrap();
    assert!(stage.request_update());
    eventually(|| stage.stats().failures == 1 && !stage.is_updating());
    assert_eq!(stage.try_get_latest(), None);
    assert_eq!(stage.peek_latest(), None);

    // The worker survives and keeps serving requests.
    assert!(stage.request_update());
    eventually(|| stage.stats().failures == 2);
    assert!(stage.is_running());
    assert_eq!(
        stage.stats().last_error.as_deref(),
        Some("sensor offline")
    );
}

#[test]
fn failure_keeps_previous_value() {
    use crate::eventually;

    let mut calls = 0_u32;
    let mut stage = TriggeredStage::new(move || {
        calls += 1;
        if calls == 2 {
            Err(String::from("checksum mismatch"))
        } else {
            Ok(calls)
        }
    });
    stage.start().unwrap();

    assert!(stage.request_update());
    eventually(|| stage.stats().published == 1 && !stage.is_updating());
    assert_eq!(stage.peek_latest(), Some(1));

    assert!(stage.request_update());
    eventually(|| stage.stats().failures == 1 && !stage.is_updating());
    assert_eq!(stage.peek_latest(), Some(1));
    assert_eq!(stage.try_get_latest(), Some(1));

    assert!(stage.request_update());
    assert_eq!(stage.wait_get_latest_timeout(PATIENCE), Ok(3));
}

#[test]
fn request_before_start_is_served() {
    use std::convert::Infallible;

    let mut stage = TriggeredStage::new(|| Ok::<_, Infallible>("ready"));
    assert!(stage.request_update());
    assert_eq!(stage.try_get_latest(), None);
    stage.start().unwrap();
    assert_eq!(stage.wait_get_latest(), Ok("ready"));
}

#[test]
fn usage_errors() {
    use std::convert::Infallible;

    let mut stage = TriggeredStage::new(|| Ok::<_, Infallible>(1_u8));
    assert_eq!(stage.wait_get_latest(), Err(WaitError::NotStarted));
    assert_eq!(
        stage.wait_get_latest_timeout(Duration::from_millis(1)),
        Err(WaitError::NotStarted)
    );
    // Shutting down a stage that never ran is a no-op.
    stage.shutdown().unwrap();

    stage.start().unwrap();
    assert!(matches!(stage.start(), Err(StageError::AlreadyStarted)));
    stage.shutdown().unwrap();
    assert!(matches!(stage.start(), Err(StageError::AlreadyStarted)));
}

#[test]
fn shutdown_releases_readers() {
    use std::convert::Infallible;

    let mut stage = TriggeredStage::new(|| Ok::<_, Infallible>(5_u16));
    stage.start().unwrap();
    let reader = stage.reader();
    let waiting = std::thread::spawn(move || reader.wait());

    std::thread::sleep(Duration::from_millis(50));
    stage.shutdown().unwrap();
    assert!(!stage.is_running());
    assert!(!stage.request_update());
    assert!(waiting.join().unwrap().is_err());
    assert_eq!(stage.wait_get_latest(), Err(WaitError::Disconnected));
    stage.shutdown().unwrap();
}

#[test]
fn shutdown_waits_for_in_flight_production() {
    use std::{convert::Infallible, sync::mpsc};

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let mut stage = TriggeredStage::with_config(
        move || {
            let _ = entered_tx.send(());
            let _ = release_rx.recv();
            Ok::<_, Infallible>(9_u8)
        },
        StageConfig::new()
            .with_name("slow-sensor")
            .with_shutdown_grace(Duration::from_millis(50)),
    );
    stage.start().unwrap();
    assert!(stage.request_update());
    entered_rx.recv_timeout(PATIENCE).unwrap();

    assert!(matches!(
        stage.shutdown(),
        Err(StageError::ShutdownTimeout(_))
    ));
    assert!(stage.is_running());

    release_tx.send(()).unwrap();
    stage.shutdown().unwrap();
    assert!(!stage.is_running());
    // The in-flight cycle completed and its value is still readable.
    assert_eq!(stage.try_get_latest(), Some(9));
}

#[test]
fn panicking_producer_is_reported() {
    use std::convert::Infallible;

    use crate::eventually;

    let mut stage = TriggeredStage::new(|| -> Result<u8, Infallible> {
        panic!("sensor driver crashed");
    });
    stage.start().unwrap();
    assert!(stage.is_running());
    let reader = stage.reader();
    assert!(stage.request_update());
    assert!(reader.wait().is_err());
    // The stage notices the dead worker before anyone joins it.
    eventually(|| !stage.is_running());
    assert!(!stage.is_updating());
    assert!(matches!(stage.shutdown(), Err(StageError::WorkerPanicked)));
    assert!(!stage.request_update());
}
