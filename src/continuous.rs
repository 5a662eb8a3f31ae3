use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    config::StageConfig,
    error::{StageError, WaitError},
    reader::LatestReader,
    slot::LatestValueSlot,
    stats::{StageMetrics, StageStats},
    work::Producer,
    worker::{Lifecycle, Worker},
};

/// A stage whose worker produces values back to back without being asked.
///
/// Useful for sources that fill up if they aren't drained, such as streams
/// that are constantly populated. Each cycle runs the producer and publishes
/// its value; if [`StageConfig::with_min_interval()`] is set, consecutive
/// cycles start at least that far apart.
///
/// Stopping is checked between cycles, so shutting down waits for at most one
/// production to finish. Dropping the stage shuts the worker down.
pub struct ContinuousStage<T, P> {
    config: StageConfig,
    output: Arc<LatestValueSlot<T>>,
    metrics: Arc<StageMetrics>,
    lifecycle: Lifecycle<P>,
}

impl<T, P> ContinuousStage<T, P>
where
    T: Send + 'static,
    P: Producer<T>,
{
    /// Returns a stage that will run `producer` continuously once started.
    pub fn new(producer: P) -> Self {
        Self::with_config(producer, StageConfig::default())
    }

    /// Returns a stage that will run `producer` with `config` once started.
    pub fn with_config(producer: P, config: StageConfig) -> Self {
        Self {
            config,
            output: Arc::new(LatestValueSlot::new()),
            metrics: Arc::default(),
            lifecycle: Lifecycle::Idle(producer),
        }
    }

    /// Spawns the worker thread, which starts producing immediately.
    ///
    /// # Errors
    ///
    /// - [`StageError::AlreadyStarted`]: the stage was started before.
    /// - [`StageError::Spawn`]: the thread could not be spawned. The stage
    ///   can't be started again.
    pub fn start(&mut self) -> Result<(), StageError> {
        let mut producer = self.lifecycle.begin_start()?;
        let name = self.config.name().to_owned();
        let min_interval = self.config.min_interval();
        let output = self.output.clone();
        let metrics = self.metrics.clone();

        let worker = Worker::spawn(
            self.config.name(),
            move |stop| {
                while !stop.is_set() {
                    let cycle_started = Instant::now();
                    let cycle = metrics.begin_cycle();
                    match producer.produce() {
                        Ok(value) => {
                            metrics.record_published();
                            output.publish(value);
                        }
                        Err(err) => metrics.record_failure(&name, &err),
                    }
                    drop(cycle);

                    if let Some(min_interval) = min_interval {
                        let remaining = min_interval.saturating_sub(cycle_started.elapsed());
                        if stop.wait_timeout(remaining) {
                            break;
                        }
                    }
                }
            },
            {
                let output = self.output.clone();
                move || {
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
                self.output.close();
                Err(err)
            }
        }
    }
}

impl<T, P> ContinuousStage<T, P> {
    /// Returns true once the stage has been started, until its worker stops.
    /// A continuous stage is always updating.
    #[must_use]
    pub fn is_updating(&self) -> bool {
        self.lifecycle.is_running() && !self.output.is_closed()
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

    /// Stops the worker after its current cycle and joins it. A pending
    /// interval wait is cut short.
    ///
    /// # Errors
    ///
    /// - [`StageError::ShutdownTimeout`]: the producer did not return within
    ///   the configured grace period. Shutting down can be retried.
    /// - [`StageError::WorkerPanicked`]: the producer panicked.
    pub fn shutdown(&mut self) -> Result<(), StageError> {
        // The stop latch wakes the interval wait by itself.
        self.lifecycle.shutdown(self.config.shutdown_grace(), || {})
    }

    fn ensure_started(&self) -> Result<(), WaitError> {
        if self.lifecycle.has_started() {
            Ok(())
        } else {
            Err(WaitError::NotStarted)
        }
    }
}

impl<T, P> Drop for ContinuousStage<T, P> {
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

impl<T, P> fmt::Debug for ContinuousStage<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuousStage")
            .field("name", &self.config.name())
            .field("running", &self.lifecycle.is_running())
            .field("min_interval", &self.config.min_interval())
            .field("output", &self.output.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
const PATIENCE: Duration = Duration::from_secs(5);

#[test]
fn publishes_continuously() {
    use std::convert::Infallible;

    let mut next = 0_u32;
    let mut stage = ContinuousStage::new(move || {
        next += 1;
        Ok::<_, Infallible>(next)
    });
    assert!(!stage.is_updating());
    assert_eq!(stage.wait_get_latest(), Err(WaitError::NotStarted));
    stage.start().unwrap();
    assert!(stage.is_updating());

    let first = stage.wait_get_latest_timeout(PATIENCE).unwrap();
    let second = stage.wait_get_latest_timeout(PATIENCE).unwrap();
    // Values may be skipped, but never go backwards.
    assert!(second > first);

    stage.shutdown().unwrap();
    assert!(!stage.is_updating());
    let published = stage.stats().published;
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(stage.stats().published, published);
}

#[test]
fn honors_min_interval() {
    use std::convert::Infallible;

    let mut stage = ContinuousStage::with_config(
        || Ok::<_, Infallible>(Instant::now()),
        StageConfig::new().with_min_interval(Duration::from_millis(50)),
    );
    stage.start().unwrap();
    let reader = stage.reader();
    let first = reader.wait_timeout(PATIENCE).unwrap();
    let second = reader.wait_timeout(PATIENCE).unwrap();
    assert!(second.duration_since(first) >= Duration::from_millis(45));
}

#[test]
fn shutdown_interrupts_interval() {
    use std::convert::Infallible;

    use crate::eventually;

    let mut stage = ContinuousStage::with_config(
        || Ok::<_, Infallible>(()),
        StageConfig::new()
            .with_min_interval(Duration::from_secs(60))
            .with_shutdown_grace(Duration::from_secs(5)),
    );
    stage.start().unwrap();
    eventually(|| stage.stats().published == 1);

    let start = Instant::now();
    stage.shutdown().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(stage.stats().published, 1);
}

#[test]
fn failures_do_not_stop_the_worker() {
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::eventually;

    let calls = Arc::new(AtomicU32::new(0));
    let mut stage = ContinuousStage::with_config(
        {
            let calls = calls.clone();
            move || {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call % 2 == 0 {
                    Err(format!("dropped frame {call}"))
                } else {
                    Ok(call)
                }
            }
        },
        StageConfig::new().with_min_interval(Duration::from_millis(1)),
    );
    stage.start().unwrap();
    eventually(|| stage.stats().failures >= 3);

    let value = stage.wait_get_latest_timeout(PATIENCE).unwrap();
    assert_eq!(value % 2, 1);
    assert!(stage.stats().last_error.unwrap().starts_with("dropped frame"));
    stage.shutdown().unwrap();
}

#[test]
fn start_twice_is_rejected() {
    use std::convert::Infallible;

    let mut stage = ContinuousStage::with_config(
        || Ok::<_, Infallible>(0_u8),
        StageConfig::new().with_min_interval(Duration::from_millis(5)),
    );
    stage.start().unwrap();
    assert!(matches!(stage.start(), Err(StageError::AlreadyStarted)));
}
