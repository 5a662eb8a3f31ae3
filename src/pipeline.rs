use std::{fmt, sync::Arc, time::Duration};

use crate::{
    config::StageConfig,
    error::{StageError, WaitError},
    reader::LatestReader,
    slot::LatestValueSlot,
    stats::{StageMetrics, StageStats},
    work::Transform,
    worker::{Lifecycle, Worker},
};

/// A stage that consumes inputs, transforms them on its worker thread, and
/// publishes the results.
///
/// Both sides are single-item mailboxes: an input published while the worker
/// is busy replaces any input still waiting, and an output nobody consumed is
/// replaced by the next one. The worker always works on the newest input
/// available when it becomes free.
///
/// Dropping the stage shuts the worker down.
pub struct PipelineStage<I, O, X> {
    config: StageConfig,
    input: Arc<LatestValueSlot<I>>,
    output: Arc<LatestValueSlot<O>>,
    metrics: Arc<StageMetrics>,
    lifecycle: Lifecycle<X>,
}

impl<I, O, X> PipelineStage<I, O, X>
where
    I: Send + 'static,
    O: Send + 'static,
    X: Transform<I, O>,
{
    /// Returns a stage that will apply `transform` once started.
    pub fn new(transform: X) -> Self {
        Self::with_config(transform, StageConfig::default())
    }

    /// Returns a stage that will apply `transform` with `config` once
    /// started.
    pub fn with_config(transform: X, config: StageConfig) -> Self {
        Self {
            config,
            input: Arc::new(LatestValueSlot::new()),
            output: Arc::new(LatestValueSlot::new()),
            metrics: Arc::default(),
            lifecycle: Lifecycle::Idle(transform),
        }
    }

    /// Spawns the worker thread. An input published before starting is the
    /// first one transformed.
    ///
    /// # Errors
    ///
    /// - [`StageError::AlreadyStarted`]: the stage was started before.
    /// - [`StageError::Spawn`]: the thread could not be spawned. The stage
    ///   can't be started again.
    pub fn start(&mut self) -> Result<(), StageError> {
        let mut transform = self.lifecycle.begin_start()?;
        let name = self.config.name().to_owned();
        let input = self.input.clone();
        let output = self.output.clone();
        let metrics = self.metrics.clone();

        let worker = Worker::spawn(
            self.config.name(),
            move |stop| {
                while !stop.is_set() {
                    // Closing the input on shutdown ends this wait. The cycle
                    // is marked in flight before the input stops looking
                    // pending.
                    let value = input.wait_consume_with(|| metrics.mark_in_flight());
                    let _cycle = metrics.cycle();
                    let Ok(value) = value else {
                        break;
                    };
                    if stop.is_set() {
                        break;
                    }

                    match transform.transform(value) {
                        Ok(value) => {
                            metrics.record_published();
                            output.publish(value);
                        }
                        Err(err) => metrics.record_failure(&name, &err),
                    }
                }
            },
            {
                let output = self.output.clone();
                let input = self.input.clone();
                move || {
                    input.close();
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
                self.input.close();
                self.output.close();
                Err(err)
            }
        }
    }
}

impl<I, O, X> PipelineStage<I, O, X> {
    /// Hands `value` to the worker, replacing any input it hasn't picked up
    /// yet. Never blocks.
    pub fn publish_input(&self, value: I) {
        self.input.publish(value);
    }

    /// Returns true if an input is waiting for the worker.
    #[must_use]
    pub fn is_input_pending(&self) -> bool {
        self.input.is_fresh()
    }

    /// Returns true while the worker is transforming an input. The answer is
    /// only a snapshot.
    #[must_use]
    pub fn is_updating(&self) -> bool {
        self.metrics.in_flight()
    }

    /// Takes the latest output if it hasn't been consumed yet. Never blocks.
    #[must_use]
    pub fn try_get_output(&self) -> Option<O> {
        self.output.try_consume()
    }

    /// Returns a copy of the latest output, consumed or not.
    #[must_use]
    pub fn peek_output(&self) -> Option<O>
    where
        O: Clone,
    {
        self.output.peek()
    }

    /// Blocks until a new output is published and takes it.
    ///
    /// # Errors
    ///
    /// - [`WaitError::NotStarted`]: the stage was never started.
    /// - [`WaitError::Disconnected`]: the worker has stopped and the last
    ///   output has been consumed.
    pub fn wait_get_output(&self) -> Result<O, WaitError> {
        self.ensure_started()?;
        Ok(self.output.wait_consume()?)
    }

    /// Blocks until a new output is published or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// - [`WaitError::NotStarted`]: the stage was never started.
    /// - [`WaitError::Disconnected`]: the worker has stopped and the last
    ///   output has been consumed.
    /// - [`WaitError::Timeout`]: nothing was published in time.
    pub fn wait_get_output_timeout(&self, timeout: Duration) -> Result<O, WaitError> {
        self.ensure_started()?;
        Ok(self.output.wait_consume_timeout(timeout)?)
    }

    /// Returns a handle for reading this stage's output from other threads.
    pub fn reader(&self) -> LatestReader<O> {
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

    /// Stops the worker and joins it. A transform already running is allowed
    /// to finish; inputs still waiting are not transformed.
    ///
    /// # Errors
    ///
    /// - [`StageError::ShutdownTimeout`]: the transform did not return within
    ///   the configured grace period. Shutting down can be retried.
    /// - [`StageError::WorkerPanicked`]: the transform panicked.
    pub fn shutdown(&mut self) -> Result<(), StageError> {
        let input = &self.input;
        self.lifecycle.shutdown(self.config.shutdown_grace(), || {
            input.close();
        })
    }

    fn ensure_started(&self) -> Result<(), WaitError> {
        if self.lifecycle.has_started() {
            Ok(())
        } else {
            Err(WaitError::NotStarted)
        }
    }
}

impl<I, O, X> Drop for PipelineStage<I, O, X> {
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

impl<I, O, X> fmt::Debug for PipelineStage<I, O, X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStage")
            .field("name", &self.config.name())
            .field("running", &self.lifecycle.is_running())
            .field("input", &self.input.state())
            .field("output", &self.output.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
const PATIENCE: Duration = Duration::from_secs(5);

#[cfg(test)]
fn doubler() -> PipelineStage<u32, u32, impl FnMut(u32) -> Result<u32, std::convert::Infallible>>
{
    PipelineStage::new(|x: u32| Ok(x * 2))
}

#[test]
fn transforms_inputs() {
    let mut stage = doubler();
    stage.start().unwrap();
    stage.publish_input(21);
    assert_eq!(stage.wait_get_output_timeout(PATIENCE), Ok(42));
    assert_eq!(stage.try_get_output(), None);
    assert_eq!(stage.stats().published, 1);
}

#[test]
fn latest_input_wins_before_start() {
    use crate::eventually;

    let mut stage = doubler();
    stage.publish_input(5);
    stage.publish_input(9);
    assert!(stage.is_input_pending());
    stage.start().unwrap();
    assert_eq!(stage.wait_get_output_timeout(PATIENCE), Ok(18));
    eventually(|| !stage.is_updating());
    assert!(!stage.is_input_pending());
    // The overwritten input is never transformed.
    assert_eq!(stage.stats().published, 1);
}

#[test]
fn back_to_back_inputs() {
    let mut stage = doubler();
    stage.start().unwrap();
    stage.publish_input(5);
    stage.publish_input(9);
    let output = stage.wait_get_output_timeout(PATIENCE).unwrap();
    assert!(output == 10 || output == 18, "unexpected output {output}");
    if output == 10 {
        // 5 was picked up before 9 arrived, so 9 is transformed next.
        assert_eq!(stage.wait_get_output_timeout(PATIENCE), Ok(18));
    }
}

#[test]
fn busy_worker_only_sees_newest_input() {
    use std::sync::mpsc;

    use crate::eventually;

    let (entered_tx, entered_rx) = mpsc::channel();
    let gate = Arc::new(LatestValueSlot::<()>::new());
    let mut stage = PipelineStage::new({
        let gate = gate.clone();
        move |x: u32| {
            let _ = entered_tx.send(x);
            gate.wait_consume_timeout(PATIENCE)
                .map(|()| x + 100)
                .map_err(|err| err.to_string())
        }
    });
    stage.start().unwrap();

    stage.publish_input(1);
    assert_eq!(entered_rx.recv_timeout(PATIENCE), Ok(1));
    assert!(stage.is_updating());
    // The worker is busy with 1, so 2 and 3 compete for the input slot.
    stage.publish_input(2);
    stage.publish_input(3);
    gate.publish(());
    assert_eq!(entered_rx.recv_timeout(PATIENCE), Ok(3));
    gate.publish(());

    eventually(|| stage.peek_output() == Some(103));
    assert_eq!(stage.try_get_output(), Some(103));
    assert_eq!(stage.stats().published, 2);
}

#[test]
fn failed_transform_moves_on() {
    use crate::eventually;

    let mut stage = PipelineStage::new(|text: &'static str| text.parse::<u32>());
    stage.start().unwrap();
    stage.publish_input("not a number");
    eventually(|| stage.stats().failures == 1);
    assert_eq!(stage.try_get_output(), None);

    stage.publish_input("12");
    assert_eq!(stage.wait_get_output_timeout(PATIENCE), Ok(12));
    assert!(stage.stats().last_error.is_some());
}

#[test]
fn usage_errors() {
    let mut stage = doubler();
    assert_eq!(stage.wait_get_output(), Err(WaitError::NotStarted));
    stage.start().unwrap();
    assert!(matches!(stage.start(), Err(StageError::AlreadyStarted)));
}

#[test]
fn shutdown_stops_transforming() {
    use std::convert::Infallible;

    let mut stage = PipelineStage::with_config(
        |x: u32| Ok::<_, Infallible>(x + 1),
        StageConfig::new().with_name("incrementer"),
    );
    stage.start().unwrap();
    let reader = stage.reader();
    let waiting = std::thread::spawn(move || reader.wait());

    std::thread::sleep(Duration::from_millis(50));
    stage.shutdown().unwrap();
    assert!(waiting.join().unwrap().is_err());

    // Inputs published after shutdown are never picked up.
    stage.publish_input(1);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(stage.try_get_output(), None);
    assert_eq!(stage.wait_get_output(), Err(WaitError::Disconnected));
    assert_eq!(stage.stats().published, 0);
}

#[test]
fn busy_flags_cover_the_handoff() {
    let gate = Arc::new(LatestValueSlot::<()>::new());
    let mut stage = PipelineStage::new({
        let gate = gate.clone();
        move |x: u32| {
            gate.wait_consume_timeout(PATIENCE)
                .map(|()| x)
                .map_err(|err| err.to_string())
        }
    });
    stage.start().unwrap();

    for round in 0..50 {
        stage.publish_input(round);
        // Until its output shows up, an input is either still waiting or
        // being transformed. Checked in the order a polling caller would.
        for _ in 0..200 {
            assert!(stage.is_input_pending() || stage.is_updating());
        }
        gate.publish(());
        assert_eq!(stage.wait_get_output_timeout(PATIENCE), Ok(round));
    }
}

#[test]
fn shutdown_drops_waiting_input() {
    use std::sync::mpsc;

    let (entered_tx, entered_rx) = mpsc::channel();
    let gate = Arc::new(LatestValueSlot::<()>::new());
    let mut stage = PipelineStage::with_config(
        {
            let gate = gate.clone();
            move |x: u32| {
                let _ = entered_tx.send(x);
                gate.wait_consume_timeout(PATIENCE)
                    .map(|()| x)
                    .map_err(|err| err.to_string())
            }
        },
        StageConfig::new().with_shutdown_grace(Duration::from_millis(20)),
    );
    stage.start().unwrap();
    stage.publish_input(1);
    assert_eq!(entered_rx.recv_timeout(PATIENCE), Ok(1));
    stage.publish_input(2);

    assert!(matches!(
        stage.shutdown(),
        Err(StageError::ShutdownTimeout(_))
    ));
    gate.publish(());
    stage.shutdown().unwrap();

    // The transform that was running finished, the waiting input was never
    // picked up.
    assert_eq!(stage.try_get_output(), Some(1));
    assert!(entered_rx.try_recv().is_err());
    assert_eq!(stage.stats().published, 1);
}

#[test]
fn panicking_transform_stops_the_stage() {
    use std::convert::Infallible;

    use crate::eventually;

    let mut stage = PipelineStage::new(|x: u32| -> Result<u32, Infallible> {
        if x == 1 {
            panic!("transform crashed");
        }
        Ok(x)
    });
    stage.start().unwrap();
    let reader = stage.reader();
    stage.publish_input(1);
    assert!(reader.wait().is_err());

    eventually(|| !stage.is_running());
    assert!(!stage.is_updating());
    assert!(matches!(stage.shutdown(), Err(StageError::WorkerPanicked)));
}
