use std::{io, time::Duration};

/// A blocking consume failed because the slot was closed and held no fresh
/// value.
#[derive(Debug, thiserror::Error, Eq, PartialEq, Clone, Copy)]
#[error("the slot has been closed and holds no fresh value")]
pub struct Disconnected;

/// A blocking consume with a timeout failed.
#[derive(Debug, thiserror::Error, Eq, PartialEq, Clone, Copy)]
pub enum TimeoutError {
    /// The slot was closed and held no fresh value.
    #[error("the slot has been closed and holds no fresh value")]
    Disconnected,
    /// No new value was published before the timeout elapsed.
    #[error("no new value was published before the timeout elapsed")]
    Timeout,
}

impl From<Disconnected> for TimeoutError {
    fn from(_: Disconnected) -> Self {
        Self::Disconnected
    }
}

/// A blocking read from a stage's output failed.
#[derive(Debug, thiserror::Error, Eq, PartialEq, Clone, Copy)]
pub enum WaitError {
    /// The stage was never started, so no value would ever arrive.
    #[error("the stage has not been started")]
    NotStarted,
    /// The stage's worker has stopped and the last value has already been
    /// consumed.
    #[error("the stage's worker has stopped")]
    Disconnected,
    /// No new value was published before the timeout elapsed.
    #[error("no new value was published before the timeout elapsed")]
    Timeout,
}

impl From<Disconnected> for WaitError {
    fn from(_: Disconnected) -> Self {
        Self::Disconnected
    }
}

impl From<TimeoutError> for WaitError {
    fn from(err: TimeoutError) -> Self {
        match err {
            TimeoutError::Disconnected => Self::Disconnected,
            TimeoutError::Timeout => Self::Timeout,
        }
    }
}

/// An error from a stage's lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// `start()` was called on a stage that has already been started.
    #[error("the stage has already been started")]
    AlreadyStarted,
    /// The worker did not reach a cancellation point within the grace period.
    /// The stage keeps its worker handle, so shutting down can be retried.
    #[error("the worker did not stop within {0:?}")]
    ShutdownTimeout(Duration),
    /// The worker thread panicked, most likely inside the producer.
    #[error("the worker thread panicked")]
    WorkerPanicked,
    /// The operating system refused to spawn the worker thread.
    #[error("failed to spawn the worker thread: {0}")]
    Spawn(#[from] io::Error),
}
