use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    error::{Disconnected, TimeoutError},
    slot::{LatestValueSlot, SlotStream},
};

/// A read-only handle to a stage's output.
///
/// Readers can be cloned and moved to other threads. They consume from the
/// same output slot as the stage itself, so each published value reaches at
/// most one consumer. Once the stage's worker stops, blocking reads return the
/// last unconsumed value and then fail with [`Disconnected`].
///
/// Iterating a reader blocks for each new value and ends when the worker
/// stops.
#[derive(Debug)]
#[must_use]
pub struct LatestReader<T> {
    slot: Arc<LatestValueSlot<T>>,
}

impl<T> Clone for LatestReader<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> LatestReader<T> {
    pub(crate) fn new(slot: Arc<LatestValueSlot<T>>) -> Self {
        Self { slot }
    }

    /// Takes the latest value if it hasn't been consumed yet. Never blocks.
    #[must_use]
    pub fn try_get(&self) -> Option<T> {
        self.slot.try_consume()
    }

    /// Returns a copy of the latest value without consuming it.
    #[must_use]
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.slot.peek()
    }

    /// Returns true if a value is waiting to be consumed.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.slot.is_fresh()
    }

    /// Blocks until a new value is available and takes it.
    ///
    /// # Errors
    ///
    /// Returns [`Disconnected`] once the worker has stopped and the last value
    /// has been consumed.
    pub fn wait(&self) -> Result<T, Disconnected> {
        self.slot.wait_consume()
    }

    /// Blocks until a new value is available or `duration` elapses.
    ///
    /// # Errors
    ///
    /// - [`TimeoutError::Disconnected`]: the worker has stopped and the last
    ///   value has been consumed.
    /// - [`TimeoutError::Timeout`]: nothing was published in time.
    pub fn wait_timeout(&self, duration: Duration) -> Result<T, TimeoutError> {
        self.slot.wait_consume_timeout(duration)
    }

    /// Blocks until a new value is available or `deadline` is reached.
    ///
    /// # Errors
    ///
    /// - [`TimeoutError::Disconnected`]: the worker has stopped and the last
    ///   value has been consumed.
    /// - [`TimeoutError::Timeout`]: nothing was published in time.
    pub fn wait_until(&self, deadline: Instant) -> Result<T, TimeoutError> {
        self.slot.wait_consume_until(deadline)
    }

    /// Waits asynchronously until a new value is available and takes it.
    ///
    /// # Errors
    ///
    /// Returns [`Disconnected`] once the worker has stopped and the last value
    /// has been consumed.
    pub async fn wait_async(&self) -> Result<T, Disconnected> {
        self.slot.wait_consume_async().await
    }

    /// Returns this reader as a [`Stream`](futures_util::Stream) of values.
    pub fn into_stream(self) -> SlotStream<T> {
        SlotStream::new(self.slot)
    }
}

impl<T> Iterator for LatestReader<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        self.wait().ok()
    }
}
