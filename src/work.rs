use std::fmt::Display;

/// Produces a new value each time a stage's worker runs a cycle.
///
/// Implemented for every `FnMut() -> Result<T, E>` closure, so most callers
/// never implement it by hand. Types wrapping a device or connection can
/// implement it directly:
///
/// ```rust
/// use latest_stage::Producer;
///
/// struct Counter(u64);
///
/// impl Producer<u64> for Counter {
///     type Error = std::convert::Infallible;
///
///     fn produce(&mut self) -> Result<u64, Self::Error> {
///         self.0 += 1;
///         Ok(self.0)
///     }
/// }
/// ```
pub trait Producer<T>: Send + 'static {
    /// The error reported when a cycle fails.
    type Error: Display + Send + 'static;

    /// Runs one production cycle. This is called on the worker thread with no
    /// locks held and may take as long as it needs.
    ///
    /// # Errors
    ///
    /// A failed cycle publishes nothing. The stage records the error and
    /// keeps running.
    fn produce(&mut self) -> Result<T, Self::Error>;
}

impl<F, T, E> Producer<T> for F
where
    F: FnMut() -> Result<T, E> + Send + 'static,
    E: Display + Send + 'static,
{
    type Error = E;

    fn produce(&mut self) -> Result<T, E> {
        self()
    }
}

/// Turns each input consumed by a [`PipelineStage`](crate::PipelineStage)
/// into an output.
///
/// Implemented for every `FnMut(I) -> Result<O, E>` closure.
pub trait Transform<I, O>: Send + 'static {
    /// The error reported when a transform fails.
    type Error: Display + Send + 'static;

    /// Transforms one input. This is called on the worker thread with no
    /// locks held.
    ///
    /// # Errors
    ///
    /// A failed transform publishes nothing. The stage records the error and
    /// moves on to the next input.
    fn transform(&mut self, input: I) -> Result<O, Self::Error>;
}

impl<F, I, O, E> Transform<I, O> for F
where
    F: FnMut(I) -> Result<O, E> + Send + 'static,
    E: Display + Send + 'static,
{
    type Error = E;

    fn transform(&mut self, input: I) -> Result<O, E> {
        self(input)
    }
}
