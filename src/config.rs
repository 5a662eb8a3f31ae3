use std::time::Duration;

/// The name given to worker threads unless configured otherwise.
pub const DEFAULT_STAGE_NAME: &str = "latest-stage";

/// How long [`shutdown`](crate::TriggeredStage::shutdown) waits for a worker
/// by default.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Settings shared by every stage.
///
/// ```rust
/// use std::time::Duration;
/// use latest_stage::StageConfig;
///
/// let config = StageConfig::new()
///     .with_name("imu")
///     .with_min_interval(Duration::from_millis(10))
///     .with_shutdown_grace(Duration::from_secs(1));
/// assert_eq!(config.name(), "imu");
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
#[must_use]
pub struct StageConfig {
    name: String,
    min_interval: Option<Duration>,
    shutdown_grace: Duration,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            name: String::from(DEFAULT_STAGE_NAME),
            min_interval: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl StageConfig {
    /// Returns the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the name of the worker thread. The name also tags the stage's
    /// log events.
    pub fn with_name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    /// Sets the minimum time between the starts of two production cycles of a
    /// [`ContinuousStage`](crate::ContinuousStage). Other stages ignore it.
    pub fn with_min_interval(self, min_interval: Duration) -> Self {
        Self {
            min_interval: Some(min_interval),
            ..self
        }
    }

    /// Sets how long shutting down waits for the worker to reach a
    /// cancellation point before giving up with
    /// [`StageError::ShutdownTimeout`](crate::StageError::ShutdownTimeout).
    pub fn with_shutdown_grace(self, shutdown_grace: Duration) -> Self {
        Self {
            shutdown_grace,
            ..self
        }
    }

    /// Returns the worker thread's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the minimum interval between production cycles, if any.
    #[must_use]
    pub fn min_interval(&self) -> Option<Duration> {
        self.min_interval
    }

    /// Returns the shutdown grace period.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }
}

#[test]
fn defaults() {
    let config = StageConfig::default();
    assert_eq!(config.name(), DEFAULT_STAGE_NAME);
    assert_eq!(config.min_interval(), None);
    assert_eq!(config.shutdown_grace(), DEFAULT_SHUTDOWN_GRACE);
    assert_eq!(config, StageConfig::new());
}
