/// Configuration for a host store replica.
use crate::error::{HostError, HostResult};
use std::time::Duration;

/// Tunables for a [`HostStore`](crate::store::HostStore).
#[derive(Debug, Clone)]
pub struct HostStoreConfig {
    /// Delay before the first anti-entropy round (default: 5 seconds).
    pub anti_entropy_initial_delay: Duration,
    /// Interval between anti-entropy rounds (default: 5 seconds).
    pub anti_entropy_period: Duration,
    /// Interval between location index self-checks (default: 60 seconds).
    /// `None` disables the check.
    pub index_check_period: Option<Duration>,
    /// Capacity of the event subscription channel (default: 256).
    pub event_channel_capacity: usize,
    /// How long `stop` waits for in-flight message handlers (default: 5 seconds).
    pub shutdown_timeout: Duration,
}

impl Default for HostStoreConfig {
    fn default() -> Self {
        Self {
            anti_entropy_initial_delay: Duration::from_secs(5),
            anti_entropy_period: Duration::from_secs(5),
            index_check_period: Some(Duration::from_secs(60)),
            event_channel_capacity: crate::events::DEFAULT_CHANNEL_CAPACITY,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl HostStoreConfig {
    /// Create a new config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the anti-entropy initial delay and period.
    pub fn anti_entropy(mut self, initial_delay: Duration, period: Duration) -> Self {
        self.anti_entropy_initial_delay = initial_delay;
        self.anti_entropy_period = period;
        self
    }

    /// Set the location index self-check period.
    pub fn index_check_period(mut self, period: Option<Duration>) -> Self {
        self.index_check_period = period;
        self
    }

    /// Set the event channel capacity.
    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Set the shutdown drain timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> HostResult<()> {
        if self.anti_entropy_period.is_zero() {
            return Err(HostError::invalid("anti-entropy period must be positive"));
        }
        if self.index_check_period.is_some_and(|period| period.is_zero()) {
            return Err(HostError::invalid("index check period must be positive"));
        }
        if self.event_channel_capacity == 0 {
            return Err(HostError::invalid("event channel capacity must be positive"));
        }
        Ok(())
    }
}
