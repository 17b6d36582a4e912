//! Publisher and subscriber configuration.

use crate::error::FlowError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default per-subscriber queue bound
pub const DEFAULT_BUFFER_CAPACITY: usize = 256;

/// Default drain deadline for `close()`
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 30_000;

/// What `submit` does when a subscriber queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Wait until every target queue has room
    #[default]
    Block,
    /// Fail the submission without enqueuing anywhere
    Reject,
}

impl std::str::FromStr for BackpressurePolicy {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(BackpressurePolicy::Block),
            "reject" => Ok(BackpressurePolicy::Reject),
            other => Err(FlowError::InvalidConfig(format!(
                "unknown backpressure policy '{}'",
                other
            ))),
        }
    }
}

/// Topic publisher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Bound of every subscriber queue
    pub buffer_capacity: usize,
    /// Behaviour when a subscriber queue is full
    pub backpressure: BackpressurePolicy,
    /// Drain deadline for `close()`; `None` waits indefinitely
    pub close_timeout_ms: Option<u64>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            backpressure: BackpressurePolicy::Block,
            close_timeout_ms: Some(DEFAULT_CLOSE_TIMEOUT_MS),
        }
    }
}

impl PublisherConfig {
    /// Set the queue bound
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Set the overflow behaviour
    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    /// Set the drain deadline (`None` disables it)
    pub fn with_close_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.close_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Drain deadline as a `Duration`
    pub fn close_timeout(&self) -> Option<Duration> {
        self.close_timeout_ms.map(Duration::from_millis)
    }

    /// Check the configuration before use
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.buffer_capacity == 0 {
            return Err(FlowError::InvalidConfig(
                "buffer_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Topic subscriber configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Items requested as soon as the subscriber is bound
    pub initial_request: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self { initial_request: 1 }
    }
}
