//! Configuration handling for the pubsub tools.
//!
//! Settings come from the `pubsub` section of a YAML file, then environment
//! variables override individual values.

use anyhow::{Context, Result};
use pubsub_flow::{BackpressurePolicy, PublisherConfig, SubscriberConfig};
use pubsub_wire::to_absolute_name;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Default caller id advertised in connection headers
pub const DEFAULT_CALLER_ID: &str = "/pubsub";

/// Pubsub tool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Caller id written into connection headers
    pub caller_id: String,
    /// Publisher settings
    pub publisher: PublisherConfig,
    /// Subscriber settings
    pub subscriber: SubscriberConfig,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            caller_id: DEFAULT_CALLER_ID.to_string(),
            publisher: PublisherConfig::default(),
            subscriber: SubscriberConfig::default(),
        }
    }
}

/// Root of the YAML file
#[derive(Debug, Deserialize)]
struct RootConfig {
    pubsub: Option<PubSubConfig>,
}

impl PubSubConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    info!("Loaded configuration from {:?}", path);
                    root.pubsub.unwrap_or_default()
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.finish()
    }

    fn finish(mut self) -> Result<Self> {
        self.caller_id = to_absolute_name(&self.caller_id);
        self.publisher
            .validate()
            .context("invalid publisher configuration")?;

        info!(
            "Final pubsub configuration: caller_id={}, buffer_capacity={}, backpressure={:?}, close_timeout_ms={:?}, initial_request={}",
            self.caller_id,
            self.publisher.buffer_capacity,
            self.publisher.backpressure,
            self.publisher.close_timeout_ms,
            self.subscriber.initial_request
        );
        Ok(self)
    }

    /// Apply `PUBSUB_*` overrides read through `lookup`
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(caller_id) = lookup("PUBSUB_CALLER_ID") {
            info!("Caller id overridden by environment: {}", caller_id);
            self.caller_id = caller_id;
        }

        if let Some(value) = lookup("PUBSUB_BUFFER_CAPACITY") {
            match value.parse::<usize>() {
                Ok(capacity) => {
                    self.publisher.buffer_capacity = capacity;
                    info!("Buffer capacity overridden by environment: {}", capacity);
                }
                Err(_) => warn!("Ignoring invalid PUBSUB_BUFFER_CAPACITY '{}'", value),
            }
        }

        if let Some(value) = lookup("PUBSUB_BACKPRESSURE") {
            match value.parse::<BackpressurePolicy>() {
                Ok(policy) => {
                    self.publisher.backpressure = policy;
                    info!("Backpressure overridden by environment: {:?}", policy);
                }
                Err(e) => warn!("Ignoring PUBSUB_BACKPRESSURE: {}", e),
            }
        }

        if let Some(value) = lookup("PUBSUB_CLOSE_TIMEOUT_MS") {
            if value.eq_ignore_ascii_case("none") {
                self.publisher.close_timeout_ms = None;
                info!("Close timeout disabled by environment");
            } else {
                match value.parse::<u64>() {
                    Ok(ms) => {
                        self.publisher.close_timeout_ms = Some(ms);
                        info!("Close timeout overridden by environment: {}ms", ms);
                    }
                    Err(_) => warn!("Ignoring invalid PUBSUB_CLOSE_TIMEOUT_MS '{}'", value),
                }
            }
        }

        if let Some(value) = lookup("PUBSUB_INITIAL_REQUEST") {
            match value.parse::<u64>() {
                Ok(n) => {
                    self.subscriber.initial_request = n;
                    info!("Initial request overridden by environment: {}", n);
                }
                Err(_) => warn!("Ignoring invalid PUBSUB_INITIAL_REQUEST '{}'", value),
            }
        }
    }
}
