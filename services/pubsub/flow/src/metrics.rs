//! Side-channel instrumentation for publishers and subscribers.
//!
//! Counters are purely observational: every flow component works the same
//! with [`NoopMetrics`] as with [`FlowMetrics`].

use dashmap::DashMap;
use pubsub_wire::TopicName;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

/// Number of topic publishers created
pub const TOPIC_PUBLISHER_OBJECTS_METRIC: &str = "topic_publisher_objects_total";
/// Number of items submitted to topic publishers
pub const TOPIC_PUBLISHER_SUBMITTED_MESSAGES_METRIC: &str = "topic_publisher_submitted_messages_total";
/// Number of delivery errors seen by topic publishers
pub const TOPIC_PUBLISHER_ERRORS_METRIC: &str = "topic_publisher_errors_total";
/// Number of topic subscribers created
pub const TOPIC_SUBSCRIBER_OBJECTS_METRIC: &str = "topic_subscriber_objects_total";
/// Number of items received by topic subscribers
pub const TOPIC_SUBSCRIBER_MESSAGES_RECEIVED_METRIC: &str = "topic_subscriber_messages_received_total";
/// Number of items requested by topic subscribers
pub const TOPIC_SUBSCRIBER_MESSAGES_REQUESTED_METRIC: &str =
    "topic_subscriber_messages_requested_total";

/// Receiver of flow instrumentation events.
///
/// All methods default to doing nothing.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    /// A publisher was created
    fn publisher_created(&self, _topic: &TopicName) {}
    /// An item was accepted by `submit`
    fn message_submitted(&self, _topic: &TopicName) {}
    /// Delivery to a subscriber failed
    fn publish_error(&self, _topic: &TopicName) {}
    /// A subscriber was created
    fn subscriber_created(&self, _topic: &TopicName) {}
    /// A subscriber received an item
    fn message_received(&self, _topic: &TopicName) {}
    /// A subscriber requested `n` more items
    fn messages_requested(&self, _topic: &TopicName, _n: u64) {}
}

/// Sink that discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Default sink used when none is injected
pub fn noop() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}

#[derive(Debug, Default)]
struct TopicCounters {
    publisher_objects: AtomicU64,
    submitted: AtomicU64,
    publish_errors: AtomicU64,
    subscriber_objects: AtomicU64,
    received: AtomicU64,
    requested: AtomicU64,
}

impl TopicCounters {
    fn snapshot(&self) -> TopicMetrics {
        TopicMetrics {
            publisher_objects: self.publisher_objects.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            subscriber_objects: self.subscriber_objects.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            requested: self.requested.load(Ordering::Relaxed),
        }
    }
}

/// Counter values for one topic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TopicMetrics {
    /// `topic_publisher_objects_total`
    pub publisher_objects: u64,
    /// `topic_publisher_submitted_messages_total`
    pub submitted: u64,
    /// `topic_publisher_errors_total`
    pub publish_errors: u64,
    /// `topic_subscriber_objects_total`
    pub subscriber_objects: u64,
    /// `topic_subscriber_messages_received_total`
    pub received: u64,
    /// `topic_subscriber_messages_requested_total`
    pub requested: u64,
}

/// In-memory per-topic counters
#[derive(Debug, Default)]
pub struct FlowMetrics {
    topics: DashMap<TopicName, TopicCounters>,
}

impl FlowMetrics {
    /// Create an empty counter set
    pub fn new() -> Self {
        Self::default()
    }

    fn with_counters(&self, topic: &TopicName, f: impl FnOnce(&TopicCounters)) {
        if let Some(counters) = self.topics.get(topic) {
            f(&counters);
            return;
        }
        f(&self.topics.entry(topic.clone()).or_default());
    }

    /// Counters of one topic (zero if never seen)
    pub fn topic(&self, topic: &TopicName) -> TopicMetrics {
        self.topics
            .get(topic)
            .map(|c| c.snapshot())
            .unwrap_or_default()
    }

    /// Counters of every topic, keyed by topic name
    pub fn snapshot(&self) -> BTreeMap<String, TopicMetrics> {
        self.topics
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().snapshot()))
            .collect()
    }
}

impl MetricsSink for FlowMetrics {
    fn publisher_created(&self, topic: &TopicName) {
        self.with_counters(topic, |c| {
            c.publisher_objects.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn message_submitted(&self, topic: &TopicName) {
        self.with_counters(topic, |c| {
            c.submitted.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn publish_error(&self, topic: &TopicName) {
        self.with_counters(topic, |c| {
            c.publish_errors.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn subscriber_created(&self, topic: &TopicName) {
        self.with_counters(topic, |c| {
            c.subscriber_objects.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn message_received(&self, topic: &TopicName) {
        self.with_counters(topic, |c| {
            c.received.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn messages_requested(&self, topic: &TopicName, n: u64) {
        self.with_counters(topic, |c| {
            c.requested.fetch_add(n, Ordering::Relaxed);
        });
    }
}

/// Periodically logs the counters of a [`FlowMetrics`]
#[derive(Debug)]
pub struct MetricsLogger {
    metrics: Arc<FlowMetrics>,
    collection_interval: Duration,
}

impl MetricsLogger {
    /// Create a logger with a 30 second interval
    pub fn new(metrics: Arc<FlowMetrics>) -> Self {
        Self {
            metrics,
            collection_interval: Duration::from_secs(30),
        }
    }

    /// Set the logging interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.collection_interval = interval;
        self
    }

    /// Start logging on the current runtime
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = interval(self.collection_interval);
            debug!("Starting flow metrics logger (interval: {:?})", self.collection_interval);

            loop {
                timer.tick().await;
                self.log_metrics();
            }
        })
    }

    fn log_metrics(&self) {
        for (topic, m) in self.metrics.snapshot() {
            info!(
                "Flow metrics for {} - publishers: {}, submitted: {}, errors: {}, subscribers: {}, received: {}, requested: {}",
                topic,
                m.publisher_objects,
                m.submitted,
                m.publish_errors,
                m.subscriber_objects,
                m.received,
                m.requested
            );
        }
    }
}
