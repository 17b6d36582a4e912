//! Subscription handles and the instrumented subscription proxy.

use crate::metrics::MetricsSink;
use pubsub_wire::TopicName;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Identifier of a subscriber queue within one publisher
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Link between one publisher and one subscriber.
///
/// Items flow only while the subscriber has outstanding demand; every
/// delivered item consumes one unit of it.
pub trait Subscription: Send + Sync + fmt::Debug {
    /// Add `n` items to the outstanding demand
    fn request(&self, n: u64);

    /// Stop delivery; buffered items are discarded
    fn cancel(&self);
}

/// Subscription wrapper that counts requested items.
///
/// Calls are forwarded unchanged and in order; the proxy never buffers.
#[derive(Debug, Clone)]
pub struct SubscriptionProxy {
    inner: Arc<dyn Subscription>,
    topic: TopicName,
    requested: Arc<AtomicU64>,
    metrics: Arc<dyn MetricsSink>,
}

impl SubscriptionProxy {
    /// Wrap a publisher supplied subscription
    pub fn new(
        inner: Arc<dyn Subscription>,
        topic: TopicName,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            inner,
            topic,
            requested: Arc::new(AtomicU64::new(0)),
            metrics,
        }
    }

    /// Total items requested through this proxy
    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Relaxed)
    }
}

impl Subscription for SubscriptionProxy {
    fn request(&self, n: u64) {
        trace!("entering request({}) on {}", n, self.topic);
        self.inner.request(n);
        self.requested.fetch_add(n, Ordering::Relaxed);
        self.metrics.messages_requested(&self.topic, n);
        trace!("exiting request on {}", self.topic);
    }

    fn cancel(&self) {
        trace!("entering cancel on {}", self.topic);
        self.inner.cancel();
        trace!("exiting cancel on {}", self.topic);
    }
}
