//! Flow error types.

use crate::subscription::SubscriberId;
use pubsub_wire::TopicName;
use thiserror::Error;

/// Publisher and subscriber errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// Subscriber is already bound to a subscription
    #[error("subscriber for {topic} is already subscribed")]
    AlreadySubscribed {
        /// Topic of the subscriber
        topic: TopicName,
    },

    /// Subscriber has no subscription yet
    #[error("subscriber for {topic} is not subscribed")]
    NotSubscribed {
        /// Topic of the subscriber
        topic: TopicName,
    },

    /// Publisher no longer accepts items or subscribers
    #[error("publisher for {topic} is closed")]
    PublisherClosed {
        /// Topic of the publisher
        topic: TopicName,
    },

    /// Subscriber queue is full and the publisher rejects on overflow
    #[error("queue of subscriber {subscriber} on {topic} is full")]
    QueueFull {
        /// Topic of the publisher
        topic: TopicName,
        /// Subscriber whose queue is full
        subscriber: SubscriberId,
    },

    /// Subscriber failed to handle a delivered item
    #[error("delivery to subscriber {subscriber} on {topic} failed: {reason}")]
    Delivery {
        /// Topic of the publisher
        topic: TopicName,
        /// Subscriber that failed
        subscriber: SubscriberId,
        /// Failure description
        reason: String,
    },

    /// Subscriber queues did not drain before the close deadline
    #[error("publisher for {topic} closed with {pending} undelivered items")]
    DrainTimeout {
        /// Topic of the publisher
        topic: TopicName,
        /// Items still queued when the deadline expired
        pending: usize,
    },

    /// Rejected configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Publisher was built outside a tokio runtime
    #[error("no tokio runtime available for delivery tasks")]
    NoRuntime,
}
