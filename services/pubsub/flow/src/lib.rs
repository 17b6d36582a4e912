//! In-process topic publishing with subscriber-driven flow control.
//!
//! A [`TopicPublisher`] broadcasts every submitted item to all of its current
//! subscribers. Each subscriber owns a bounded queue and receives items only
//! as fast as it asks for them through its [`Subscription`]; a
//! [`TopicSubscriber`] wraps user logic in a [`TopicHandler`] and takes care
//! of binding, the initial request and default error handling.
//!
//! ## Example
//!
//! ```rust
//! use pubsub_flow::{SubscriberContext, TopicPublisher, TopicSubscriber};
//! use pubsub_wire::MessageType;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let ty = MessageType::new("std_msgs/String");
//! let publisher = TopicPublisher::<String>::new("chatter", ty.clone())?;
//!
//! publisher.subscribe(TopicSubscriber::new(
//!     "chatter",
//!     ty,
//!     |ctx: &mut SubscriberContext, msg: String| {
//!         println!("heard {}", msg);
//!         ctx.request(1)?;
//!         Ok(())
//!     },
//! ))?;
//!
//! publisher.submit("hello".to_string()).await?;
//! publisher.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod publisher;
pub mod subscriber;
pub mod subscription;

// Re-export main types
pub use config::{BackpressurePolicy, PublisherConfig, SubscriberConfig};
pub use error::FlowError;
pub use metrics::{FlowMetrics, MetricsLogger, MetricsSink, NoopMetrics, TopicMetrics};
pub use publisher::{ErrorHook, PublisherBuilder, TopicPublisher};
pub use subscriber::{
    Subscriber, SubscriberContext, SubscriberState, Termination, TopicHandler, TopicSubscriber,
};
pub use subscription::{SubscriberId, Subscription, SubscriptionProxy};
