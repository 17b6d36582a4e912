//! Pull-based topic subscribers.
//!
//! [`Subscriber`] is the contract a publisher drives. [`TopicSubscriber`] is
//! the provided implementation: it binds exactly once, issues the initial
//! request, counts received items and applies default error handling, while
//! a user supplied [`TopicHandler`] decides what to do with each item and
//! when to ask for more.

use crate::config::SubscriberConfig;
use crate::error::FlowError;
use crate::metrics::{self, MetricsSink};
use crate::subscription::{Subscription, SubscriptionProxy};
use pubsub_wire::{MessageType, TopicName};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Receiving side of a publisher/subscriber link
pub trait Subscriber<M>: Send + 'static {
    /// Called once by the publisher before any item is delivered
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) -> Result<(), FlowError>;

    /// Called for every delivered item, in submission order.
    ///
    /// Returning an error terminates the subscription.
    fn on_next(&mut self, item: M) -> anyhow::Result<()>;

    /// Called when the subscription ends abnormally
    fn on_error(&mut self, error: &FlowError);

    /// Called after the publisher closed and every queued item was delivered
    fn on_complete(&mut self);
}

/// How a subscriber's lifecycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Publisher closed normally
    Completed,
    /// Subscription ended with an error
    Errored,
    /// Subscriber cancelled its subscription
    Cancelled,
}

/// Lifecycle state of a [`TopicSubscriber`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// Not yet bound to a publisher
    Unsubscribed,
    /// Bound and able to receive
    Subscribed,
    /// No further items will arrive
    Terminated(Termination),
}

/// Per-subscriber state handed to every [`TopicHandler`] callback
#[derive(Debug)]
pub struct SubscriberContext {
    topic: TopicName,
    message_type: MessageType,
    initial_request: u64,
    subscription: Option<SubscriptionProxy>,
    state: SubscriberState,
    received: u64,
    error_notice_shown: bool,
    metrics: Arc<dyn MetricsSink>,
}

impl SubscriberContext {
    fn new(topic: TopicName, message_type: MessageType) -> Self {
        Self {
            topic,
            message_type,
            initial_request: SubscriberConfig::default().initial_request,
            subscription: None,
            state: SubscriberState::Unsubscribed,
            received: 0,
            error_notice_shown: false,
            metrics: metrics::noop(),
        }
    }

    /// Topic this subscriber listens to
    pub fn topic(&self) -> &TopicName {
        &self.topic
    }

    /// Type of the messages in the topic
    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    /// Current lifecycle state
    pub fn state(&self) -> SubscriberState {
        self.state
    }

    /// Items received so far
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Items requested so far, including the initial request
    pub fn requested(&self) -> u64 {
        self.subscription
            .as_ref()
            .map(|s| s.requested())
            .unwrap_or(0)
    }

    /// The bound subscription, if any
    pub fn subscription(&self) -> Option<&SubscriptionProxy> {
        self.subscription.as_ref()
    }

    /// Ask the publisher for `n` more items
    pub fn request(&self, n: u64) -> Result<(), FlowError> {
        let subscription = self.subscription.as_ref().ok_or_else(|| FlowError::NotSubscribed {
            topic: self.topic.clone(),
        })?;
        subscription.request(n);
        Ok(())
    }

    /// Cancel the subscription; no further items are delivered
    pub fn cancel(&mut self) -> Result<(), FlowError> {
        let subscription = self.subscription.as_ref().ok_or_else(|| FlowError::NotSubscribed {
            topic: self.topic.clone(),
        })?;
        if let SubscriberState::Terminated(_) = self.state {
            return Ok(());
        }
        subscription.cancel();
        self.state = SubscriberState::Terminated(Termination::Cancelled);
        debug!("Subscriber for {} cancelled after {} items", self.topic, self.received);
        Ok(())
    }

    /// Default error handling: log the error, and once per subscriber explain
    /// how to replace this behaviour.
    pub fn report_error(&mut self, error: &FlowError) {
        error!("Default subscriber error handler on {}: {}", self.topic, error);
        if !self.error_notice_shown {
            warn!(
                "Subscriber errors on {} are handled by the default handler; implement TopicHandler::on_error to change this",
                self.topic
            );
            self.error_notice_shown = true;
        }
    }

    fn bind(&mut self, subscription: Arc<dyn Subscription>) -> Result<(), FlowError> {
        if self.subscription.is_some() {
            return Err(FlowError::AlreadySubscribed {
                topic: self.topic.clone(),
            });
        }

        let proxy = SubscriptionProxy::new(subscription, self.topic.clone(), self.metrics.clone());
        self.state = SubscriberState::Subscribed;
        if self.initial_request > 0 {
            proxy.request(self.initial_request);
        }
        self.subscription = Some(proxy);
        debug!(
            "Subscriber for {} ({}) bound, initial request {}",
            self.topic, self.message_type, self.initial_request
        );
        Ok(())
    }
}

/// User logic of a [`TopicSubscriber`].
///
/// Only `on_next` is required. The core never requests beyond the initial
/// quantity; call [`SubscriberContext::request`] to keep items flowing.
pub trait TopicHandler<M>: Send + 'static {
    /// Handle one item
    fn on_next(&mut self, ctx: &mut SubscriberContext, item: M) -> anyhow::Result<()>;

    /// Handle a subscription error
    fn on_error(&mut self, ctx: &mut SubscriberContext, error: &FlowError) {
        ctx.report_error(error);
    }

    /// Handle normal completion
    fn on_complete(&mut self, _ctx: &mut SubscriberContext) {}
}

impl<M, F> TopicHandler<M> for F
where
    F: FnMut(&mut SubscriberContext, M) -> anyhow::Result<()> + Send + 'static,
{
    fn on_next(&mut self, ctx: &mut SubscriberContext, item: M) -> anyhow::Result<()> {
        self(ctx, item)
    }
}

/// Topic subscriber composed of the default lifecycle and a [`TopicHandler`]
#[derive(Debug)]
pub struct TopicSubscriber<M, H> {
    ctx: SubscriberContext,
    handler: H,
    _marker: PhantomData<fn(M)>,
}

impl<M, H> TopicSubscriber<M, H>
where
    H: TopicHandler<M>,
{
    /// Create a subscriber that requests one item when bound
    pub fn new(topic: impl Into<TopicName>, message_type: MessageType, handler: H) -> Self {
        Self {
            ctx: SubscriberContext::new(topic.into(), message_type),
            handler,
            _marker: PhantomData,
        }
    }

    /// Number of items to request when first bound
    pub fn with_initial_request(mut self, n: u64) -> Self {
        self.ctx.initial_request = n;
        self
    }

    /// Apply a subscriber configuration
    pub fn with_config(self, config: &SubscriberConfig) -> Self {
        self.with_initial_request(config.initial_request)
    }

    /// Report events to `sink`; the subscriber is counted on it immediately
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        sink.subscriber_created(&self.ctx.topic);
        self.ctx.metrics = sink;
        self
    }

    /// Subscriber state and counters
    pub fn context(&self) -> &SubscriberContext {
        &self.ctx
    }

    /// The user handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Current lifecycle state
    pub fn state(&self) -> SubscriberState {
        self.ctx.state
    }

    /// Items received so far
    pub fn received(&self) -> u64 {
        self.ctx.received
    }
}

impl<M, H> Subscriber<M> for TopicSubscriber<M, H>
where
    M: Send + 'static,
    H: TopicHandler<M>,
{
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) -> Result<(), FlowError> {
        self.ctx.bind(subscription)
    }

    fn on_next(&mut self, item: M) -> anyhow::Result<()> {
        self.ctx.received += 1;
        self.ctx.metrics.message_received(&self.ctx.topic);
        self.handler.on_next(&mut self.ctx, item)
    }

    fn on_error(&mut self, error: &FlowError) {
        self.ctx.state = SubscriberState::Terminated(Termination::Errored);
        self.handler.on_error(&mut self.ctx, error);
    }

    fn on_complete(&mut self) {
        self.ctx.state = SubscriberState::Terminated(Termination::Completed);
        self.handler.on_complete(&mut self.ctx);
    }
}
