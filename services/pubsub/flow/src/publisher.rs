//! Topic publisher.
//!
//! Every subscriber gets its own bounded queue and a delivery task on the
//! runtime the publisher was built on. `submit` fans an item out to all
//! current queues; the delivery task hands items to the subscriber only while
//! it has outstanding demand, so a slow subscriber fills its own queue and
//! never holds up its siblings once the item is enqueued.

use crate::config::{BackpressurePolicy, PublisherConfig};
use crate::error::FlowError;
use crate::metrics::{self, MetricsSink};
use crate::subscriber::Subscriber;
use crate::subscription::{SubscriberId, Subscription};
use pubsub_wire::{MessageType, TopicName};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Callback invoked for every failed delivery
pub type ErrorHook = Arc<dyn Fn(&FlowError) + Send + Sync>;

#[derive(Debug, Clone)]
enum Stop {
    Cancelled,
    Completed,
    Aborted(FlowError),
}

enum Outcome {
    Stopped(Stop),
    Failed(FlowError),
}

/// State shared between a queue, its delivery task and its subscription
#[derive(Debug)]
struct SlotState {
    id: SubscriberId,
    demand: AtomicU64,
    stop: OnceLock<Stop>,
    wakeup: Notify,
}

impl SlotState {
    fn new(id: SubscriberId) -> Self {
        Self {
            id,
            demand: AtomicU64::new(0),
            stop: OnceLock::new(),
            wakeup: Notify::new(),
        }
    }

    /// First stop wins
    fn stop(&self, stop: Stop) {
        let _ = self.stop.set(stop);
        self.wakeup.notify_one();
    }
}

struct Slot<M> {
    tx: mpsc::Sender<M>,
    state: Arc<SlotState>,
    handle: Option<JoinHandle<()>>,
}

impl<M> Slot<M> {
    fn lag(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

struct PublisherState<M> {
    open: bool,
    /// Slots were handed to a close or abort
    finished: bool,
    next_id: u64,
    slots: BTreeMap<SubscriberId, Slot<M>>,
}

struct Shared<M> {
    topic: TopicName,
    message_type: MessageType,
    config: PublisherConfig,
    runtime: Handle,
    state: Mutex<PublisherState<M>>,
    drained: Notify,
    closed: watch::Sender<Option<Result<(), FlowError>>>,
    metrics: Arc<dyn MetricsSink>,
    error_hook: ErrorHook,
}

impl<M> Shared<M> {
    fn lock_state(&self) -> MutexGuard<'_, PublisherState<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn total_lag(&self) -> usize {
        self.lock_state().slots.values().map(Slot::lag).sum()
    }

    /// Stop accepting work and take every remaining slot
    fn take_slots(&self) -> BTreeMap<SubscriberId, Slot<M>> {
        let mut state = self.lock_state();
        state.open = false;
        state.finished = true;
        std::mem::take(&mut state.slots)
    }

    fn closed_error(&self) -> FlowError {
        FlowError::PublisherClosed {
            topic: self.topic.clone(),
        }
    }

    /// Wait for the first `close` to finish and return its result
    async fn wait_closed(&self) -> Result<(), FlowError> {
        let mut done = self.closed.subscribe();
        let result = match done.wait_for(Option::is_some).await {
            Ok(result) => result.clone(),
            Err(_) => None,
        };
        result.unwrap_or(Ok(()))
    }

    fn detach(&self, id: SubscriberId) -> bool {
        let removed = self.lock_state().slots.remove(&id).is_some();
        if removed {
            self.drained.notify_waiters();
        }
        removed
    }
}

fn abort_slots<M>(slots: &BTreeMap<SubscriberId, Slot<M>>, err: &FlowError) {
    for slot in slots.values() {
        slot.state.stop(Stop::Aborted(err.clone()));
    }
}

/// Publishes the result of a `close` call to concurrent callers.
///
/// Dropped without a result, the close was cancelled during the drain: the
/// remaining subscriptions are aborted with [`FlowError::PublisherClosed`].
struct CloseGuard<'a, M> {
    shared: &'a Shared<M>,
    result: Option<Result<(), FlowError>>,
}

impl<M> Drop for CloseGuard<'_, M> {
    fn drop(&mut self) {
        let result = match self.result.take() {
            Some(result) => result,
            None => {
                let slots = self.shared.take_slots();
                warn!(
                    "Close of {} cancelled, aborting {} subscriptions",
                    self.shared.topic,
                    slots.len()
                );
                let err = self.shared.closed_error();
                abort_slots(&slots, &err);
                Err(err)
            }
        };
        self.shared.closed.send_replace(Some(result));
    }
}

/// Subscription handed to subscribers of a [`TopicPublisher`]
struct QueueSubscription<M> {
    slot: Arc<SlotState>,
    shared: Weak<Shared<M>>,
}

impl<M> fmt::Debug for QueueSubscription<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSubscription")
            .field("subscriber", &self.slot.id)
            .field("demand", &self.slot.demand.load(Ordering::Relaxed))
            .finish()
    }
}

impl<M: Send + 'static> Subscription for QueueSubscription<M> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        let _ = self
            .slot
            .demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| Some(d.saturating_add(n)));
        self.slot.wakeup.notify_one();
    }

    fn cancel(&self) {
        self.slot.stop(Stop::Cancelled);
        if let Some(shared) = self.shared.upgrade() {
            if shared.detach(self.slot.id) {
                debug!("Subscriber {} on {} cancelled", self.slot.id, shared.topic);
            }
        }
    }
}

/// Builder for [`TopicPublisher`]
pub struct PublisherBuilder<M> {
    topic: TopicName,
    message_type: MessageType,
    config: PublisherConfig,
    metrics: Arc<dyn MetricsSink>,
    error_hook: Option<ErrorHook>,
    _marker: PhantomData<fn() -> M>,
}

impl<M> PublisherBuilder<M>
where
    M: Clone + Send + 'static,
{
    /// Use `config` instead of the defaults
    pub fn config(mut self, config: PublisherConfig) -> Self {
        self.config = config;
        self
    }

    /// Report events to `sink`
    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    /// Replace the default delivery error handler, which logs the error
    pub fn on_publish_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&FlowError) + Send + Sync + 'static,
    {
        self.error_hook = Some(Arc::new(hook));
        self
    }

    /// Create the publisher on the current tokio runtime
    pub fn build(self) -> Result<TopicPublisher<M>, FlowError> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| FlowError::NoRuntime)?;

        let error_hook: ErrorHook = match self.error_hook {
            Some(hook) => hook,
            None => Arc::new(|e: &FlowError| error!("Publish error: {}", e)),
        };

        self.metrics.publisher_created(&self.topic);
        debug!(
            "Created publisher for {} ({}), buffer capacity {}",
            self.topic, self.message_type, self.config.buffer_capacity
        );

        Ok(TopicPublisher {
            shared: Arc::new(Shared {
                topic: self.topic,
                message_type: self.message_type,
                config: self.config,
                runtime,
                state: Mutex::new(PublisherState {
                    open: true,
                    finished: false,
                    next_id: 0,
                    slots: BTreeMap::new(),
                }),
                drained: Notify::new(),
                closed: watch::channel(None).0,
                metrics: self.metrics,
                error_hook,
            }),
            submit_lock: tokio::sync::Mutex::new(()),
        })
    }
}

/// Broadcasts items of one topic to every current subscriber.
///
/// Items are delivered to each subscriber in submission order, also when
/// `submit` is called from several tasks. Subscribers attached after an item
/// was submitted never see it.
pub struct TopicPublisher<M> {
    shared: Arc<Shared<M>>,
    submit_lock: tokio::sync::Mutex<()>,
}

impl<M> fmt::Debug for TopicPublisher<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock_state();
        f.debug_struct("TopicPublisher")
            .field("topic", &self.shared.topic)
            .field("message_type", &self.shared.message_type)
            .field("open", &state.open)
            .field("subscribers", &state.slots.len())
            .finish()
    }
}

impl<M> TopicPublisher<M>
where
    M: Clone + Send + 'static,
{
    /// Start building a publisher for `topic`
    pub fn builder(topic: impl Into<TopicName>, message_type: MessageType) -> PublisherBuilder<M> {
        PublisherBuilder {
            topic: topic.into(),
            message_type,
            config: PublisherConfig::default(),
            metrics: metrics::noop(),
            error_hook: None,
            _marker: PhantomData,
        }
    }

    /// Publisher with the default configuration
    pub fn new(topic: impl Into<TopicName>, message_type: MessageType) -> Result<Self, FlowError> {
        Self::builder(topic, message_type).build()
    }

    /// Topic name
    pub fn topic(&self) -> &TopicName {
        &self.shared.topic
    }

    /// Message type of the topic
    pub fn message_type(&self) -> &MessageType {
        &self.shared.message_type
    }

    /// Active configuration
    pub fn config(&self) -> &PublisherConfig {
        &self.shared.config
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        !self.shared.lock_state().open
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.shared.lock_state().slots.len()
    }

    /// Largest number of items queued for a single subscriber
    pub fn estimate_maximum_lag(&self) -> usize {
        self.shared
            .lock_state()
            .slots
            .values()
            .map(Slot::lag)
            .max()
            .unwrap_or(0)
    }

    /// Items queued across all subscribers
    pub fn estimate_total_lag(&self) -> usize {
        self.shared.total_lag()
    }

    /// Attach a subscriber.
    ///
    /// The subscriber's `on_subscribe` runs before this returns; its error,
    /// if any, is returned and nothing is attached.
    pub fn subscribe<S>(&self, mut subscriber: S) -> Result<SubscriberId, FlowError>
    where
        S: Subscriber<M>,
    {
        let id = {
            let mut state = self.shared.lock_state();
            if !state.open {
                return Err(self.closed_error());
            }
            state.next_id += 1;
            SubscriberId(state.next_id)
        };

        let slot = Arc::new(SlotState::new(id));
        let (tx, rx) = mpsc::channel(self.shared.config.buffer_capacity);
        subscriber.on_subscribe(Arc::new(QueueSubscription {
            slot: slot.clone(),
            shared: Arc::downgrade(&self.shared),
        }))?;

        let mut state = self.shared.lock_state();
        if !state.open {
            drop(state);
            let err = self.closed_error();
            subscriber.on_error(&err);
            return Err(err);
        }

        let handle = self
            .shared
            .runtime
            .spawn(deliver(self.shared.clone(), slot.clone(), rx, subscriber));
        state.slots.insert(
            id,
            Slot {
                tx,
                state: slot,
                handle: Some(handle),
            },
        );
        debug!("Subscriber {} attached to {}", id, self.shared.topic);
        Ok(id)
    }

    /// Enqueue `item` for every current subscriber.
    ///
    /// Returns the number of queues the item was placed in. With
    /// [`BackpressurePolicy::Block`] this waits for room in every queue; with
    /// [`BackpressurePolicy::Reject`] a full queue fails the call and the item
    /// is enqueued nowhere.
    pub async fn submit(&self, item: M) -> Result<usize, FlowError> {
        let _guard = self.submit_lock.lock().await;

        let targets: Vec<(SubscriberId, mpsc::Sender<M>)> = {
            let state = self.shared.lock_state();
            if !state.open {
                return Err(self.closed_error());
            }
            state
                .slots
                .iter()
                .map(|(id, slot)| (*id, slot.tx.clone()))
                .collect()
        };

        let mut permits = Vec::with_capacity(targets.len());
        for (id, tx) in &targets {
            let reserved = match self.shared.config.backpressure {
                BackpressurePolicy::Block => tx.reserve().await.ok(),
                BackpressurePolicy::Reject => match tx.try_reserve() {
                    Ok(permit) => Some(permit),
                    Err(TrySendError::Full(())) => {
                        return Err(FlowError::QueueFull {
                            topic: self.shared.topic.clone(),
                            subscriber: *id,
                        });
                    }
                    Err(TrySendError::Closed(())) => None,
                },
            };
            match reserved {
                Some(permit) => permits.push(permit),
                None => trace!("Skipping detached subscriber {} on {}", id, self.shared.topic),
            }
        }

        let delivered = permits.len();
        let mut permits = permits.into_iter();
        if let Some(last) = permits.next_back() {
            for permit in permits {
                permit.send(item.clone());
            }
            last.send(item);
        }

        self.shared.metrics.message_submitted(&self.shared.topic);
        Ok(delivered)
    }

    /// Stop accepting items and wait for subscribers to drain.
    ///
    /// Once every queued item has been handed out, each subscriber gets
    /// `on_complete` and this returns. If the configured deadline expires
    /// first, the remaining subscriptions end with
    /// [`FlowError::DrainTimeout`] and so does this call.
    ///
    /// Only the first call does the work. Later and concurrent calls wait
    /// for it and return its result.
    ///
    /// Dropping the returned future before the drain finishes aborts the
    /// remaining subscriptions with [`FlowError::PublisherClosed`], which is
    /// then the result seen by other callers. Dropping it while delivery
    /// tasks are being awaited keeps the result already decided.
    pub async fn close(&self) -> Result<(), FlowError> {
        let first = {
            let mut state = self.shared.lock_state();
            if state.open {
                state.open = false;
                info!(
                    "Closing publisher for {} with {} subscribers",
                    self.shared.topic,
                    state.slots.len()
                );
                true
            } else {
                false
            }
        };
        if !first {
            return self.shared.wait_closed().await;
        }

        let mut guard = CloseGuard {
            shared: &self.shared,
            result: None,
        };

        let drain = async {
            // in-flight submissions finish before draining starts
            let _guard = self.submit_lock.lock().await;
            loop {
                let notified = self.shared.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.shared.total_lag() == 0 {
                    break;
                }
                notified.await;
            }
        };

        let drained = match self.shared.config.close_timeout() {
            Some(limit) => tokio::time::timeout(limit, drain).await.is_ok(),
            None => {
                drain.await;
                true
            }
        };

        let slots = self.shared.take_slots();
        let pending: usize = slots.values().map(Slot::lag).sum();
        let result = if drained {
            for slot in slots.values() {
                slot.state.stop(Stop::Completed);
            }
            Ok(())
        } else {
            let err = FlowError::DrainTimeout {
                topic: self.shared.topic.clone(),
                pending,
            };
            warn!("{}", err);
            abort_slots(&slots, &err);
            Err(err)
        };
        guard.result = Some(result.clone());

        let handles: Vec<JoinHandle<()>> = slots.into_values().filter_map(|s| s.handle).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Delivery task for {} ended abnormally: {}", self.shared.topic, e);
            }
        }

        debug!("Publisher for {} closed", self.shared.topic);
        drop(guard);
        result
    }

    fn closed_error(&self) -> FlowError {
        self.shared.closed_error()
    }
}

impl<M> Drop for TopicPublisher<M> {
    fn drop(&mut self) {
        let slots = {
            let mut state = self.shared.lock_state();
            if state.finished {
                return;
            }
            state.open = false;
            state.finished = true;
            std::mem::take(&mut state.slots)
        };

        warn!(
            "Publisher for {} dropped without close, aborting {} subscriptions",
            self.shared.topic,
            slots.len()
        );
        abort_slots(&slots, &self.shared.closed_error());
        self.shared
            .closed
            .send_replace(Some(Err(self.shared.closed_error())));
    }
}

async fn deliver<M, S>(
    shared: Arc<Shared<M>>,
    slot: Arc<SlotState>,
    mut rx: mpsc::Receiver<M>,
    mut subscriber: S,
) where
    M: Send + 'static,
    S: Subscriber<M>,
{
    let outcome = loop {
        if let Some(stop) = slot.stop.get() {
            break Outcome::Stopped(stop.clone());
        }

        if slot.demand.load(Ordering::Acquire) == 0 {
            slot.wakeup.notified().await;
            continue;
        }

        let item = tokio::select! {
            biased;
            _ = slot.wakeup.notified() => continue,
            item = rx.recv() => item,
        };
        let Some(item) = item else {
            break Outcome::Stopped(slot.stop.get().cloned().unwrap_or(Stop::Completed));
        };

        slot.demand.fetch_sub(1, Ordering::AcqRel);
        shared.drained.notify_waiters();

        let reason = match catch_unwind(AssertUnwindSafe(|| subscriber.on_next(item))) {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => format!("{:#}", e),
            Err(payload) => panic_reason(payload),
        };
        break Outcome::Failed(FlowError::Delivery {
            topic: shared.topic.clone(),
            subscriber: slot.id,
            reason,
        });
    };

    // slot stays attached until the outcome callback has run
    rx.close();

    match outcome {
        Outcome::Stopped(Stop::Completed) => {
            trace!("Subscriber {} on {} completed", slot.id, shared.topic);
            subscriber.on_complete();
        }
        Outcome::Stopped(Stop::Cancelled) => {}
        Outcome::Stopped(Stop::Aborted(err)) => subscriber.on_error(&err),
        Outcome::Failed(err) => {
            (shared.error_hook)(&err);
            shared.metrics.publish_error(&shared.topic);
            subscriber.on_error(&err);
        }
    }

    shared.detach(slot.id);
    drop(rx);
    shared.drained.notify_waiters();
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("subscriber panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("subscriber panicked: {}", msg)
    } else {
        "subscriber panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::FlowMetrics;
    use crate::subscriber::{SubscriberContext, TopicHandler, TopicSubscriber};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn numbers() -> MessageType {
        MessageType::new("std_msgs/UInt32")
    }

    #[derive(Clone, Default)]
    struct Tally {
        subscription: Arc<Mutex<Option<Arc<dyn Subscription>>>>,
        items: Arc<Mutex<Vec<u32>>>,
        errors: Arc<Mutex<Vec<FlowError>>>,
        completed: Arc<AtomicBool>,
    }

    impl Tally {
        fn items(&self) -> Vec<u32> {
            self.items.lock().unwrap().clone()
        }

        fn errors(&self) -> Vec<FlowError> {
            self.errors.lock().unwrap().clone()
        }

        fn completed(&self) -> bool {
            self.completed.load(Ordering::SeqCst)
        }

        fn request(&self, n: u64) {
            self.subscription.lock().unwrap().as_ref().unwrap().request(n);
        }

        fn cancel(&self) {
            self.subscription.lock().unwrap().as_ref().unwrap().cancel();
        }
    }

    /// Subscriber driven from the test body
    struct Manual {
        tally: Tally,
        initial: u64,
    }

    impl Subscriber<u32> for Manual {
        fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) -> Result<(), FlowError> {
            subscription.request(self.initial);
            *self.tally.subscription.lock().unwrap() = Some(subscription);
            Ok(())
        }

        fn on_next(&mut self, item: u32) -> anyhow::Result<()> {
            self.tally.items.lock().unwrap().push(item);
            Ok(())
        }

        fn on_error(&mut self, error: &FlowError) {
            self.tally.errors.lock().unwrap().push(error.clone());
        }

        fn on_complete(&mut self) {
            self.tally.completed.store(true, Ordering::SeqCst);
        }
    }

    /// Handler that keeps one item of demand outstanding
    struct Collector {
        tally: Tally,
        fail_at: Option<u32>,
        panic_at: Option<u32>,
    }

    impl TopicHandler<u32> for Collector {
        fn on_next(&mut self, ctx: &mut SubscriberContext, item: u32) -> anyhow::Result<()> {
            self.tally.items.lock().unwrap().push(item);
            if self.fail_at == Some(item) {
                anyhow::bail!("cannot handle {}", item);
            }
            if self.panic_at == Some(item) {
                panic!("boom at {}", item);
            }
            ctx.request(1)?;
            Ok(())
        }

        fn on_error(&mut self, _ctx: &mut SubscriberContext, error: &FlowError) {
            self.tally.errors.lock().unwrap().push(error.clone());
        }

        fn on_complete(&mut self, _ctx: &mut SubscriberContext) {
            self.tally.completed.store(true, Ordering::SeqCst);
        }
    }

    fn collector(tally: &Tally) -> TopicSubscriber<u32, Collector> {
        TopicSubscriber::new(
            "numbers",
            numbers(),
            Collector {
                tally: tally.clone(),
                fail_at: None,
                panic_at: None,
            },
        )
    }

    fn publisher(config: PublisherConfig) -> TopicPublisher<u32> {
        TopicPublisher::builder("numbers", numbers())
            .config(config)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_all_items_in_order() {
        let publisher = publisher(PublisherConfig::default().with_buffer_capacity(10));
        let a = Tally::default();
        let b = Tally::default();
        publisher.subscribe(collector(&a)).unwrap();
        publisher.subscribe(collector(&b)).unwrap();

        for i in 0..111 {
            assert_eq!(publisher.submit(i).await.unwrap(), 2);
        }
        publisher.close().await.unwrap();

        let expected: Vec<u32> = (0..111).collect();
        assert_eq!(a.items(), expected);
        assert_eq!(b.items(), expected);
        assert!(a.completed() && b.completed());
        assert!(a.errors().is_empty());
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_producers_keep_per_subscriber_order() {
        let publisher = Arc::new(publisher(PublisherConfig::default().with_buffer_capacity(4)));
        let tally = Tally::default();
        publisher.subscribe(collector(&tally)).unwrap();

        let mut tasks = Vec::new();
        for producer in 0..3u32 {
            let publisher = publisher.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..20u32 {
                    publisher.submit(producer * 100 + i).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        publisher.close().await.unwrap();

        let items = tally.items();
        assert_eq!(items.len(), 60);
        for producer in 0..3u32 {
            let own: Vec<u32> = items.iter().copied().filter(|i| i / 100 == producer).collect();
            let expected: Vec<u32> = (0..20).map(|i| producer * 100 + i).collect();
            assert_eq!(own, expected);
        }
    }

    #[tokio::test]
    async fn test_submit_without_subscribers() {
        let metrics = Arc::new(FlowMetrics::new());
        let publisher = TopicPublisher::<u32>::builder("numbers", numbers())
            .metrics(metrics.clone())
            .build()
            .unwrap();

        assert_eq!(publisher.submit(7).await.unwrap(), 0);
        assert_eq!(publisher.estimate_maximum_lag(), 0);
        publisher.close().await.unwrap();

        let m = metrics.topic(publisher.topic());
        assert_eq!(m.publisher_objects, 1);
        assert_eq!(m.submitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_policy_full_queue() {
        let publisher = publisher(
            PublisherConfig::default()
                .with_buffer_capacity(2)
                .with_backpressure(BackpressurePolicy::Reject)
                .with_close_timeout(Some(Duration::from_millis(50))),
        );
        let stalled = Tally::default();
        let healthy = Tally::default();
        publisher
            .subscribe(Manual {
                tally: stalled.clone(),
                initial: 0,
            })
            .unwrap();
        publisher.subscribe(collector(&healthy)).unwrap();

        assert_eq!(publisher.submit(0).await.unwrap(), 2);
        assert_eq!(publisher.submit(1).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = publisher.submit(2).await.unwrap_err();
        assert!(matches!(err, FlowError::QueueFull { .. }));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(healthy.items(), vec![0, 1]);
        assert_eq!(publisher.estimate_maximum_lag(), 2);

        let err = publisher.close().await.unwrap_err();
        assert!(matches!(err, FlowError::DrainTimeout { pending: 2, .. }));
        assert!(stalled.items().is_empty());
        assert!(matches!(stalled.errors()[..], [FlowError::DrainTimeout { .. }]));
        assert!(!stalled.completed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_policy_waits_for_demand() {
        let publisher = publisher(PublisherConfig::default().with_buffer_capacity(1));
        let tally = Tally::default();
        publisher
            .subscribe(Manual {
                tally: tally.clone(),
                initial: 0,
            })
            .unwrap();

        assert_eq!(publisher.submit(0).await.unwrap(), 1);
        assert_eq!(publisher.estimate_maximum_lag(), 1);

        let blocked = tokio::time::timeout(Duration::from_millis(50), publisher.submit(1)).await;
        assert!(blocked.is_err());

        tally.request(2);
        assert_eq!(publisher.submit(1).await.unwrap(), 1);
        publisher.close().await.unwrap();

        assert_eq!(tally.items(), vec![0, 1]);
        assert!(tally.completed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_limited_by_demand_and_cancel() {
        let publisher = publisher(PublisherConfig::default().with_buffer_capacity(8));
        let tally = Tally::default();
        publisher
            .subscribe(Manual {
                tally: tally.clone(),
                initial: 1,
            })
            .unwrap();

        for i in 0..3 {
            publisher.submit(i).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tally.items(), vec![0]);
        assert_eq!(publisher.estimate_maximum_lag(), 2);
        assert_eq!(publisher.estimate_total_lag(), 2);

        tally.cancel();
        assert_eq!(publisher.subscriber_count(), 0);
        assert_eq!(publisher.estimate_maximum_lag(), 0);
        tally.request(5);

        publisher.close().await.unwrap();
        assert_eq!(tally.items(), vec![0]);
        assert!(!tally.completed());
        assert!(tally.errors().is_empty());
    }

    #[tokio::test]
    async fn test_closed_publisher_rejects_work() {
        let publisher = publisher(PublisherConfig::default());
        publisher.close().await.unwrap();
        assert!(publisher.is_closed());

        assert!(matches!(
            publisher.submit(1).await,
            Err(FlowError::PublisherClosed { .. })
        ));

        let tally = Tally::default();
        let err = publisher.subscribe(collector(&tally)).unwrap_err();
        assert!(matches!(err, FlowError::PublisherClosed { .. }));
        assert!(tally.subscription.lock().unwrap().is_none());

        publisher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_subscriber_is_isolated() {
        let metrics = Arc::new(FlowMetrics::new());
        let reported = Arc::new(Mutex::new(Vec::new()));
        let hook_log = reported.clone();
        let publisher = TopicPublisher::<u32>::builder("numbers", numbers())
            .metrics(metrics.clone())
            .on_publish_error(move |e| hook_log.lock().unwrap().push(e.clone()))
            .build()
            .unwrap();

        let failing = Tally::default();
        let healthy = Tally::default();
        let failing_id = publisher
            .subscribe(TopicSubscriber::new(
                "numbers",
                numbers(),
                Collector {
                    tally: failing.clone(),
                    fail_at: Some(3),
                    panic_at: None,
                },
            ))
            .unwrap();
        publisher.subscribe(collector(&healthy)).unwrap();

        for i in 0..10 {
            publisher.submit(i).await.unwrap();
        }
        publisher.close().await.unwrap();

        assert_eq!(healthy.items(), (0..10).collect::<Vec<_>>());
        assert!(healthy.completed());
        assert_eq!(failing.items(), vec![0, 1, 2, 3]);
        assert!(!failing.completed());

        let reported = reported.lock().unwrap().clone();
        assert_eq!(reported.len(), 1);
        match &reported[0] {
            FlowError::Delivery { subscriber, reason, .. } => {
                assert_eq!(*subscriber, failing_id);
                assert!(reason.contains("cannot handle 3"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(failing.errors(), reported);
        assert_eq!(metrics.topic(publisher.topic()).publish_errors, 1);
    }

    #[tokio::test]
    async fn test_panicking_subscriber_reported() {
        let publisher = publisher(PublisherConfig::default());
        let tally = Tally::default();
        publisher
            .subscribe(TopicSubscriber::new(
                "numbers",
                numbers(),
                Collector {
                    tally: tally.clone(),
                    fail_at: None,
                    panic_at: Some(0),
                },
            ))
            .unwrap();

        publisher.submit(0).await.unwrap();
        publisher.close().await.unwrap();

        let errors = tally.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("boom at 0"));
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_no_replay() {
        let publisher = publisher(PublisherConfig::default());
        let early = Tally::default();
        let late = Tally::default();

        publisher.subscribe(collector(&early)).unwrap();
        for i in 0..3 {
            publisher.submit(i).await.unwrap();
        }
        publisher.subscribe(collector(&late)).unwrap();
        for i in 3..5 {
            assert_eq!(publisher.submit(i).await.unwrap(), 2);
        }
        publisher.close().await.unwrap();

        assert_eq!(early.items(), vec![0, 1, 2, 3, 4]);
        assert_eq!(late.items(), vec![3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_without_close_aborts_subscribers() {
        let tally = Tally::default();
        {
            let publisher = publisher(PublisherConfig::default());
            publisher
                .subscribe(Manual {
                    tally: tally.clone(),
                    initial: 0,
                })
                .unwrap();
            publisher.submit(1).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(tally.items().is_empty());
        assert!(matches!(tally.errors()[..], [FlowError::PublisherClosed { .. }]));
    }

    #[tokio::test]
    async fn test_bind_failure_attaches_nothing() {
        struct Rebound;

        impl Subscriber<u32> for Rebound {
            fn on_subscribe(&mut self, _s: Arc<dyn Subscription>) -> Result<(), FlowError> {
                Err(FlowError::AlreadySubscribed {
                    topic: TopicName::new("numbers"),
                })
            }
            fn on_next(&mut self, _item: u32) -> anyhow::Result<()> {
                Ok(())
            }
            fn on_error(&mut self, _error: &FlowError) {}
            fn on_complete(&mut self) {}
        }

        let publisher = publisher(PublisherConfig::default());
        let err = publisher.subscribe(Rebound).unwrap_err();
        assert!(matches!(err, FlowError::AlreadySubscribed { .. }));
        assert_eq!(publisher.subscriber_count(), 0);
        assert_eq!(publisher.submit(1).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_close_waits_for_first() {
        let publisher = Arc::new(publisher(PublisherConfig::default()));
        let tally = Tally::default();
        publisher
            .subscribe(Manual {
                tally: tally.clone(),
                initial: 0,
            })
            .unwrap();
        for i in 0..3 {
            publisher.submit(i).await.unwrap();
        }

        let first = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.close().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(publisher.is_closed());

        let early = tokio::time::timeout(Duration::from_millis(50), publisher.close()).await;
        assert!(early.is_err());

        tally.request(3);
        publisher.close().await.unwrap();
        assert_eq!(tally.items(), vec![0, 1, 2]);
        assert!(tally.completed());
        first.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_close_shares_timeout() {
        let publisher = Arc::new(publisher(
            PublisherConfig::default().with_close_timeout(Some(Duration::from_millis(100))),
        ));
        let tally = Tally::default();
        publisher
            .subscribe(Manual {
                tally: tally.clone(),
                initial: 0,
            })
            .unwrap();
        publisher.submit(1).await.unwrap();

        let first = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.close().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = publisher.close().await.unwrap_err();
        assert!(matches!(err, FlowError::DrainTimeout { pending: 1, .. }));
        assert_eq!(first.await.unwrap(), Err(err));
        assert_eq!(tally.errors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_close_aborts_subscriptions() {
        let publisher = publisher(PublisherConfig::default());
        let tally = Tally::default();
        publisher
            .subscribe(Manual {
                tally: tally.clone(),
                initial: 0,
            })
            .unwrap();
        publisher.submit(1).await.unwrap();

        let cancelled = tokio::time::timeout(Duration::from_millis(50), publisher.close()).await;
        assert!(cancelled.is_err());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(tally.items().is_empty());
        assert!(matches!(tally.errors()[..], [FlowError::PublisherClosed { .. }]));
        assert_eq!(publisher.subscriber_count(), 0);
        assert!(matches!(
            publisher.close().await,
            Err(FlowError::PublisherClosed { .. })
        ));

        drop(publisher);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tally.errors().len(), 1);
        assert!(!tally.completed());
    }

    /// Handler that records items and errors but never requests more
    struct Gated {
        tally: Tally,
    }

    impl TopicHandler<u32> for Gated {
        fn on_next(&mut self, _ctx: &mut SubscriberContext, item: u32) -> anyhow::Result<()> {
            self.tally.items.lock().unwrap().push(item);
            Ok(())
        }

        fn on_error(&mut self, _ctx: &mut SubscriberContext, error: &FlowError) {
            self.tally.errors.lock().unwrap().push(error.clone());
        }

        fn on_complete(&mut self, _ctx: &mut SubscriberContext) {
            self.tally.completed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_request_gates_delivery() {
        let publisher = publisher(
            PublisherConfig::default().with_close_timeout(Some(Duration::from_secs(1))),
        );
        let tally = Tally::default();
        publisher
            .subscribe(
                TopicSubscriber::new(
                    "numbers",
                    numbers(),
                    Gated {
                        tally: tally.clone(),
                    },
                )
                .with_initial_request(1),
            )
            .unwrap();

        for i in 0..10 {
            assert_eq!(publisher.submit(i).await.unwrap(), 1);
        }
        let err = publisher.close().await.unwrap_err();

        assert!(matches!(err, FlowError::DrainTimeout { pending: 9, .. }));
        assert_eq!(tally.items(), vec![0]);
        assert_eq!(tally.errors(), vec![err]);
        assert!(!tally.completed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_subscribe_during_submission_from_many_threads() {
        let publisher = Arc::new(publisher(PublisherConfig::default().with_buffer_capacity(16)));

        let producer = {
            let publisher = publisher.clone();
            tokio::spawn(async move {
                for i in 0..200u32 {
                    publisher.submit(i).await.unwrap();
                }
            })
        };

        let mut joiners = Vec::new();
        for _ in 0..8 {
            let publisher = publisher.clone();
            joiners.push(tokio::spawn(async move {
                tokio::task::yield_now().await;
                let tally = Tally::default();
                let id = publisher.subscribe(collector(&tally)).unwrap();
                (id, tally)
            }));
        }

        let mut subscribers = Vec::new();
        for joiner in joiners {
            subscribers.push(joiner.await.unwrap());
        }
        producer.await.unwrap();
        publisher.close().await.unwrap();

        let ids: HashSet<SubscriberId> = subscribers.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids.len(), 8);
        for (id, tally) in &subscribers {
            let items = tally.items();
            assert!(
                items.windows(2).all(|w| w[1] == w[0] + 1),
                "subscriber {id} saw a gap: {items:?}"
            );
            if let Some(last) = items.last() {
                assert_eq!(*last, 199);
                assert!(tally.completed());
            }
            assert!(tally.errors().is_empty());
        }
    }

    #[test]
    fn test_build_requires_runtime() {
        let result = TopicPublisher::<u32>::new("numbers", numbers());
        assert!(matches!(result, Err(FlowError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let result = TopicPublisher::<u32>::builder("numbers", numbers())
            .config(PublisherConfig::default().with_buffer_capacity(0))
            .build();
        assert!(matches!(result, Err(FlowError::InvalidConfig(_))));
    }
}
