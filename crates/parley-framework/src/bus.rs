//! Event bus.
//!
//! A publish/subscribe facility with two delivery paths:
//!
//! - [`EventBus::publish`] fans an event out to its subscribers on the
//!   caller's task and reports every subscriber failure.
//! - [`EventBus::publish_async`] enqueues the event on a bounded queue and
//!   returns immediately. A fixed pool of workers drains the queue. When the
//!   queue is full, or the bus is not running, the event is dropped and
//!   counted; the publisher never blocks.
//!
//! Subscribers of a topic run before subscribers of [`WILDCARD_TOPIC`], each
//! group in registration order. A failing or panicking subscriber never
//! prevents the others from running.
//!
//! The lifecycle is `created → running → stopped`. A stopped bus cannot be
//! restarted.
//!
//! ```rust,ignore
//! let bus = EventBus::new(EventBusConfig::default());
//! let id = bus.subscribe(topics::COMMAND_EXECUTED, |event: Arc<Event>| async move {
//!     tracing::info!(command = event.get_str("command"), "Command executed");
//!     Ok(())
//! });
//!
//! bus.start()?;
//! bus.publish_async(Event::command_executed(42, "/start", "core", true));
//! bus.stop(Duration::from_secs(5)).await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{BoxError, BusError, BusResult, HandlerFault};
use parley_core::{Event, Metrics, NoopMetrics};

/// Subscribers of this topic receive every event.
pub const WILDCARD_TOPIC: &str = "*";

/// A subscriber callback.
pub type EventHandler =
    Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Decides whether a subscriber sees an event.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Identifies one subscription, for [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A subscription declared ahead of registration, as returned by
/// [`EventAware::subscriptions`](crate::module::EventAware::subscriptions).
#[derive(Clone)]
pub struct Subscription {
    topic: String,
    handler: EventHandler,
    filter: Option<EventFilter>,
    priority: i32,
}

impl Subscription {
    pub fn new<F, Fut>(topic: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            topic: topic.into(),
            handler: Arc::new(move |event: Arc<Event>| handler(event).boxed()),
            filter: None,
            priority: 0,
        }
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Informational only; delivery stays in registration order.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("filtered", &self.filter.is_some())
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Bus sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Worker tasks spawned by [`EventBus::start`]. Zero is allowed: the
    /// queue then only drains on [`EventBus::stop`].
    pub workers: usize,
    /// Queue slots; zero is treated as one.
    pub queue_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 1000,
        }
    }
}

/// Lifecycle state, as reported in [`EventBusStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A point-in-time view of the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventBusStats {
    pub subscribers_by_topic: HashMap<String, usize>,
    pub total_subscribers: usize,
    pub queue_len: usize,
    pub queue_capacity: usize,
    pub workers: usize,
    pub state: BusState,
    /// Events fanned out, synchronously or by a worker.
    pub published: u64,
    /// Events lost to a full queue or a bus that was not running.
    pub dropped: u64,
    /// Subscriber calls that failed or panicked.
    pub failed: u64,
}

struct Subscriber {
    id: SubscriptionId,
    handler: EventHandler,
    filter: Option<EventFilter>,
}

struct Running {
    tx: mpsc::Sender<Arc<Event>>,
    rx: Arc<AsyncMutex<mpsc::Receiver<Arc<Event>>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Outcome of a drain: `Err` carries the deadline that was missed.
type DrainOutcome = Option<Result<(), Duration>>;

enum State {
    Created,
    Running(Running),
    /// Resolves once the caller that began stopping has drained the queue.
    Stopping(watch::Receiver<DrainOutcome>),
    Stopped,
}

enum StopRole {
    Drain(Running, watch::Sender<DrainOutcome>),
    Join(watch::Receiver<DrainOutcome>),
    Done,
}

impl State {
    fn as_bus_state(&self) -> BusState {
        match self {
            Self::Created => BusState::Created,
            Self::Running(_) => BusState::Running,
            Self::Stopping(_) => BusState::Stopping,
            Self::Stopped => BusState::Stopped,
        }
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

struct Inner {
    config: EventBusConfig,
    subscribers: RwLock<HashMap<String, Vec<Arc<Subscriber>>>>,
    next_id: AtomicU64,
    state: Mutex<State>,
    metrics: RwLock<Arc<dyn Metrics>>,
    counters: Counters,
}

/// Publish/subscribe hub. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                state: Mutex::new(State::Created),
                metrics: RwLock::new(Arc::new(NoopMetrics)),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> EventBusConfig {
        self.inner.config
    }

    /// Routes bus counters and timings to `metrics`.
    pub fn set_metrics(&self, metrics: Arc<dyn Metrics>) {
        *self.inner.metrics.write() = metrics;
    }

    fn metrics(&self) -> Arc<dyn Metrics> {
        Arc::clone(&self.inner.metrics.read())
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    pub fn subscribe<F, Fut>(&self, topic: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.add(Subscription::new(topic, handler))
    }

    /// Like [`subscribe`](Self::subscribe), skipping events `filter` rejects.
    pub fn subscribe_with_filter<P, F, Fut>(
        &self,
        topic: impl Into<String>,
        filter: P,
        handler: F,
    ) -> SubscriptionId
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.add(Subscription::new(topic, handler).filter(filter))
    }

    /// Registers a prepared [`Subscription`].
    pub fn add(&self, subscription: Subscription) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(
            topic = %subscription.topic,
            subscription = %id,
            priority = subscription.priority,
            "Subscriber added"
        );

        let subscriber = Arc::new(Subscriber {
            id,
            handler: subscription.handler,
            filter: subscription.filter,
        });
        self.inner
            .subscribers
            .write()
            .entry(subscription.topic)
            .or_default()
            .push(subscriber);
        id
    }

    /// Removes one subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let Some(topic) = subscribers
            .iter()
            .find(|(_, list)| list.iter().any(|s| s.id == id))
            .map(|(topic, _)| topic.clone())
        else {
            return false;
        };

        if let Some(list) = subscribers.get_mut(&topic) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                subscribers.remove(&topic);
            }
        }
        debug!(%topic, subscription = %id, "Subscriber removed");
        true
    }

    fn matching(&self, topic: &str) -> Vec<Arc<Subscriber>> {
        let subscribers = self.inner.subscribers.read();
        let direct = subscribers.get(topic).into_iter().flatten();
        let wildcard = subscribers
            .get(WILDCARD_TOPIC)
            .filter(|_| topic != WILDCARD_TOPIC)
            .into_iter()
            .flatten();
        direct.chain(wildcard).cloned().collect()
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Delivers `event` to every matching subscriber on this task.
    ///
    /// Works in every lifecycle state. Returns
    /// [`BusError::SubscriberFailures`] listing each failed subscriber.
    pub async fn publish(&self, event: Event) -> BusResult<()> {
        self.deliver(Arc::new(event)).await
    }

    async fn deliver(&self, event: Arc<Event>) -> BusResult<()> {
        let start = Instant::now();
        let metrics = self.metrics();
        let mut failures = Vec::new();

        for subscriber in self.matching(&event.topic) {
            if let Some(filter) = &subscriber.filter
                && !filter(&event)
            {
                continue;
            }

            if let Err(reason) = invoke(&subscriber, Arc::clone(&event)).await {
                warn!(
                    topic = %event.topic,
                    subscription = %subscriber.id,
                    error = %reason,
                    "Event subscriber failed"
                );
                failures.push(format!("{}: {reason}", subscriber.id));
            }
        }

        let tags = [("topic", event.topic.as_str())];
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        metrics.increment("events.published", &tags);
        metrics.timing("events.processing_time", start.elapsed(), &tags);

        if failures.is_empty() {
            return Ok(());
        }
        self.inner
            .counters
            .failed
            .fetch_add(failures.len() as u64, Ordering::Relaxed);
        metrics.increment("events.errors", &tags);
        Err(BusError::SubscriberFailures {
            topic: event.topic.clone(),
            failures,
        })
    }

    /// Queues `event` for the workers without waiting.
    ///
    /// The event is dropped, with a warning and a counter bump, when the
    /// queue is full or the bus is not running.
    pub fn publish_async(&self, event: Event) {
        let event = Arc::new(event);
        let outcome = match &*self.inner.state.lock() {
            State::Running(running) => {
                running
                    .tx
                    .try_send(Arc::clone(&event))
                    .map_err(|e| match e {
                        TrySendError::Full(_) => "queue full",
                        TrySendError::Closed(_) => "queue closed",
                    })
            }
            _ => Err("bus not running"),
        };

        let tags = [("topic", event.topic.as_str())];
        match outcome {
            Ok(()) => self.metrics().increment("events.queued", &tags),
            Err(reason) => {
                self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics().increment("events.dropped", &tags);
                warn!(topic = %event.topic, reason, "Event dropped");
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawns the worker pool. Must be called from within a Tokio runtime.
    pub fn start(&self) -> BusResult<()> {
        let mut state = self.inner.state.lock();
        match *state {
            State::Created => {}
            State::Running(_) => return Err(BusError::AlreadyStarted),
            State::Stopping(_) | State::Stopped => return Err(BusError::Stopped),
        }

        let capacity = self.inner.config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(AsyncMutex::new(rx));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        for worker_id in 0..self.inner.config.workers {
            tracker.spawn(worker(
                self.clone(),
                worker_id,
                Arc::clone(&rx),
                cancel.clone(),
            ));
        }
        tracker.close();

        *state = State::Running(Running {
            tx,
            rx,
            cancel,
            tracker,
        });
        info!(
            workers = self.inner.config.workers,
            queue_capacity = capacity,
            "Event bus started"
        );
        Ok(())
    }

    /// Closes the queue and waits up to `timeout` for it to drain.
    ///
    /// Events queued before this call are delivered unless the deadline
    /// passes, in which case workers are cancelled and
    /// [`BusError::ShutdownTimeout`] is returned. Stopping a bus that was
    /// never started, or is already stopped, succeeds. A call made while
    /// another one is draining waits, up to its own `timeout`, for that
    /// drain and reports its outcome.
    pub async fn stop(&self, timeout: Duration) -> BusResult<()> {
        let role = {
            let mut state = self.inner.state.lock();
            match std::mem::replace(&mut *state, State::Stopped) {
                State::Running(running) => {
                    let (done_tx, done_rx) = watch::channel(None);
                    *state = State::Stopping(done_rx);
                    StopRole::Drain(running, done_tx)
                }
                State::Stopping(done) => {
                    let join = done.clone();
                    *state = State::Stopping(done);
                    StopRole::Join(join)
                }
                State::Created | State::Stopped => StopRole::Done,
            }
        };

        let (running, done) = match role {
            StopRole::Drain(running, done) => (running, done),
            StopRole::Join(done) => return join_stop(done, timeout).await,
            StopRole::Done => return Ok(()),
        };

        let Running {
            tx,
            rx,
            cancel,
            tracker,
        } = running;
        drop(tx);
        info!(
            pending = rx.try_lock().map(|rx| rx.len()).unwrap_or_default(),
            "Event bus stopping"
        );

        let drain = async {
            tracker.wait().await;
            // Leftovers when there are no workers.
            let mut rx = rx.lock().await;
            while let Ok(event) = rx.try_recv() {
                if let Err(e) = self.deliver(event).await {
                    debug!(error = %e, "Drained event had subscriber failures");
                }
            }
        };

        let outcome = match tokio::time::timeout(timeout, drain).await {
            Ok(()) => Ok(()),
            Err(_) => {
                cancel.cancel();
                warn!(?timeout, "Event bus did not drain in time");
                Err(timeout)
            }
        };

        done.send_replace(Some(outcome));
        *self.inner.state.lock() = State::Stopped;
        info!("Event bus stopped");
        outcome.map_err(BusError::ShutdownTimeout)
    }

    pub fn state(&self) -> BusState {
        self.inner.state.lock().as_bus_state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == BusState::Running
    }

    pub fn stats(&self) -> EventBusStats {
        let subscribers_by_topic: HashMap<String, usize> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(topic, list)| (topic.clone(), list.len()))
            .collect();
        let total_subscribers = subscribers_by_topic.values().sum();

        let (state, queue_len) = {
            let state = self.inner.state.lock();
            let queue_len = match &*state {
                State::Running(running) => running.tx.max_capacity() - running.tx.capacity(),
                _ => 0,
            };
            (state.as_bus_state(), queue_len)
        };

        let counters = &self.inner.counters;
        EventBusStats {
            subscribers_by_topic,
            total_subscribers,
            queue_len,
            queue_capacity: self.inner.config.queue_capacity.max(1),
            workers: self.inner.config.workers,
            state,
            published: counters.published.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.inner.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Publishes an event built from parts without waiting for delivery.
pub fn emit(
    bus: &EventBus,
    topic: impl Into<String>,
    source: impl Into<String>,
    data: Map<String, Value>,
) {
    let mut event = Event::new(topic, source);
    event.data = data;
    bus.publish_async(event);
}

/// Waits for a stop already in progress on another task.
async fn join_stop(mut done: watch::Receiver<DrainOutcome>, timeout: Duration) -> BusResult<()> {
    let finished = tokio::time::timeout(timeout, done.wait_for(Option::is_some))
        .await
        .map(|outcome| outcome.map(|outcome| *outcome));
    match finished {
        Ok(Ok(Some(outcome))) => outcome.map_err(BusError::ShutdownTimeout),
        // the draining call was dropped before it finished
        Ok(Ok(None) | Err(_)) => Err(BusError::ShutdownTimeout(timeout)),
        Err(_) => {
            warn!(?timeout, "Gave up waiting for the event bus to drain");
            Err(BusError::ShutdownTimeout(timeout))
        }
    }
}

async fn invoke(subscriber: &Subscriber, event: Arc<Event>) -> Result<(), String> {
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(event))) {
        Ok(fut) => fut,
        Err(payload) => return Err(HandlerFault::from_panic(payload).to_string()),
    };

    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(HandlerFault::from_panic(payload).to_string()),
    }
}

async fn worker(
    bus: EventBus,
    worker_id: usize,
    rx: Arc<AsyncMutex<mpsc::Receiver<Arc<Event>>>>,
    cancel: CancellationToken,
) {
    debug!(worker_id, "Event worker started");
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = async { rx.lock().await.recv().await } => match event {
                Some(event) => event,
                None => break,
            },
        };

        if let Err(e) = bus.deliver(event).await {
            debug!(worker_id, error = %e, "Queued event had subscriber failures");
        }
    }
    debug!(worker_id, "Event worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::{assert_err, assert_ok};

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn counting(bus: &EventBus, topic: &str, count: &Arc<AtomicUsize>) -> SubscriptionId {
        let count = Arc::clone(count);
        bus.subscribe(topic, move |_event| {
            count.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
    }

    fn bus(workers: usize, queue_capacity: usize) -> EventBus {
        EventBus::new(EventBusConfig {
            workers,
            queue_capacity,
        })
    }

    #[tokio::test]
    async fn test_fan_out_isolates_failures() {
        let bus = bus(1, 8);
        let counts: Vec<_> = (0..4).map(|_| counter()).collect();
        counting(&bus, "t", &counts[0]);
        let failing = Arc::clone(&counts[1]);
        bus.subscribe("t", move |_event| {
            failing.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), BoxError>("disk full".into()) }
        });
        counting(&bus, "t", &counts[2]);
        counting(&bus, WILDCARD_TOPIC, &counts[3]);

        let result = bus.publish(Event::new("t", "test")).await;

        for count in &counts {
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
        match result {
            Err(BusError::SubscriberFailures { topic, failures }) => {
                assert_eq!(topic, "t");
                assert_eq!(failures.len(), 1);
                assert!(failures[0].contains("disk full"));
            }
            other => panic!("expected subscriber failures, got {other:?}"),
        }
        assert_eq!(bus.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_delivery_order() {
        let bus = bus(1, 8);
        let order = Arc::new(Mutex::new(Vec::new()));
        for (topic, label) in [
            (WILDCARD_TOPIC, "wild-1"),
            ("t", "t-1"),
            ("t", "t-2"),
            (WILDCARD_TOPIC, "wild-2"),
        ] {
            let order = Arc::clone(&order);
            bus.subscribe(topic, move |_event| {
                order.lock().push(label);
                async { Ok(()) }
            });
        }

        assert_ok!(bus.publish(Event::new("t", "test")).await);
        assert_eq!(*order.lock(), ["t-1", "t-2", "wild-1", "wild-2"]);
    }

    #[tokio::test]
    async fn test_panicking_subscriber_is_contained() {
        let bus = bus(1, 8);
        let count = counter();
        bus.subscribe("t", |_event| async {
            if true {
                panic!("subscriber bug");
            }
            Ok(())
        });
        counting(&bus, "t", &count);

        let err = assert_err!(bus.publish(Event::new("t", "test")).await);
        assert!(err.to_string().contains("subscriber bug"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_without_start() {
        let bus = bus(2, 8);
        let count = counter();
        counting(&bus, "t", &count);

        assert_ok!(bus.publish(Event::new("t", "test")).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.state(), BusState::Created);
    }

    #[tokio::test]
    async fn test_backpressure_drops_when_full() {
        let bus = bus(0, 2);
        assert_ok!(bus.start());

        for _ in 0..3 {
            bus.publish_async(Event::new("t", "test"));
        }

        let stats = bus.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.queue_len, 2);
    }

    #[tokio::test]
    async fn test_publish_async_before_start_is_dropped() {
        let bus = bus(1, 8);
        let count = counter();
        counting(&bus, "t", &count);

        bus.publish_async(Event::new("t", "test"));

        assert_eq!(bus.stats().dropped, 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_drains_queue() {
        let bus = bus(3, 100);
        let count = counter();
        counting(&bus, "t", &count);
        assert_ok!(bus.start());

        for _ in 0..50 {
            bus.publish_async(Event::new("t", "test"));
        }
        assert_ok!(bus.stop(Duration::from_secs(5)).await);

        assert_eq!(count.load(Ordering::SeqCst), 50);
        assert_eq!(bus.stats().dropped, 0);
        assert_eq!(bus.state(), BusState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_drains_without_workers() {
        let bus = bus(0, 10);
        let count = counter();
        counting(&bus, "t", &count);
        assert_ok!(bus.start());

        for _ in 0..3 {
            bus.publish_async(Event::new("t", "test"));
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert_ok!(bus.stop(Duration::from_secs(1)).await);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_times_out_on_slow_subscriber() {
        let bus = bus(1, 8);
        bus.subscribe("slow", |_event| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        assert_ok!(bus.start());
        bus.publish_async(Event::new("slow", "test"));

        let err = assert_err!(bus.stop(Duration::from_secs(1)).await);
        assert!(matches!(err, BusError::ShutdownTimeout(_)));
        assert_eq!(bus.state(), BusState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_stop_waits_for_the_same_drain() {
        let bus = bus(1, 8);
        let delivered = counter();
        let seen = Arc::clone(&delivered);
        bus.subscribe("slow", move |_event| {
            let seen = Arc::clone(&seen);
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        assert_ok!(bus.start());
        bus.publish_async(Event::new("slow", "test"));

        let first = tokio::spawn({
            let bus = bus.clone();
            async move { bus.stop(Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.state(), BusState::Stopping);

        assert_ok!(bus.stop(Duration::from_secs(5)).await);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_ok!(assert_ok!(first.await));
        assert_eq!(bus.state(), BusState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_stop_reports_missed_deadline() {
        let bus = bus(1, 8);
        bus.subscribe("slow", |_event| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        assert_ok!(bus.start());
        bus.publish_async(Event::new("slow", "test"));

        let first = tokio::spawn({
            let bus = bus.clone();
            async move { bus.stop(Duration::from_secs(1)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = assert_err!(bus.stop(Duration::from_secs(5)).await);
        assert!(matches!(err, BusError::ShutdownTimeout(d) if d == Duration::from_secs(1)));
        assert!(matches!(assert_ok!(first.await), Err(BusError::ShutdownTimeout(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let bus = bus(1, 8);
        assert_ok!(bus.start());
        assert!(matches!(bus.start(), Err(BusError::AlreadyStarted)));

        assert_ok!(bus.stop(Duration::from_secs(1)).await);
        assert!(matches!(bus.start(), Err(BusError::Stopped)));

        // stopping twice is harmless
        assert_ok!(bus.stop(Duration::from_secs(1)).await);

        bus.publish_async(Event::new("t", "test"));
        assert_eq!(bus.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_only_that_subscription() {
        let bus = bus(1, 8);
        let first = counter();
        let second = counter();
        let id = counting(&bus, "t", &first);
        counting(&bus, "t", &second);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        assert_ok!(bus.publish(Event::new("t", "test")).await);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().subscribers_by_topic["t"], 1);
    }

    #[tokio::test]
    async fn test_filter_skips_events() {
        let bus = bus(1, 8);
        let count = counter();
        let seen = Arc::clone(&count);
        bus.subscribe_with_filter(
            "t",
            |event| event.user_id == Some(7),
            move |_event| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        );

        assert_ok!(bus.publish(Event::new("t", "test").with_user(1)).await);
        assert_ok!(bus.publish(Event::new("t", "test").with_user(7)).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_emit_builds_event() {
        let bus = bus(0, 4);
        let received = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&received);
        bus.subscribe("user.action", move |event: Arc<Event>| {
            *slot.lock() = event.get_str("action").map(str::to_string);
            async { Ok(()) }
        });
        assert_ok!(bus.start());

        let mut data = Map::new();
        data.insert("action".into(), Value::from("subscribe"));
        emit(&bus, "user.action", "billing", data);
        assert_ok!(bus.stop(Duration::from_secs(1)).await);

        assert_eq!(received.lock().as_deref(), Some("subscribe"));
        assert_eq!(bus.stats().published, 1);
    }
}
