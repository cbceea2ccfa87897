use std::{
    collections::VecDeque,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TryRecvError, error::TrySendError},
    Mutex as AsyncMutex,
};
use tracing::{debug, error, warn};

use crate::{Event, EventPublisher, FnHandler, HandlerRef};

/// Errors surfaced when publishing or starting the dispatcher.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// A bounded queue with [`Overflow::DropNewest`] was full; the event was discarded.
    #[error("event queue full, dropped `{event_type}`")]
    QueueFull {
        /// Type of the discarded event.
        event_type: String,
    },
    /// The dispatch side of the queue is gone.
    #[error("event queue closed")]
    Closed,
    /// Another dispatch loop already owns the queue.
    #[error("dispatch loop already running")]
    AlreadyRunning,
}

/// What a bounded queue does when it is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Overflow {
    /// The publisher waits for space.
    #[default]
    Block,
    /// The new event is discarded and counted.
    DropNewest,
}

/// Sizing of the dispatch queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Publishing never waits; the queue grows without limit.
    #[default]
    Unbounded,
    /// Fixed capacity with an explicit overflow behavior.
    Bounded {
        /// Maximum number of queued events.
        capacity: usize,
        /// Behavior when `capacity` is reached.
        #[serde(default)]
        overflow: Overflow,
    },
}

/// Construction parameters for [`EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    /// Maximum time the dispatcher waits for an event before re-checking the stop flag.
    pub poll_interval: Duration,
    /// Queue bound and overflow policy.
    pub queue: QueuePolicy,
    /// Number of recently dispatched events retained for [`EventBus::recent`].
    pub backlog: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            queue: QueuePolicy::Unbounded,
            backlog: 64,
        }
    }
}

/// Counters describing bus activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Events accepted into the queue.
    pub published: u64,
    /// Events taken off the queue and delivered.
    pub dispatched: u64,
    /// Events discarded by a full bounded queue.
    pub dropped: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
}

enum QueueTx {
    Unbounded(mpsc::UnboundedSender<Event>),
    Bounded(mpsc::Sender<Event>, Overflow),
}

enum QueueRx {
    Unbounded(mpsc::UnboundedReceiver<Event>),
    Bounded(mpsc::Receiver<Event>),
}

impl QueueRx {
    async fn recv(&mut self) -> Option<Event> {
        match self {
            Self::Unbounded(rx) => rx.recv().await,
            Self::Bounded(rx) => rx.recv().await,
        }
    }

    fn try_recv(&mut self) -> Result<Event, TryRecvError> {
        match self {
            Self::Unbounded(rx) => rx.try_recv(),
            Self::Bounded(rx) => rx.try_recv(),
        }
    }
}

fn channel(policy: QueuePolicy) -> (QueueTx, QueueRx) {
    match policy {
        QueuePolicy::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueTx::Unbounded(tx), QueueRx::Unbounded(rx))
        }
        QueuePolicy::Bounded { capacity, overflow } => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (QueueTx::Bounded(tx, overflow), QueueRx::Bounded(rx))
        }
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
}

struct BusInner {
    config: BusConfig,
    subscriptions: RwLock<IndexMap<String, Vec<HandlerRef>>>,
    tx: QueueTx,
    rx: AsyncMutex<QueueRx>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    backlog: Mutex<VecDeque<Event>>,
    counters: Counters,
}

/// Asynchronous publish/subscribe dispatcher.
///
/// Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates an unbounded bus polling every 100ms.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Creates a bus from explicit settings.
    #[must_use]
    pub fn with_config(config: BusConfig) -> Self {
        let (tx, rx) = channel(config.queue);
        Self {
            inner: Arc::new(BusInner {
                config,
                subscriptions: RwLock::new(IndexMap::new()),
                tx,
                rx: AsyncMutex::new(rx),
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                backlog: Mutex::new(VecDeque::with_capacity(config.backlog)),
                counters: Counters::default(),
            }),
        }
    }

    /// Settings this bus was built with.
    #[must_use]
    pub fn config(&self) -> BusConfig {
        self.inner.config
    }

    /// Appends `handler` to the handlers of `event_type` and returns it for later
    /// [`unsubscribe`](Self::unsubscribe). The same handler may be registered twice.
    pub fn subscribe(&self, event_type: impl Into<String>, handler: HandlerRef) -> HandlerRef {
        let event_type = event_type.into();
        debug!(event_type = %event_type, "bus.subscribe");
        self.inner
            .subscriptions
            .write()
            .entry(event_type)
            .or_default()
            .push(Arc::clone(&handler));
        handler
    }

    /// Subscribes an async closure.
    pub fn subscribe_fn<F, Fut>(&self, event_type: impl Into<String>, f: F) -> HandlerRef
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe(event_type, Arc::new(FnHandler::new(f)))
    }

    /// Removes the first registration of `handler` for `event_type`.
    /// Returns `false` when it was not subscribed.
    pub fn unsubscribe(&self, event_type: &str, handler: &HandlerRef) -> bool {
        let mut subscriptions = self.inner.subscriptions.write();
        let Some(handlers) = subscriptions.get_mut(event_type) else {
            return false;
        };
        let target = Arc::as_ptr(handler).cast::<()>();
        match handlers
            .iter()
            .position(|h| Arc::as_ptr(h).cast::<()>() == target)
        {
            Some(pos) => {
                handlers.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Number of handlers currently registered for `event_type`.
    #[must_use]
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.inner
            .subscriptions
            .read()
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Enqueues an event. Only a bounded queue with [`Overflow::Block`] ever suspends.
    pub async fn publish(&self, event: Event) -> Result<(), BusError> {
        match &self.inner.tx {
            QueueTx::Bounded(tx, Overflow::Block) => {
                tx.send(event).await.map_err(|_| BusError::Closed)?;
                self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            _ => self.try_publish(event),
        }
    }

    /// Enqueues an event without suspending. A full bounded queue rejects the event
    /// regardless of its overflow policy.
    pub fn try_publish(&self, event: Event) -> Result<(), BusError> {
        let outcome = match &self.inner.tx {
            QueueTx::Unbounded(tx) => tx.send(event).map_err(|_| BusError::Closed),
            QueueTx::Bounded(tx, _) => tx.try_send(event).map_err(|err| match err {
                TrySendError::Full(event) => {
                    self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(event_type = %event.event_type, "bus.queue_full");
                    BusError::QueueFull {
                        event_type: event.event_type,
                    }
                }
                TrySendError::Closed(_) => BusError::Closed,
            }),
        };
        if outcome.is_ok() {
            self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Builds an [`Event`] and publishes it.
    pub async fn emit(
        &self,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        source: impl Into<String>,
    ) -> Result<(), BusError> {
        self.publish(Event::new(event_type, payload, source)).await
    }

    /// Runs the dispatch loop until [`stop`](Self::stop) is observed.
    ///
    /// The stop flag is checked at least once per poll interval. A stop issued before
    /// the loop starts makes it return at once. Exiting consumes the stop, so the bus can
    /// be started again. Events still queued when the loop exits are left undelivered.
    pub async fn start(&self) -> Result<(), BusError> {
        let Ok(mut rx) = self.inner.rx.try_lock() else {
            return Err(BusError::AlreadyRunning);
        };
        self.inner.running.store(true, Ordering::SeqCst);
        debug!("bus.dispatch.started");
        let poll = self.inner.config.poll_interval;
        while !self.inner.stop_requested.load(Ordering::SeqCst) {
            match tokio::time::timeout(poll, rx.recv()).await {
                Ok(Some(event)) => self.dispatch(event).await,
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        self.inner.stop_requested.store(false, Ordering::SeqCst);
        self.inner.running.store(false, Ordering::SeqCst);
        debug!("bus.dispatch.stopped");
        Ok(())
    }

    /// Delivers every event already queued, then returns how many were dispatched.
    ///
    /// Events published by handlers during this call are delivered too. Fails if the
    /// dispatch loop is running.
    pub async fn dispatch_pending(&self) -> Result<usize, BusError> {
        let Ok(mut rx) = self.inner.rx.try_lock() else {
            return Err(BusError::AlreadyRunning);
        };
        let mut delivered = 0;
        while let Ok(event) = rx.try_recv() {
            self.dispatch(event).await;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Signals the dispatch loop to exit at its next poll boundary. Honored by a loop
    /// that has not started yet.
    pub fn stop(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Whether a dispatch loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Most recently dispatched events, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<Event> {
        self.inner.backlog.lock().iter().cloned().collect()
    }

    /// Snapshot of the activity counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        let counters = &self.inner.counters;
        BusStats {
            published: counters.published.load(Ordering::Relaxed),
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            handler_failures: counters.handler_failures.load(Ordering::Relaxed),
        }
    }

    async fn dispatch(&self, event: Event) {
        let handlers: Vec<HandlerRef> = self
            .inner
            .subscriptions
            .read()
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            match AssertUnwindSafe(handler.handle(&event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.inner
                        .counters
                        .handler_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(event_type = %event.event_type, error = %err, "bus.handler_failed");
                }
                Err(_) => {
                    self.inner
                        .counters
                        .handler_failures
                        .fetch_add(1, Ordering::Relaxed);
                    error!(event_type = %event.event_type, "bus.handler_panicked");
                }
            }
        }
        self.inner.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        let capacity = self.inner.config.backlog;
        if capacity > 0 {
            let mut backlog = self.inner.backlog.lock();
            backlog.push_back(event);
            while backlog.len() > capacity {
                backlog.pop_front();
            }
        }
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, event: Event) -> anyhow::Result<()> {
        Self::publish(self, event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventHandler;
    use anyhow::bail;
    use serde_json::{json, Value};

    fn recorder(bus: &EventBus, event_type: &str) -> (HandlerRef, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = bus.subscribe_fn(event_type, move |event: Event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(event.payload);
                Ok(())
            }
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn ping_payloads_arrive_in_publish_order() {
        let bus = EventBus::new();
        let (_handler, seen) = recorder(&bus, "ping");
        for n in 1..=3 {
            bus.emit("ping", json!(n), "tester").await.unwrap();
        }
        assert_eq!(bus.dispatch_pending().await.unwrap(), 3);
        assert_eq!(*seen.lock(), vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn dispatch_loop_delivers_and_stops() {
        let bus = EventBus::with_config(BusConfig {
            poll_interval: Duration::from_millis(10),
            ..BusConfig::default()
        });
        let (_handler, seen) = recorder(&bus, "tick");
        let runner = bus.clone();
        let task = tokio::spawn(async move { runner.start().await });
        for n in 0..20 {
            bus.emit("tick", json!(n), "tester").await.unwrap();
        }
        for _ in 0..100 {
            if seen.lock().len() == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        bus.stop();
        task.await.unwrap().unwrap();
        let expected: Vec<Value> = (0..20).map(|n| json!(n)).collect();
        assert_eq!(*seen.lock(), expected);
        assert!(!bus.is_running());
        assert_eq!(bus.stats().dispatched, 20);
    }

    #[tokio::test]
    async fn failing_handlers_do_not_block_others() {
        struct Failing;
        #[async_trait]
        impl EventHandler for Failing {
            async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
                bail!("sensor offline")
            }
        }
        struct Panicking;
        #[async_trait]
        impl EventHandler for Panicking {
            async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
                panic!("handler bug")
            }
        }

        let bus = EventBus::new();
        bus.subscribe("ping", Arc::new(Failing));
        bus.subscribe("ping", Arc::new(Panicking));
        let (_handler, seen) = recorder(&bus, "ping");
        bus.emit("ping", json!(1), "tester").await.unwrap();
        bus.emit("ping", json!(2), "tester").await.unwrap();
        bus.dispatch_pending().await.unwrap();
        assert_eq!(*seen.lock(), vec![json!(1), json!(2)]);
        assert_eq!(bus.stats().handler_failures, 4);
    }

    #[tokio::test]
    async fn unsubscribe_removes_by_identity() {
        let bus = EventBus::new();
        let (first, seen) = recorder(&bus, "ping");
        bus.subscribe("ping", Arc::clone(&first));
        assert_eq!(bus.subscriber_count("ping"), 2);
        assert!(bus.unsubscribe("ping", &first));
        assert_eq!(bus.subscriber_count("ping"), 1);
        bus.emit("ping", json!("once"), "tester").await.unwrap();
        bus.dispatch_pending().await.unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert!(bus.unsubscribe("ping", &first));
        assert!(!bus.unsubscribe("ping", &first));
        assert!(!bus.unsubscribe("unknown", &first));
    }

    #[tokio::test]
    async fn bounded_queue_drops_newest_when_full() {
        let bus = EventBus::with_config(BusConfig {
            queue: QueuePolicy::Bounded {
                capacity: 2,
                overflow: Overflow::DropNewest,
            },
            ..BusConfig::default()
        });
        let (_handler, seen) = recorder(&bus, "ping");
        bus.emit("ping", json!(1), "tester").await.unwrap();
        bus.emit("ping", json!(2), "tester").await.unwrap();
        let err = bus.emit("ping", json!(3), "tester").await.unwrap_err();
        assert_eq!(
            err,
            BusError::QueueFull {
                event_type: "ping".into()
            }
        );
        bus.dispatch_pending().await.unwrap();
        assert_eq!(*seen.lock(), vec![json!(1), json!(2)]);
        let stats = bus.stats();
        assert_eq!((stats.published, stats.dropped), (2, 1));
    }

    #[tokio::test]
    async fn handlers_see_events_published_during_dispatch() {
        let bus = EventBus::new();
        let relay = bus.clone();
        bus.subscribe_fn("ping", move |event: Event| {
            let relay = relay.clone();
            async move {
                relay.emit("pong", event.payload, "relay").await?;
                Ok(())
            }
        });
        let (_handler, seen) = recorder(&bus, "pong");
        bus.emit("ping", json!("x"), "tester").await.unwrap();
        assert_eq!(bus.dispatch_pending().await.unwrap(), 2);
        assert_eq!(*seen.lock(), vec![json!("x")]);
        assert_eq!(bus.recent().len(), 2);
    }

    #[tokio::test]
    async fn second_dispatch_loop_is_rejected() {
        let bus = EventBus::with_config(BusConfig {
            poll_interval: Duration::from_millis(5),
            ..BusConfig::default()
        });
        let runner = bus.clone();
        let task = tokio::spawn(async move { runner.start().await });
        while !bus.is_running() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(bus.start().await, Err(BusError::AlreadyRunning));
        bus.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_before_the_loop_starts_is_honored() {
        let bus = EventBus::with_config(BusConfig {
            poll_interval: Duration::from_millis(5),
            ..BusConfig::default()
        });
        let (_handler, seen) = recorder(&bus, "tick");
        let runner = bus.clone();
        let task = tokio::spawn(async move { runner.start().await });
        bus.stop();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("dispatch loop ignored an early stop")
            .unwrap()
            .unwrap();
        assert!(!bus.is_running());

        // the stop was consumed, so a restarted loop keeps delivering
        let runner = bus.clone();
        let task = tokio::spawn(async move { runner.start().await });
        bus.emit("tick", json!(1), "tester").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while seen.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert!(bus.is_running());
        bus.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn blocking_queue_suspends_publishers_until_space_frees() {
        let bus = EventBus::with_config(BusConfig {
            queue: QueuePolicy::Bounded {
                capacity: 1,
                overflow: Overflow::Block,
            },
            ..BusConfig::default()
        });
        let (_handler, seen) = recorder(&bus, "ping");
        bus.emit("ping", json!(1), "tester").await.unwrap();
        assert_eq!(
            bus.try_publish(Event::new("ping", json!("rejected"), "tester")),
            Err(BusError::QueueFull {
                event_type: "ping".into()
            })
        );

        let publisher = bus.clone();
        let pending = tokio::spawn(async move { publisher.emit("ping", json!(2), "tester").await });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!pending.is_finished());

        assert_eq!(bus.dispatch_pending().await.unwrap(), 1);
        tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(bus.dispatch_pending().await.unwrap(), 1);
        assert_eq!(*seen.lock(), vec![json!(1), json!(2)]);
        let stats = bus.stats();
        assert_eq!((stats.published, stats.dropped), (2, 1));
    }

    #[test]
    fn queue_policy_deserializes_from_tagged_table() {
        let policy: QueuePolicy =
            serde_json::from_value(json!({ "policy": "bounded", "capacity": 8 })).unwrap();
        assert_eq!(
            policy,
            QueuePolicy::Bounded {
                capacity: 8,
                overflow: Overflow::Block
            }
        );
        let policy: QueuePolicy = serde_json::from_value(json!({ "policy": "unbounded" })).unwrap();
        assert_eq!(policy, QueuePolicy::Unbounded);
    }
}
