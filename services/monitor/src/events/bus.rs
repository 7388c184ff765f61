//! In-process publish/subscribe bus
//!
//! Each subscription owns a bounded queue drained by its own consumer task.
//! Publishing never blocks: when a subscriber's queue is full the event is
//! dropped for that subscriber only and counted.

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::types::{BusMetrics, Event, EventBusConfig, EventBusError, EventFilter, EventType};

/// Single-method contract for subscription consumers
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event);
}

/// Adapter turning a plain callback into an [`EventHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(Event) + Send + Sync,
{
    async fn handle(&self, event: Event) {
        (self.0)(event)
    }
}

pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handle returned to the subscriber; pass it back to `unsubscribe`
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub filter: EventFilter,
}

struct SubscriberEntry {
    filter: EventFilter,
    queue: mpsc::Sender<Event>,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct Counters {
    published: HashMap<EventType, u64>,
    delivered: HashMap<EventType, u64>,
}

pub struct EventBus {
    config: EventBusConfig,
    subscribers: RwLock<HashMap<String, SubscriberEntry>>,
    buffer: Mutex<VecDeque<Event>>,
    counters: Mutex<Counters>,
    dropped: AtomicU64,
    closed: AtomicBool,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(config.replay_capacity)),
            config,
            subscribers: RwLock::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Publish an event to the replay buffer and every matching subscriber.
    ///
    /// Assigns an id and timestamp when missing. Never blocks on a slow
    /// subscriber.
    pub fn publish(&self, mut event: Event) {
        if self.closed.load(Ordering::Acquire) {
            debug!(event_type = %event.event_type, "Event bus closed, discarding event");
            return;
        }

        if event.id.is_empty() {
            event.id = Uuid::new_v4().to_string();
        }
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }

        // Held across buffering and delivery so replaying subscribers see
        // each event exactly once.
        let subscribers = read(&self.subscribers);

        if self.config.replay_capacity > 0 {
            let mut buffer = lock(&self.buffer);
            while buffer.len() >= self.config.replay_capacity {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }

        let mut delivered = 0u64;
        for (id, entry) in subscribers.iter() {
            if !entry.filter.matches(&event) {
                continue;
            }

            match entry.queue.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        subscription = %id,
                        event_type = %event.event_type,
                        "Subscriber queue full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        drop(subscribers);

        let mut counters = lock(&self.counters);
        *counters.published.entry(event.event_type).or_default() += 1;
        if delivered > 0 {
            *counters.delivered.entry(event.event_type).or_default() += delivered;
        }
    }

    /// Register `handler` for every event accepted by `filter`.
    ///
    /// Spawns the subscription's consumer task, so it must be called from
    /// within a Tokio runtime.
    pub fn subscribe(
        &self,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, EventBusError> {
        self.register(filter, handler, false)
    }

    /// Like [`subscribe`](Self::subscribe), but first queues the matching
    /// events still held in the replay buffer (most recent ones that fit in
    /// the queue, oldest first).
    pub fn subscribe_with_replay(
        &self,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, EventBusError> {
        self.register(filter, handler, true)
    }

    pub fn subscribe_to_type(
        &self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, EventBusError> {
        self.subscribe(EventFilter::for_types([event_type]), handler)
    }

    pub fn subscribe_to_types(
        &self,
        event_types: impl IntoIterator<Item = EventType>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, EventBusError> {
        self.subscribe(EventFilter::for_types(event_types), handler)
    }

    fn register(
        &self,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
        replay: bool,
    ) -> Result<Subscription, EventBusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EventBusError::Closed);
        }

        let mut subscribers = write(&self.subscribers);
        if subscribers.len() >= self.config.max_subscriptions {
            warn!(
                limit = self.config.max_subscriptions,
                "Rejecting subscription, limit reached"
            );
            return Err(EventBusError::SubscriptionLimit(self.config.max_subscriptions));
        }

        let capacity = self.config.queue_capacity.max(1);
        let (queue, receiver) = mpsc::channel(capacity);
        let (cancel, cancelled) = watch::channel(false);
        let id = format!("sub-{}", Uuid::new_v4());

        if replay {
            let buffer = lock(&self.buffer);
            let matching: Vec<&Event> = buffer.iter().filter(|e| filter.matches(e)).collect();
            let skip = matching.len().saturating_sub(capacity);
            for event in matching.into_iter().skip(skip) {
                let _ = queue.try_send(event.clone());
            }
        }

        tokio::spawn(consume(id.clone(), receiver, cancelled, handler));

        subscribers.insert(
            id.clone(),
            SubscriberEntry {
                filter: filter.clone(),
                queue,
                cancel,
            },
        );

        info!(subscription = %id, total = subscribers.len(), "Subscription registered");

        Ok(Subscription { id, filter })
    }

    /// Remove a subscription, cancel its consumer and close its queue.
    /// Unknown subscriptions are ignored.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        let removed = write(&self.subscribers).remove(&subscription.id);

        if let Some(entry) = removed {
            let _ = entry.cancel.send(true);
            info!(subscription = %subscription.id, "Subscription removed");
        }
    }

    /// Up to `n` most recent buffered events, oldest first
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        let buffer = lock(&self.buffer);
        let skip = buffer.len().saturating_sub(n);
        buffer.iter().skip(skip).cloned().collect()
    }

    pub fn subscription_count(&self) -> usize {
        read(&self.subscribers).len()
    }

    pub fn metrics(&self) -> BusMetrics {
        let counters = lock(&self.counters);
        BusMetrics {
            events_published: counters.published.clone(),
            events_delivered: counters.delivered.clone(),
            events_dropped: self.dropped.load(Ordering::Relaxed),
            subscription_count: self.subscription_count(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cancel every subscription and clear the replay buffer. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let entries: Vec<SubscriberEntry> = write(&self.subscribers)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in &entries {
            let _ = entry.cancel.send(true);
        }

        lock(&self.buffer).clear();

        info!(subscriptions = entries.len(), "Event bus closed");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        for entry in write(&self.subscribers).values() {
            let _ = entry.cancel.send(true);
        }
    }
}

/// Consumer loop of one subscription: receive-or-cancel
async fn consume(
    id: String,
    mut receiver: mpsc::Receiver<Event>,
    mut cancelled: watch::Receiver<bool>,
    handler: Arc<dyn EventHandler>,
) {
    loop {
        tokio::select! {
            _ = cancelled.changed() => break,
            next = receiver.recv() => {
                let Some(event) = next else { break };
                let event_type = event.event_type;

                let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
                if outcome.is_err() {
                    error!(
                        subscription = %id,
                        event_type = %event_type,
                        "Event handler panicked"
                    );
                }
            }
        }
    }

    debug!(subscription = %id, "Subscription consumer stopped");
}
