//! Event processing stage shared by webhook and polling ingestion
//!
//! A bounded intake queue drained by a single task that fans each event out
//! to the registered sinks.

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::types::{ChangeType, CloudEvent};
use crate::events::{Event, EventBus, EventType};
use crate::webhook::EventForwarder;

/// Downstream consumer of processed change events
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &CloudEvent) -> Result<()>;
}

/// Re-publishes change events on the application event bus
pub struct BusBridge {
    bus: Arc<EventBus>,
}

impl BusBridge {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    pub fn event_type(change_type: ChangeType) -> EventType {
        match change_type {
            ChangeType::Create => EventType::ResourceCreated,
            ChangeType::Update => EventType::ResourceUpdated,
            ChangeType::Delete => EventType::ResourceDeleted,
            ChangeType::Drift => EventType::DriftDetected,
        }
    }
}

#[async_trait]
impl EventSink for BusBridge {
    fn name(&self) -> &str {
        "event-bus"
    }

    async fn handle(&self, event: &CloudEvent) -> Result<()> {
        let mut bus_event = Event::new(Self::event_type(event.change_type), event.source.clone())
            .with_metadata("change_type", event.change_type.to_string())
            .with_metadata("cloud_event_id", event.id.clone());

        if let serde_json::Value::Object(fields) = serde_json::to_value(event)? {
            bus_event.data.extend(fields);
        }

        self.bus.publish(bus_event);
        Ok(())
    }
}

/// Structured audit trail of every change event
#[derive(Debug, Default)]
pub struct AuditLogSink;

#[async_trait]
impl EventSink for AuditLogSink {
    fn name(&self) -> &str {
        "audit-log"
    }

    async fn handle(&self, event: &CloudEvent) -> Result<()> {
        info!(
            target: "audit",
            event_id = %event.id,
            source = %event.source,
            event_type = %event.event_type,
            change_type = %event.change_type,
            resource = %event.resource,
            action = %event.action,
            principal = %event.principal,
            time = %event.time.to_rfc3339(),
            "Infrastructure change"
        );
        Ok(())
    }
}

/// Adapter turning a plain callback into an [`EventSink`]
pub struct FnSink<F> {
    name: String,
    f: F,
}

impl<F> FnSink<F>
where
    F: Fn(&CloudEvent) -> Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> EventSink for FnSink<F>
where
    F: Fn(&CloudEvent) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &CloudEvent) -> Result<()> {
        (self.f)(event)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub accepted: u64,
    pub dropped: u64,
    pub processed: u64,
}

pub struct EventProcessor {
    sender: mpsc::Sender<CloudEvent>,
    receiver: Mutex<Option<mpsc::Receiver<CloudEvent>>>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    shutdown_grace: Duration,
    accepted: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
}

impl EventProcessor {
    pub fn new(capacity: usize, shutdown_grace: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            sinks: RwLock::new(Vec::new()),
            shutdown_grace,
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            processed: AtomicU64::new(0),
        }
    }

    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        let mut sinks = self.sinks.write().unwrap_or_else(PoisonError::into_inner);
        info!(sink = sink.name(), "Registered event sink");
        sinks.push(sink);
    }

    /// Enqueue without waiting. Returns false when the event was dropped.
    pub fn submit(&self, event: CloudEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_id = %event.id,
                    source = %event.source,
                    "Event queue full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(event_id = %event.id, "Event processor stopped, dropping event");
                false
            }
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
        }
    }

    async fn dispatch(&self, event: CloudEvent) {
        let sinks = self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for sink in sinks {
            match AssertUnwindSafe(sink.handle(&event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    sink = sink.name(),
                    event_id = %event.id,
                    error = %e,
                    "Event sink failed"
                ),
                Err(_) => error!(sink = sink.name(), event_id = %event.id, "Event sink panicked"),
            }
        }

        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain loop. On shutdown, keeps dispatching queued events for at most
    /// the grace period and drops whatever is left.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let taken = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut receiver) = taken else {
            warn!("Event processor drain loop already started");
            return;
        };

        info!("Event processor started");

        loop {
            tokio::select! {
                biased;
                _ = crate::shutdown::requested(&mut shutdown) => break,
                next = receiver.recv() => match next {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
            }
        }

        let mut drained = 0u64;
        let mut in_flight = false;
        let drain = tokio::time::timeout(self.shutdown_grace, async {
            while let Ok(event) = receiver.try_recv() {
                in_flight = true;
                self.dispatch(event).await;
                in_flight = false;
                drained += 1;
            }
        })
        .await;

        receiver.close();
        // An event cut off mid-dispatch by the grace timeout counts as dropped
        let mut abandoned = u64::from(in_flight);
        while receiver.try_recv().is_ok() {
            abandoned += 1;
        }
        self.dropped.fetch_add(abandoned, Ordering::Relaxed);

        if drain.is_err() {
            warn!(
                drained,
                dropped = abandoned,
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "Shutdown grace period elapsed, dropping queued events"
            );
        } else {
            info!(drained, "Event processor stopped");
        }
    }
}

impl EventForwarder for EventProcessor {
    fn forward(&self, event: CloudEvent) {
        self.submit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{handler_fn, EventFilter};

    fn recording_sink() -> (Arc<Mutex<Vec<CloudEvent>>>, Arc<dyn EventSink>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink = FnSink::new("recorder", move |event: &CloudEvent| {
            sink_seen.lock().unwrap().push(event.clone());
            Ok(())
        });
        (seen, Arc::new(sink))
    }

    fn event(n: usize) -> CloudEvent {
        CloudEvent::new("aws", "test").with_resource(format!("r-{n}"))
    }

    #[test]
    fn test_full_queue_drops() {
        let processor = EventProcessor::new(2, Duration::from_secs(1));

        assert!(processor.submit(event(1)));
        assert!(processor.submit(event(2)));
        assert!(!processor.submit(event(3)));

        assert_eq!(
            processor.stats(),
            ProcessorStats {
                accepted: 2,
                dropped: 1,
                processed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_dispatches_to_every_sink() {
        let processor = Arc::new(EventProcessor::new(16, Duration::from_secs(1)));
        let (seen, sink) = recording_sink();
        processor.add_sink(Arc::new(FnSink::new("failing", |_: &CloudEvent| -> Result<()> {
            anyhow::bail!("sink unavailable")
        })));
        processor.add_sink(Arc::new(FnSink::new("panicking", |_: &CloudEvent| -> Result<()> {
            panic!("sink bug")
        })));
        processor.add_sink(sink);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&processor).run(rx));

        processor.forward(event(1));
        processor.forward(event(2));

        for _ in 0..200 {
            if processor.stats().processed == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tx.send(true).unwrap();
        handle.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].resource, "r-1");
        assert_eq!(seen[1].resource, "r-2");
    }

    #[tokio::test]
    async fn test_queued_events_drain_on_shutdown() {
        let processor = Arc::new(EventProcessor::new(16, Duration::from_secs(5)));
        let (seen, sink) = recording_sink();
        processor.add_sink(sink);

        for n in 0..5 {
            processor.submit(event(n));
        }

        let (_tx, rx) = watch::channel(true);
        Arc::clone(&processor).run(rx).await;

        assert_eq!(seen.lock().unwrap().len(), 5);
        assert_eq!(processor.stats().processed, 5);

        // Intake is closed once the drain loop has exited
        assert!(!processor.submit(event(6)));
    }

    #[tokio::test]
    async fn test_grace_period_bounds_drain() {
        struct SlowSink;

        #[async_trait]
        impl EventSink for SlowSink {
            fn name(&self) -> &str {
                "slow"
            }

            async fn handle(&self, _event: &CloudEvent) -> Result<()> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            }
        }

        let processor = Arc::new(EventProcessor::new(16, Duration::from_millis(150)));
        processor.add_sink(Arc::new(SlowSink));
        for n in 0..5 {
            processor.submit(event(n));
        }

        let (_tx, rx) = watch::channel(true);
        Arc::clone(&processor).run(rx).await;

        let stats = processor.stats();
        assert!(stats.processed < 5);
        assert!(stats.dropped >= 1);
        // The event cut off mid-dispatch is accounted for as dropped
        assert_eq!(stats.accepted, 5);
        assert_eq!(stats.processed + stats.dropped, stats.accepted);
    }

    #[tokio::test]
    async fn test_second_run_returns_immediately() {
        let processor = Arc::new(EventProcessor::new(4, Duration::from_millis(10)));
        let (_tx, rx) = watch::channel(true);

        Arc::clone(&processor).run(rx.clone()).await;
        Arc::clone(&processor).run(rx).await;
    }

    #[tokio::test]
    async fn test_bus_bridge_publishes_resource_events() {
        let bus = Arc::new(EventBus::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        bus.subscribe(
            EventFilter::for_types([EventType::ResourceDeleted, EventType::DriftDetected]),
            handler_fn(move |e| sink_seen.lock().unwrap().push(e)),
        )
        .unwrap();

        let bridge = BusBridge::new(Arc::clone(&bus));
        let deleted = CloudEvent::new("azure", "Microsoft.Resources.ResourceDeleteSuccess")
            .with_change_type(ChangeType::Delete)
            .with_resource("/rg/vm1");
        bridge.handle(&deleted).await.unwrap();
        bridge
            .handle(&CloudEvent::new("gcp", "x"))
            .await
            .unwrap();

        for _ in 0..200 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let first = seen.iter().find(|e| e.source == "azure").unwrap();
        assert_eq!(first.event_type, EventType::ResourceDeleted);
        assert_eq!(first.data["resource"], "/rg/vm1");
        assert_eq!(first.metadata["change_type"], "delete");
        assert_eq!(first.metadata["cloud_event_id"], deleted.id);
        assert!(seen.iter().any(|e| e.event_type == EventType::DriftDetected));
    }
}
