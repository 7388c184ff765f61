//! Adaptive polling scheduler
//!
//! Polls every registered provider on a ticker whose period shrinks while
//! changes keep arriving and grows back once things have been quiet.

use chrono::Utc;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::detector::ChangeDetector;
use super::provider::ProviderRegistry;
use super::types::{CloudEvent, MonitorConfig, ResourceChange};
use crate::webhook::EventForwarder;

const SHRINK_FACTOR: f64 = 0.75;
const GROWTH_FACTOR: f64 = 1.25;

/// Poll period bookkeeping, kept within `[min, max]`
#[derive(Debug, Clone)]
pub struct IntervalController {
    current: Duration,
    min: Duration,
    max: Duration,
    adaptive: bool,
    quiet_period: Duration,
    last_change: Instant,
}

impl IntervalController {
    pub fn new(config: &MonitorConfig, now: Instant) -> Self {
        // An inverted range collapses to `min` instead of panicking
        let min = config.min_poll_interval;
        let max = config.max_poll_interval.max(min);
        Self {
            current: config.polling_interval.max(min).min(max),
            min,
            max,
            adaptive: config.adaptive_polling,
            quiet_period: config.quiet_period,
            last_change: now,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Feed the outcome of one cycle; returns the new period when it moved
    pub fn record_cycle(&mut self, changed: bool, now: Instant) -> Option<Duration> {
        if !self.adaptive {
            return None;
        }

        let next = if changed {
            self.last_change = now;
            self.current.mul_f64(SHRINK_FACTOR).max(self.min)
        } else if now.saturating_duration_since(self.last_change) > self.quiet_period {
            self.current.mul_f64(GROWTH_FACTOR).min(self.max)
        } else {
            return None;
        };

        if next == self.current {
            return None;
        }
        self.current = next;
        Some(next)
    }
}

pub struct AdaptivePoller {
    registry: Arc<ProviderRegistry>,
    detector: Arc<ChangeDetector>,
    forwarder: Arc<dyn EventForwarder>,
    controller: Mutex<IntervalController>,
    cycles: AtomicU64,
}

impl AdaptivePoller {
    pub fn new(
        config: &MonitorConfig,
        registry: Arc<ProviderRegistry>,
        detector: Arc<ChangeDetector>,
        forwarder: Arc<dyn EventForwarder>,
    ) -> Self {
        Self {
            registry,
            detector,
            forwarder,
            controller: Mutex::new(IntervalController::new(config, Instant::now())),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.controller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current()
    }

    /// Completed poll cycles
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Poll all providers once and return the change events without
    /// forwarding them.
    ///
    /// Providers are polled concurrently; the result keeps each provider's
    /// events in discovery order, providers ordered by name. A failing
    /// provider is logged and contributes nothing.
    pub async fn poll_once(&self) -> Vec<CloudEvent> {
        let providers = self.registry.snapshot().await;

        let polls = providers.into_iter().map(|(name, provider)| async move {
            match provider.discover_resources().await {
                Ok(resources) => self
                    .detector
                    .detect_changes(&name, resources)
                    .await
                    .into_iter()
                    .map(|change| change_event(&name, change))
                    .collect(),
                Err(e) => {
                    warn!(provider = %name, error = %e, "Provider poll failed, skipping");
                    Vec::new()
                }
            }
        });

        join_all(polls).await.into_iter().flatten().collect()
    }

    /// One full cycle: poll, forward every change event, adjust the period.
    /// Returns the number of changes seen.
    pub async fn run_cycle(&self) -> usize {
        let events = self.poll_once().await;
        let changes = events.len();

        for event in events {
            self.forwarder.forward(event);
        }

        let adjusted = self
            .controller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_cycle(changes > 0, Instant::now());
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;

        match adjusted {
            Some(interval) => info!(
                cycle,
                changes,
                interval_secs = interval.as_secs_f64(),
                "Adjusted poll interval"
            ),
            None => debug!(cycle, changes, "Poll cycle complete"),
        }

        changes
    }

    /// Tick until `shutdown` flips. The ticker is rebuilt whenever the
    /// period changes so the new period applies to the very next wait.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut period = self.current_interval();
        let mut ticker = ticker(period);

        info!(interval_secs = period.as_secs_f64(), "Adaptive poller started");

        loop {
            tokio::select! {
                _ = crate::shutdown::requested(&mut shutdown) => break,
                _ = ticker.tick() => {
                    self.run_cycle().await;

                    let next = self.current_interval();
                    if next != period {
                        period = next;
                        ticker = self::ticker(period);
                    }
                }
            }
        }

        info!(cycles = self.cycles(), "Adaptive poller stopped");
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn change_event(provider: &str, change: ResourceChange) -> CloudEvent {
    CloudEvent {
        id: format!("{provider}-{}", Uuid::new_v4()),
        source: provider.to_string(),
        event_type: format!("provider.{provider}.change"),
        time: Utc::now(),
        region: change.resource.region,
        account: change.resource.account,
        resource: change.resource_id,
        action: change.change_type.to_string(),
        principal: String::new(),
        details: change.details,
        change_type: change.change_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::provider::CloudProvider;
    use crate::monitoring::types::{ChangeType, Resource};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    fn config(initial: u64, min: u64, max: u64) -> MonitorConfig {
        MonitorConfig {
            polling_interval: Duration::from_secs(initial),
            min_poll_interval: Duration::from_secs(min),
            max_poll_interval: Duration::from_secs(max),
            quiet_period: Duration::from_secs(30 * 60),
            ..Default::default()
        }
    }

    fn assert_secs(actual: Duration, expected: f64) {
        assert!(
            (actual.as_secs_f64() - expected).abs() < 1e-6,
            "expected {expected}s, got {actual:?}"
        );
    }

    #[test]
    fn test_change_shrinks_interval_to_floor() {
        let start = Instant::now();
        let mut controller = IntervalController::new(&config(100, 60, 1800), start);

        assert_eq!(controller.record_cycle(true, start), Some(Duration::from_secs(75)));
        assert_eq!(controller.record_cycle(true, start), Some(Duration::from_secs(60)));
        assert_eq!(controller.record_cycle(true, start), None);
        assert_eq!(controller.current(), Duration::from_secs(60));
    }

    #[test]
    fn test_quiet_cycles_grow_interval_to_ceiling() {
        let start = Instant::now();
        let mut controller = IntervalController::new(&config(100, 60, 200), start);
        let later = start + Duration::from_secs(31 * 60);

        controller.record_cycle(false, later);
        assert_secs(controller.current(), 125.0);
        controller.record_cycle(false, later);
        assert_secs(controller.current(), 156.25);
        controller.record_cycle(false, later);
        assert_secs(controller.current(), 195.3125);
        controller.record_cycle(false, later);
        assert_eq!(controller.current(), Duration::from_secs(200));
        assert_eq!(controller.record_cycle(false, later), None);
    }

    #[test]
    fn test_no_growth_within_quiet_period() {
        let start = Instant::now();
        let mut controller = IntervalController::new(&config(100, 60, 1800), start);

        assert_eq!(
            controller.record_cycle(false, start + Duration::from_secs(60)),
            None
        );

        // A change restarts the quiet period
        let change_at = start + Duration::from_secs(40 * 60);
        controller.record_cycle(true, change_at);
        assert_eq!(
            controller.record_cycle(false, change_at + Duration::from_secs(29 * 60)),
            None
        );
        assert!(controller
            .record_cycle(false, change_at + Duration::from_secs(31 * 60))
            .is_some());
    }

    #[test]
    fn test_fixed_interval_when_not_adaptive() {
        let start = Instant::now();
        let mut cfg = config(100, 60, 1800);
        cfg.adaptive_polling = false;
        let mut controller = IntervalController::new(&cfg, start);

        assert_eq!(controller.record_cycle(true, start), None);
        assert_eq!(
            controller.record_cycle(false, start + Duration::from_secs(3600)),
            None
        );
        assert_eq!(controller.current(), Duration::from_secs(100));
    }

    #[test]
    fn test_initial_interval_is_clamped() {
        let controller = IntervalController::new(&config(10, 60, 1800), Instant::now());
        assert_eq!(controller.current(), Duration::from_secs(60));
    }

    #[test]
    fn test_inverted_range_pins_interval_to_min() {
        let start = Instant::now();
        let mut controller = IntervalController::new(&config(100, 120, 60), start);
        assert_eq!(controller.current(), Duration::from_secs(120));

        assert_eq!(controller.record_cycle(true, start), None);
        let later = start + Duration::from_secs(31 * 60);
        assert_eq!(controller.record_cycle(false, later), None);
        assert_eq!(controller.current(), Duration::from_secs(120));
    }

    /// Returns queued listings in order, then repeats the last one
    struct ScriptedProvider {
        listings: Mutex<VecDeque<Vec<Resource>>>,
    }

    impl ScriptedProvider {
        fn new(listings: Vec<Vec<Resource>>) -> Arc<Self> {
            Arc::new(Self {
                listings: Mutex::new(listings.into()),
            })
        }
    }

    #[async_trait]
    impl CloudProvider for ScriptedProvider {
        async fn discover_resources(&self) -> anyhow::Result<Vec<Resource>> {
            let mut listings = self.listings.lock().unwrap();
            if listings.len() > 1 {
                Ok(listings.pop_front().unwrap())
            } else {
                Ok(listings.front().cloned().unwrap_or_default())
            }
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl CloudProvider for FailingProvider {
        async fn discover_resources(&self) -> anyhow::Result<Vec<Resource>> {
            anyhow::bail!("credentials expired")
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<CloudEvent>>);

    impl EventForwarder for Recorder {
        fn forward(&self, event: CloudEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn bucket(id: &str) -> Resource {
        let mut resource = Resource::new(id, "storage.bucket").with_region("us-east-1");
        resource.account = "123456789012".to_string();
        resource
    }

    async fn poller(recorder: Arc<Recorder>) -> (AdaptivePoller, Arc<ProviderRegistry>) {
        let registry = Arc::new(ProviderRegistry::new());
        let poller = AdaptivePoller::new(
            &config(100, 60, 1800),
            Arc::clone(&registry),
            Arc::new(ChangeDetector::new()),
            recorder,
        );
        (poller, registry)
    }

    #[tokio::test]
    async fn test_poll_once_converts_changes() {
        let (poller, registry) = poller(Arc::new(Recorder::default())).await;
        registry
            .register(
                "aws",
                ScriptedProvider::new(vec![vec![bucket("a")], vec![bucket("b")]]),
            )
            .await;

        assert!(poller.poll_once().await.is_empty());

        let events = poller.poll_once().await;
        assert_eq!(events.len(), 2);

        let created = &events[0];
        assert!(created.id.starts_with("aws-"));
        assert_eq!(created.source, "aws");
        assert_eq!(created.event_type, "provider.aws.change");
        assert_eq!(created.resource, "b");
        assert_eq!(created.action, "create");
        assert_eq!(created.change_type, ChangeType::Create);
        assert_eq!(created.region, "us-east-1");
        assert_eq!(created.account, "123456789012");

        assert_eq!(events[1].resource, "a");
        assert_eq!(events[1].change_type, ChangeType::Delete);
    }

    #[tokio::test]
    async fn test_failing_provider_is_skipped() {
        let (poller, registry) = poller(Arc::new(Recorder::default())).await;
        registry.register("broken", Arc::new(FailingProvider)).await;
        registry
            .register(
                "gcp",
                ScriptedProvider::new(vec![vec![], vec![bucket("x")]]),
            )
            .await;

        poller.poll_once().await;
        let events = poller.poll_once().await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "gcp");
    }

    #[tokio::test]
    async fn test_run_cycle_forwards_and_shrinks() {
        let recorder = Arc::new(Recorder::default());
        let (poller, registry) = poller(Arc::clone(&recorder)).await;
        registry
            .register(
                "azure",
                ScriptedProvider::new(vec![vec![bucket("a")], vec![bucket("a"), bucket("b")]]),
            )
            .await;

        assert_eq!(poller.run_cycle().await, 0);
        assert_eq!(poller.current_interval(), Duration::from_secs(100));

        assert_eq!(poller.run_cycle().await, 1);
        assert_eq!(poller.current_interval(), Duration::from_secs(75));
        assert_eq!(poller.cycles(), 2);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (poller, _registry) = poller(Arc::new(Recorder::default())).await;
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::new(poller).run(rx));
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
