//! Continuous monitor
//!
//! Owns the webhook server, the adaptive poller and the event processor and
//! runs them as tasks. Producers stop before the processor drains.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info};

use super::detector::ChangeDetector;
use super::poller::AdaptivePoller;
use super::processor::{BusBridge, EventProcessor, EventSink};
use super::provider::{CloudProvider, ProviderRegistry};
use super::types::{MonitorConfig, MonitorError, MonitorState};
use crate::events::EventBus;
use crate::webhook::WebhookServer;

/// Producers (webhook server, poller) and the processor stop in two phases
/// so the processor drains everything producers accepted.
struct Lifecycle {
    state: MonitorState,
    producers_shutdown: Option<watch::Sender<bool>>,
    producers: JoinSet<()>,
    processor_shutdown: Option<watch::Sender<bool>>,
    processor: JoinSet<()>,
    webhook_addr: Option<SocketAddr>,
}

pub struct ContinuousMonitor {
    config: MonitorConfig,
    bus: Arc<EventBus>,
    registry: Arc<ProviderRegistry>,
    detector: Arc<ChangeDetector>,
    processor: Arc<EventProcessor>,
    poller: Arc<AdaptivePoller>,
    lifecycle: Mutex<Lifecycle>,
}

impl ContinuousMonitor {
    /// Build a monitor whose processed events are re-published on `bus`
    pub fn new(config: MonitorConfig, bus: Arc<EventBus>) -> Result<Self, MonitorError> {
        config.validate()?;

        let registry = Arc::new(ProviderRegistry::new());
        let detector = Arc::new(ChangeDetector::new());
        let processor = Arc::new(EventProcessor::new(
            config.event_buffer_size,
            config.shutdown_grace,
        ));
        processor.add_sink(Arc::new(BusBridge::new(Arc::clone(&bus))));

        let poller = Arc::new(AdaptivePoller::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&detector),
            Arc::clone(&processor) as _,
        ));

        Ok(Self {
            config,
            bus,
            registry,
            detector,
            processor,
            poller,
            lifecycle: Mutex::new(Lifecycle {
                state: MonitorState::Created,
                producers_shutdown: None,
                producers: JoinSet::new(),
                processor_shutdown: None,
                processor: JoinSet::new(),
                webhook_addr: None,
            }),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn processor(&self) -> &Arc<EventProcessor> {
        &self.processor
    }

    pub fn detector(&self) -> &Arc<ChangeDetector> {
        &self.detector
    }

    pub fn poller(&self) -> &Arc<AdaptivePoller> {
        &self.poller
    }

    /// Safe before or after `start`; picked up on the next poll cycle
    pub async fn register_provider(&self, name: impl Into<String>, provider: Arc<dyn CloudProvider>) {
        self.registry.register(name, provider).await;
    }

    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.processor.add_sink(sink);
    }

    pub async fn state(&self) -> MonitorState {
        self.lifecycle.lock().await.state
    }

    /// Address the webhook server actually bound, while running
    pub async fn webhook_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().await.webhook_addr
    }

    pub async fn start(&self) -> Result<(), MonitorError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match lifecycle.state {
            MonitorState::Created => {}
            MonitorState::Running => return Err(MonitorError::AlreadyRunning),
            MonitorState::Stopped => return Err(MonitorError::Stopped),
        }

        let server = if self.config.enable_webhooks {
            let addr = SocketAddr::new(self.config.webhook_host, self.config.webhook_port);
            Some(WebhookServer::bind(addr, Arc::clone(&self.processor) as _).await?)
        } else {
            None
        };

        let (processor_shutdown, processor_signal) = watch::channel(false);
        let (producers_shutdown, signal) = watch::channel(false);

        lifecycle
            .processor
            .spawn(Arc::clone(&self.processor).run(processor_signal));

        if let Some(server) = server {
            lifecycle.webhook_addr = Some(server.local_addr());
            let signal = signal.clone();
            lifecycle.producers.spawn(async move {
                if let Err(e) = server.serve(signal).await {
                    error!(error = %e, "Webhook server failed");
                }
            });
        }

        if self.config.enable_polling {
            lifecycle.producers.spawn(Arc::clone(&self.poller).run(signal));
        }

        lifecycle.producers_shutdown = Some(producers_shutdown);
        lifecycle.processor_shutdown = Some(processor_shutdown);
        lifecycle.state = MonitorState::Running;

        info!(
            webhooks = self.config.enable_webhooks,
            polling = self.config.enable_polling,
            webhook_addr = ?lifecycle.webhook_addr,
            providers = self.registry.len().await,
            "Continuous monitor started"
        );

        Ok(())
    }

    /// Stop producers first and wait for their in-flight work, then stop the
    /// processor, which drains the queue within the shutdown grace period.
    /// A no-op unless running.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state != MonitorState::Running {
            return;
        }

        if let Some(shutdown) = lifecycle.producers_shutdown.take() {
            let _ = shutdown.send(true);
        }
        join_tasks(&mut lifecycle.producers).await;

        if let Some(shutdown) = lifecycle.processor_shutdown.take() {
            let _ = shutdown.send(true);
        }
        join_tasks(&mut lifecycle.processor).await;

        lifecycle.state = MonitorState::Stopped;
        lifecycle.webhook_addr = None;

        let stats = self.processor.stats();
        info!(
            accepted = stats.accepted,
            processed = stats.processed,
            dropped = stats.dropped,
            poll_cycles = self.poller.cycles(),
            "Continuous monitor stopped"
        );
    }
}

async fn join_tasks(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Monitor task ended abnormally");
        }
    }
}
