//! Infra Monitor
//!
//! Runs the continuous monitor with the webhook listener and audit log sink
//! until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use infra_monitor::events::{EventBus, EventBusConfig};
use infra_monitor::monitoring::{AuditLogSink, ContinuousMonitor, MonitorConfig};

/// Infra Monitor - multi-cloud change event ingestion
#[derive(Parser, Debug)]
#[command(name = "infra-monitor", version, about)]
struct Args {
    /// Address the webhook listener binds to
    #[arg(long, default_value = "0.0.0.0", env = "MONITOR_WEBHOOK_HOST")]
    webhook_host: IpAddr,

    /// Webhook listener port (0 picks a free port)
    #[arg(long, default_value = "8090", env = "MONITOR_WEBHOOK_PORT")]
    webhook_port: u16,

    /// Initial poll interval in seconds
    #[arg(long, default_value = "300", env = "MONITOR_POLL_INTERVAL")]
    poll_interval: u64,

    /// Lower bound for the adaptive poll interval, in seconds
    #[arg(long, default_value = "60", env = "MONITOR_MIN_POLL_INTERVAL")]
    min_poll_interval: u64,

    /// Upper bound for the adaptive poll interval, in seconds
    #[arg(long, default_value = "1800", env = "MONITOR_MAX_POLL_INTERVAL")]
    max_poll_interval: u64,

    /// Keep the poll interval fixed
    #[arg(long, default_value = "false", env = "MONITOR_FIXED_INTERVAL")]
    fixed_interval: bool,

    /// Seconds without changes before the poll interval grows
    #[arg(long, default_value = "1800", env = "MONITOR_QUIET_PERIOD")]
    quiet_period: u64,

    /// Capacity of the event processing queue
    #[arg(long, default_value = "1000", env = "MONITOR_EVENT_BUFFER")]
    event_buffer: usize,

    /// Seconds allowed for draining queued events on shutdown
    #[arg(long, default_value = "5", env = "MONITOR_SHUTDOWN_GRACE")]
    shutdown_grace: u64,

    /// Number of recent events kept on the event bus
    #[arg(long, default_value = "1000", env = "MONITOR_REPLAY_CAPACITY")]
    replay_capacity: usize,

    #[arg(long, default_value = "false", env = "MONITOR_DISABLE_WEBHOOKS")]
    disable_webhooks: bool,

    #[arg(long, default_value = "false", env = "MONITOR_DISABLE_POLLING")]
    disable_polling: bool,
}

impl Args {
    fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            webhook_host: self.webhook_host,
            webhook_port: self.webhook_port,
            polling_interval: Duration::from_secs(self.poll_interval),
            adaptive_polling: !self.fixed_interval,
            min_poll_interval: Duration::from_secs(self.min_poll_interval),
            max_poll_interval: Duration::from_secs(self.max_poll_interval),
            event_buffer_size: self.event_buffer,
            enable_webhooks: !self.disable_webhooks,
            enable_polling: !self.disable_polling,
            quiet_period: Duration::from_secs(self.quiet_period),
            shutdown_grace: Duration::from_secs(self.shutdown_grace),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .json()
        .init();

    let args = Args::parse();

    info!(
        webhook_port = args.webhook_port,
        poll_interval = args.poll_interval,
        adaptive = !args.fixed_interval,
        "Starting Infra Monitor"
    );

    let bus = Arc::new(EventBus::new(EventBusConfig {
        replay_capacity: args.replay_capacity,
        ..Default::default()
    }));

    let monitor = ContinuousMonitor::new(args.monitor_config(), Arc::clone(&bus))
        .context("Invalid monitor configuration")?;
    monitor.add_sink(Arc::new(AuditLogSink));

    monitor
        .start()
        .await
        .context("Failed to start continuous monitor")?;

    if let Some(addr) = monitor.webhook_addr().await {
        info!(%addr, "Accepting webhooks");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    monitor.stop().await;
    bus.close();

    let metrics = bus.metrics();
    info!(
        published = metrics.events_published.values().sum::<u64>(),
        dropped = metrics.events_dropped,
        "Infra Monitor stopped"
    );

    Ok(())
}
