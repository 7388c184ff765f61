//! Webhook HTTP surface
//!
//! One POST route per provider plus a generic route for canonical events.
//! Handlers parse, forward without blocking and answer immediately.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::payloads::{self, AzureDelivery, PayloadError};
use crate::monitoring::{CloudEvent, MonitorError};

/// Receiver of normalized webhook events. Implementations must not block.
pub trait EventForwarder: Send + Sync {
    fn forward(&self, event: CloudEvent);
}

#[derive(Clone)]
struct AppState {
    forwarder: Arc<dyn EventForwarder>,
}

pub fn router(forwarder: Arc<dyn EventForwarder>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/webhooks/aws/eventbridge", post(aws_eventbridge))
        .route("/webhooks/azure/eventgrid", post(azure_eventgrid))
        .route("/webhooks/gcp/pubsub", post(gcp_pubsub))
        .route("/webhooks/generic", post(generic))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { forwarder })
}

async fn health_check() -> &'static str {
    "OK"
}

fn rejected(provider: &'static str, err: PayloadError) -> PayloadError {
    warn!(provider, error = %err, "Rejected webhook payload");
    err
}

fn forward(state: &AppState, event: CloudEvent) {
    debug!(
        source = %event.source,
        event_type = %event.event_type,
        change_type = %event.change_type,
        "Received webhook event"
    );
    state.forwarder.forward(event);
}

async fn aws_eventbridge(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<StatusCode, PayloadError> {
    let event = payloads::parse_aws(&body).map_err(|e| rejected("aws", e))?;
    forward(&state, event);
    Ok(StatusCode::OK)
}

async fn azure_eventgrid(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, PayloadError> {
    match payloads::parse_azure(&body).map_err(|e| rejected("azure", e))? {
        AzureDelivery::Validation(code) => {
            info!("Answered Event Grid subscription validation");
            Ok(Json(serde_json::json!({ "validationResponse": code })).into_response())
        }
        AzureDelivery::Events(events) => {
            for event in events {
                forward(&state, event);
            }
            Ok(StatusCode::OK.into_response())
        }
    }
}

async fn gcp_pubsub(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, PayloadError> {
    let event = payloads::parse_gcp(&body).map_err(|e| rejected("gcp", e))?;
    forward(&state, event);
    Ok(StatusCode::OK)
}

async fn generic(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, PayloadError> {
    let event = payloads::parse_generic(&body).map_err(|e| rejected("generic", e))?;
    forward(&state, event);
    Ok(StatusCode::OK)
}

/// Bound webhook listener, served until the shutdown signal flips
pub struct WebhookServer {
    listener: TcpListener,
    app: Router,
    addr: SocketAddr,
}

impl WebhookServer {
    /// Bind eagerly so address conflicts surface to the caller
    pub async fn bind(
        addr: SocketAddr,
        forwarder: Arc<dyn EventForwarder>,
    ) -> Result<Self, MonitorError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| MonitorError::Bind { addr, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| MonitorError::Bind { addr, source })?;

        Ok(Self {
            listener,
            app: router(forwarder),
            addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until `shutdown` becomes true, then let in-flight requests finish
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        info!(addr = %self.addr, "Webhook server listening");

        axum::serve(self.listener, self.app)
            .with_graceful_shutdown(async move {
                crate::shutdown::requested(&mut shutdown).await;
            })
            .await?;

        info!(addr = %self.addr, "Webhook server stopped");
        Ok(())
    }
}
