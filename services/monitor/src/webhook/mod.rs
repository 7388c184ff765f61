//! Push ingestion: cloud provider webhooks normalized to CloudEvents

pub mod classify;
pub mod payloads;
pub mod server;

pub use classify::{classify, ACTION_RULES, AZURE_RULES};
pub use payloads::PayloadError;
pub use server::{router, EventForwarder, WebhookServer};
