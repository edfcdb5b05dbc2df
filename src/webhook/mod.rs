//! Signed HTTP callbacks with per-delivery retry scheduling.

mod config;
mod error;
mod queue;
mod signature;

pub use config::{DeliveryTarget, WebhookConfig, WebhookEvent, validate_webhook_config};
pub use error::WebhookError;
pub use queue::{DeliveryResult, QueueConfig, WebhookQueue};
pub use signature::{SIGNATURE_PREFIX, generate_signature, verify_signature};
