use thiserror::Error;

use crate::push::TransportError;
use crate::replicate::ApiError;
use crate::webhook::WebhookError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Prediction API error: {0}")]
    Api(#[from] ApiError),

    #[error("Push transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),
}
