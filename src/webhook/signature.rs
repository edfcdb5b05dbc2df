//! HMAC-SHA256 payload signatures, as sent in `X-Signature: sha256=<hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::WebhookError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

fn keyed(secret: &str) -> Result<HmacSha256, WebhookError> {
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::InvalidKey)
}

/// Hex-encoded HMAC-SHA256 of `payload` keyed by `secret`.
pub fn generate_signature(payload: &[u8], secret: &str) -> Result<String, WebhookError> {
    let mut mac = keyed(secret)?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a signature produced by [`generate_signature`], with or without the
/// `sha256=` prefix. The comparison runs in constant time.
pub fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    let hex_digest = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .unwrap_or(signature);
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = keyed(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
