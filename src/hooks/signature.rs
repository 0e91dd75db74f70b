//! Webhook payload signing using HMAC-SHA256.
//!
//! Outgoing deliveries for subscriptions with a secret carry an
//! `X-Stackpilot-Signature: sha256=<hex>` header so receivers can check the
//! body came from us. `verify_signature` is the receiver-side check.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Computes the HMAC-SHA256 of `payload` under `secret`.
pub fn compute_signature(
    payload: &[u8],
    secret: &[u8],
) -> Result<Vec<u8>, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret)?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Formats a signature as a header value: `sha256=<hex>`.
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Parses a `sha256=<hex>` header into raw bytes. Never panics.
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    hex::decode(header.strip_prefix("sha256=")?).ok()
}

/// Signs `payload` and returns the full header value.
pub fn sign(payload: &[u8], secret: &[u8]) -> Result<String, hmac::digest::InvalidLength> {
    compute_signature(payload, secret).map(|sig| format_signature_header(&sig))
}

/// Checks a signature header against `payload` in constant time.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let Some(expected) = parse_signature_header(signature_header) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
