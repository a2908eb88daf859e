//! HMAC-SHA256 signing of outbound webhook bodies.
//!
//! Receivers recompute the HMAC over the raw request body with the shared
//! secret and compare it with the `X-NodeNexus-Signature` header.

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "X-NodeNexus-Signature";
pub const EVENT_HEADER: &str = "X-NodeNexus-Event";
const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length")
}

/// Hex-encoded HMAC-SHA256 of `body` keyed with `secret`.
pub fn compute_signature(secret: &[u8], body: &[u8]) -> String {
    let mut mac = mac_for(secret);
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Full header value, `sha256=<hex>`.
pub fn signature_header_value(secret: &[u8], body: &[u8]) -> String {
    format!("{SIGNATURE_PREFIX}{}", compute_signature(secret, body))
}

/// Checks a received header value against `body`. The comparison is constant time.
/// Returns false for a missing prefix or malformed hex.
pub fn verify_signature(secret: &[u8], body: &[u8], header_value: &str) -> bool {
    let Some(hex_sig) = header_value.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let mut mac = mac_for(secret);
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
