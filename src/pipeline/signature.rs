//! Provider webhook signatures (HMAC-SHA1, base64).
//!
//! The signed string is the full callback URL followed by every form
//! parameter, sorted by name, with each name and value appended directly.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Header carrying the request signature.
pub const SIGNATURE_HEADER: &str = "x-twilio-signature";

fn signed_mac(secret: &str, url: &str, params: &[(String, String)]) -> Option<HmacSha1> {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();

    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(url.as_bytes());
    for (key, value) in sorted {
        mac.update(key.as_bytes());
        mac.update(value.as_bytes());
    }
    Some(mac)
}

/// Expected signature for a callback to `url` carrying `params`.
pub fn compute_signature(secret: &str, url: &str, params: &[(String, String)]) -> String {
    match signed_mac(secret, url, params) {
        Some(mac) => STANDARD.encode(mac.finalize().into_bytes()),
        None => String::new(),
    }
}

/// Check `signature` in constant time.
pub fn verify_signature(
    secret: &str,
    url: &str,
    params: &[(String, String)],
    signature: &str,
) -> bool {
    let Ok(expected) = STANDARD.decode(signature.trim()) else {
        tracing::warn!("Webhook signature is not valid base64");
        return false;
    };
    match signed_mac(secret, url, params) {
        Some(mac) => mac.verify_slice(&expected).is_ok(),
        None => false,
    }
}
