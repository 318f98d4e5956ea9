//! Inbound webhook authentication schemes used by the adapters.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A raw inbound webhook plus what is needed to authenticate it.
#[derive(Debug, Clone, Copy)]
pub struct WebhookRequest<'a> {
    pub headers: &'a HeaderMap,
    pub payload: &'a [u8],
    pub secret: &'a str,
    pub tolerance_secs: i64,
    /// Unix seconds
    pub now: i64,
}

impl<'a> WebhookRequest<'a> {
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers.get(name).and_then(|h| h.to_str().ok())
    }
}

/// Hex HMAC-SHA256 over the raw body, as sent in `X-Razorpay-Signature`.
pub fn verify_body_signature(request: &WebhookRequest<'_>, signature: &str) -> bool {
    let Ok(provided) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(request.secret.as_bytes()) else {
        return false;
    };
    mac.update(request.payload);
    mac.verify_slice(&provided).is_ok()
}

/// Hex HMAC-SHA256 over `"{timestamp}.{body}"`, rejected outside the tolerance window.
pub fn verify_timestamped_signature(
    request: &WebhookRequest<'_>,
    timestamp: &str,
    signature: &str,
) -> bool {
    let timestamp = timestamp.trim();
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    if (request.now - ts).abs() > request.tolerance_secs {
        return false;
    }

    let Ok(provided) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(request.secret.as_bytes()) else {
        return false;
    };
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(request.payload);
    mac.verify_slice(&provided).is_ok()
}

/// Splits `t=..,v1=..`; the first `v1` wins.
pub fn parse_stripe_signature(value: &str) -> Option<(&str, &str)> {
    let mut ts = None;
    let mut v1 = None;
    for part in value.split(',') {
        match part.trim().split_once('=') {
            Some(("t", val)) => ts = Some(val),
            Some(("v1", val)) if v1.is_none() => v1 = Some(val),
            _ => {}
        }
    }
    Some((ts?, v1?))
}

/// Signing helpers shared by the adapter tests.
#[cfg(test)]
pub(crate) mod signing {
    use super::*;

    pub fn body_signature(secret: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn timestamped_signature(secret: &str, ts: i64, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", ts, body).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}
