//! HMAC signing of webhook bodies.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{WebhookError, WebhookResult};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "X-DXP-Signature";

/// Signs webhook bodies with a per-registration secret.
///
/// The header value is `t={unix seconds},v1={hex hmac}`, where the MAC covers
/// `{t}.{body}`. Receivers verify with the same secret and reject stale
/// timestamps.
pub struct WebhookSigner {
    secret: String,
}

impl WebhookSigner {
    /// Creates a signer with the given secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Computes the hex MAC of `{timestamp}.{body}`.
    pub fn sign(&self, timestamp: i64, body: &[u8]) -> WebhookResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| WebhookError::Signature(e.to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Builds the full header value.
    pub fn sign_header(&self, timestamp: i64, body: &[u8]) -> WebhookResult<String> {
        Ok(format!("t={},v1={}", timestamp, self.sign(timestamp, body)?))
    }

    /// Parses and checks a header value against a body.
    pub fn verify_header(&self, header: &str, body: &[u8], tolerance_secs: i64) -> WebhookResult<()> {
        let mut timestamp = None;
        let mut signature = None;
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", t)) => timestamp = t.parse::<i64>().ok(),
                Some(("v1", v)) => signature = Some(v),
                _ => {}
            }
        }
        let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
            return Err(WebhookError::Signature("malformed signature header".into()));
        };

        if (chrono::Utc::now().timestamp() - timestamp).abs() > tolerance_secs {
            return Err(WebhookError::Signature("signature expired".into()));
        }
        if !constant_time_eq(&self.sign(timestamp, body)?, signature) {
            return Err(WebhookError::Signature("signature mismatch".into()));
        }
        Ok(())
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
