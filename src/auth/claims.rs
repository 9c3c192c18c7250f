// Bearer token claims decoding
// Signatures are not verified here; that is the issuing server's job.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

/// Decoded, read-only view of an access token payload
#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    pub subject_id: String,
    pub email: String,
    pub name: Option<String>,
    pub is_active: Option<bool>,
    /// `exp` normalized from epoch seconds to epoch milliseconds
    pub expires_at_ms: i64,
    /// Every claim not listed above
    pub custom: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawClaims {
    sub: Value,
    email: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    is_active: Option<bool>,
    exp: serde_json::Number,
    #[serde(flatten)]
    custom: Map<String, Value>,
}

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Decode the payload segment of a `header.payload.signature` token.
///
/// Returns `None` for anything malformed: wrong segment count, bad base64,
/// non-JSON payload, or missing `sub`/`email`/`exp`. Callers must treat `None`
/// as an untrusted token.
pub fn decode(token: &str) -> Option<Claims> {
    let raw: RawClaims = serde_json::from_slice(&payload_bytes(token)?).ok()?;

    let subject_id = match raw.sub {
        Value::String(s) if !s.is_empty() => s,
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    Some(Claims {
        subject_id,
        email: raw.email,
        name: raw.name,
        is_active: raw.is_active,
        expires_at_ms: exp_to_ms(&raw.exp)?,
        custom: raw.custom,
    })
}

/// Expiry of any `header.payload.signature` token that carries `exp`,
/// without requiring the access token claims. Used for refresh tokens.
pub fn expiry_ms(token: &str) -> Option<i64> {
    #[derive(Deserialize)]
    struct ExpOnly {
        exp: serde_json::Number,
    }

    let raw: ExpOnly = serde_json::from_slice(&payload_bytes(token)?).ok()?;
    exp_to_ms(&raw.exp)
}

fn payload_bytes(token: &str) -> Option<Vec<u8>> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() || payload.is_empty() {
        return None;
    }
    URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()
}

fn exp_to_ms(exp: &serde_json::Number) -> Option<i64> {
    match exp.as_i64() {
        Some(secs) => secs.checked_mul(1000),
        None => {
            let secs = exp.as_f64()?;
            secs.is_finite().then(|| (secs * 1000.0) as i64)
        }
    }
}

/// True if the token is undecodable or `exp` is at or before `now_ms`
pub fn is_expired(token: &str, now_ms: i64) -> bool {
    match decode(token) {
        Some(claims) => claims.expires_at_ms <= now_ms,
        None => true,
    }
}

/// True if the token expires within `window` of `now_ms` (or is undecodable)
pub fn is_expiring_within(token: &str, window: Duration, now_ms: i64) -> bool {
    match decode(token) {
        Some(claims) => claims.expires_at_ms.saturating_sub(now_ms) <= window_ms(window),
        None => true,
    }
}

/// Time left before expiry, never negative
pub fn time_remaining(token: &str, now_ms: i64) -> Duration {
    decode(token)
        .map(|claims| remaining_until(claims.expires_at_ms, now_ms))
        .unwrap_or(Duration::ZERO)
}

pub(crate) fn remaining_until(expires_at_ms: i64, now_ms: i64) -> Duration {
    let left = expires_at_ms.saturating_sub(now_ms).max(0);
    Duration::from_millis(left as u64)
}

fn window_ms(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}

/// Build an unsigned token around `payload` for tests
#[cfg(test)]
pub(crate) fn unsigned_token(payload: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.signature", header, body)
}
