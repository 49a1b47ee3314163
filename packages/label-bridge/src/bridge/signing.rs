//! Request signing primitives.
//!
//! Pure functions only; the stateful checks (rate limit, replay, audit) live
//! in [`super::auth`].
//!
//! # Canonical signing string
//!
//! ```text
//! {timestamp}.{METHOD}.{path?query}.{hex(sha256(body))}
//! ```
//!
//! The timestamp is the `x-timestamp` header exactly as sent. The signature
//! is `hex(HMAC-SHA256(signing_secret, canonical))`.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Allowed clock drift between bot and server (±5 minutes).
pub const TIMESTAMP_TOLERANCE_MS: i64 = 5 * 60 * 1000;

/// How far back a successful signature blocks reuse (10 minutes).
pub const REPLAY_WINDOW_MS: i64 = 10 * 60 * 1000;

/// Timestamps below this are taken to be in seconds, not milliseconds.
const SECONDS_CUTOFF: i64 = 1_000_000_000_000;

/// Hex length of an HMAC-SHA256 digest.
const SIGNATURE_HEX_LEN: usize = 64;

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Build the canonical string that gets signed.
pub fn canonical_string(timestamp: &str, method: &str, path: &str, body: &[u8]) -> String {
    format!(
        "{}.{}.{}.{}",
        timestamp,
        method.to_ascii_uppercase(),
        path,
        sha256_hex(body)
    )
}

/// Compute the request signature.
pub fn sign(
    secret: &str,
    timestamp: &str,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Internal(format!("signing key rejected: {e}")))?;
    mac.update(canonical_string(timestamp, method, path, body).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Canonical form of an `x-signature` value: exactly 64 hex digits,
/// lowercased. Anything else is not a signature.
pub fn normalize_signature(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.len() != SIGNATURE_HEX_LEN || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(raw.to_ascii_lowercase())
}

/// Check a supplied signature in constant time.
///
/// `provided` goes through [`normalize_signature`] first, so case variants
/// of one signature verify alike and share one replay key.
pub fn verify_signature(
    secret: &str,
    timestamp: &str,
    method: &str,
    path: &str,
    body: &[u8],
    provided: &str,
) -> Result<bool> {
    let Some(provided) = normalize_signature(provided) else {
        return Ok(false);
    };
    let expected = sign(secret, timestamp, method, path, body)?;
    Ok(bool::from(expected.as_bytes().ct_eq(provided.as_bytes())))
}

/// Compare a supplied token to the configured one.
///
/// Both sides are hashed first so the comparison is fixed-length and the raw
/// values never meet.
pub fn token_matches(provided: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    bool::from(provided.as_slice().ct_eq(expected.as_slice()))
}

/// Parse the `x-timestamp` header into epoch milliseconds.
pub fn parse_timestamp(raw: Option<&str>) -> Result<i64> {
    let value: i64 = raw
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(Error::InvalidTimestamp)?
        .parse()
        .map_err(|_| Error::InvalidTimestamp)?;

    if value <= 0 {
        return Err(Error::InvalidTimestamp);
    }
    if value < SECONDS_CUTOFF {
        return value.checked_mul(1000).ok_or(Error::InvalidTimestamp);
    }
    Ok(value)
}

/// Reject timestamps more than [`TIMESTAMP_TOLERANCE_MS`] away from `now_ms`.
pub fn check_timestamp(timestamp_ms: i64, now_ms: i64) -> Result<()> {
    let drift_ms = now_ms.saturating_sub(timestamp_ms);
    if drift_ms.abs() > TIMESTAMP_TOLERANCE_MS {
        return Err(Error::StaleTimestamp { drift_ms });
    }
    Ok(())
}
