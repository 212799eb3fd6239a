//! Webhook signature verification (HMAC-SHA256).
//!
//! - Stripe: `Stripe-Signature: t=<unix>,v1=<hex>` over `"<t>.<payload>"`
//! - Paddle: `Paddle-Signature: ts=<unix>;h1=<hex>` over `"<ts>:<payload>"`
//! - Sandbox: hex digest of the raw payload
//!
//! Timestamps older or newer than the tolerance are rejected to limit replay.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use electa_core::error::{GatewayError, GatewayResult};

type HmacSha256 = Hmac<Sha256>;

/// Default replay window for timestamped signatures.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

fn mac(secret: &str, parts: &[&[u8]]) -> GatewayResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| GatewayError::InvalidSignature)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac)
}

/// Hex HMAC-SHA256 of `parts` concatenated.
pub fn sign(secret: &str, parts: &[&[u8]]) -> GatewayResult<String> {
    Ok(hex::encode(mac(secret, parts)?.finalize().into_bytes()))
}

/// Constant-time comparison of a hex digest against `parts`.
fn matches(secret: &str, parts: &[&[u8]], expected_hex: &str) -> bool {
    let Ok(expected) = hex::decode(expected_hex) else {
        return false;
    };
    mac(secret, parts).is_ok_and(|mac| mac.verify_slice(&expected).is_ok())
}

fn check_timestamp(timestamp: i64, tolerance: Duration, now: DateTime<Utc>) -> GatewayResult<()> {
    let age = (now.timestamp() - timestamp).unsigned_abs();
    if age > tolerance.as_secs() {
        return Err(GatewayError::InvalidSignature);
    }
    Ok(())
}

// =============================================================================
// Stripe
// =============================================================================

/// Verify a `Stripe-Signature` header. Any `v1` entry may match.
pub fn verify_stripe(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance: Duration,
    now: DateTime<Utc>,
) -> GatewayResult<()> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for item in header.split(',') {
        match item.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(GatewayError::InvalidSignature)?;
    let signed_ts = timestamp.to_string();
    let parts: [&[u8]; 3] = [signed_ts.as_bytes(), b".", payload];

    if !candidates.iter().any(|c| matches(secret, &parts, c)) {
        return Err(GatewayError::InvalidSignature);
    }
    check_timestamp(timestamp, tolerance, now)
}

/// Build a `Stripe-Signature` header value.
pub fn stripe_header(payload: &[u8], secret: &str, timestamp: i64) -> GatewayResult<String> {
    let ts = timestamp.to_string();
    Ok(format!("t={ts},v1={}", sign(secret, &[ts.as_bytes(), b".", payload])?))
}

// =============================================================================
// Paddle
// =============================================================================

/// Verify a `Paddle-Signature` header.
pub fn verify_paddle(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance: Duration,
    now: DateTime<Utc>,
) -> GatewayResult<()> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for item in header.split(';') {
        match item.trim().split_once('=') {
            Some(("ts", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("h1", value)) => candidates.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(GatewayError::InvalidSignature)?;
    let signed_ts = timestamp.to_string();
    let parts: [&[u8]; 3] = [signed_ts.as_bytes(), b":", payload];

    if !candidates.iter().any(|c| matches(secret, &parts, c)) {
        return Err(GatewayError::InvalidSignature);
    }
    check_timestamp(timestamp, tolerance, now)
}

/// Build a `Paddle-Signature` header value.
pub fn paddle_header(payload: &[u8], secret: &str, timestamp: i64) -> GatewayResult<String> {
    let ts = timestamp.to_string();
    Ok(format!("ts={ts};h1={}", sign(secret, &[ts.as_bytes(), b":", payload])?))
}

// =============================================================================
// Sandbox
// =============================================================================

pub fn verify_plain(payload: &[u8], signature: &str, secret: &str) -> GatewayResult<()> {
    if matches(secret, &[payload], signature.trim()) {
        Ok(())
    } else {
        Err(GatewayError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const BODY: &[u8] = br#"{"id":"evt_1"}"#;

    #[test]
    fn test_stripe_signature_roundtrip() {
        let now = Utc::now();
        let header = stripe_header(BODY, SECRET, now.timestamp()).unwrap();
        assert!(verify_stripe(BODY, &header, SECRET, DEFAULT_TOLERANCE, now).is_ok());
    }

    // Test critique: une charge utile modifiée est rejetée
    #[test]
    fn test_stripe_rejects_tampered_payload_and_wrong_secret() {
        let now = Utc::now();
        let header = stripe_header(BODY, SECRET, now.timestamp()).unwrap();
        let tampered = br#"{"id":"evt_2"}"#;
        assert!(matches!(
            verify_stripe(tampered, &header, SECRET, DEFAULT_TOLERANCE, now),
            Err(GatewayError::InvalidSignature)
        ));
        assert!(verify_stripe(BODY, &header, "other", DEFAULT_TOLERANCE, now).is_err());
        assert!(verify_stripe(BODY, "v1=deadbeef", SECRET, DEFAULT_TOLERANCE, now).is_err());
    }

    // Test critique: rejeu au-delà de 5 minutes refusé
    #[test]
    fn test_stripe_rejects_stale_timestamp() {
        let now = Utc::now();
        let header = stripe_header(BODY, SECRET, now.timestamp() - 301).unwrap();
        assert!(verify_stripe(BODY, &header, SECRET, DEFAULT_TOLERANCE, now).is_err());

        let header = stripe_header(BODY, SECRET, now.timestamp() - 299).unwrap();
        assert!(verify_stripe(BODY, &header, SECRET, DEFAULT_TOLERANCE, now).is_ok());
    }

    #[test]
    fn test_stripe_accepts_any_v1_candidate() {
        let now = Utc::now();
        let good = stripe_header(BODY, SECRET, now.timestamp()).unwrap();
        let header = format!("{good},v1=00ff");
        assert!(verify_stripe(BODY, &header, SECRET, DEFAULT_TOLERANCE, now).is_ok());
    }

    #[test]
    fn test_paddle_signature() {
        let now = Utc::now();
        let header = paddle_header(BODY, SECRET, now.timestamp()).unwrap();
        assert!(verify_paddle(BODY, &header, SECRET, DEFAULT_TOLERANCE, now).is_ok());
        assert!(verify_paddle(b"{}", &header, SECRET, DEFAULT_TOLERANCE, now).is_err());
        // Le format Stripe n'est pas accepté pour Paddle
        let stripe = stripe_header(BODY, SECRET, now.timestamp()).unwrap();
        assert!(verify_paddle(BODY, &stripe, SECRET, DEFAULT_TOLERANCE, now).is_err());
    }

    #[test]
    fn test_plain_signature() {
        let signature = sign(SECRET, &[BODY]).unwrap();
        assert!(verify_plain(BODY, &signature, SECRET).is_ok());
        assert!(verify_plain(BODY, "not-hex", SECRET).is_err());
    }
}
