//! Shared helpers for reading processor JSON payloads.

use std::collections::BTreeMap;

use electa_core::error::{GatewayError, GatewayResult};
use electa_core::models::{Gateway, Money};

// =============================================================================
// Field extraction
// =============================================================================

/// Extract a field, trying several JSON pointers in order.
///
/// # Example
///
/// ```ignore
/// let amount = extract_field(object, &["/amount_received", "/amount"], parse_cents);
/// ```
pub fn extract_field<T>(
    data: &serde_json::Value,
    pointers: &[&str],
    parser: fn(&serde_json::Value) -> Option<T>,
) -> Option<T> {
    pointers
        .iter()
        .filter_map(|pointer| data.pointer(pointer))
        .find_map(parser)
}

/// Like [`extract_field`], failing with `MalformedPayload` naming the first pointer.
pub fn require_field<T>(
    data: &serde_json::Value,
    pointers: &[&str],
    parser: fn(&serde_json::Value) -> Option<T>,
) -> GatewayResult<T> {
    extract_field(data, pointers, parser).ok_or_else(|| {
        GatewayError::MalformedPayload(format!(
            "missing or invalid {}",
            pointers.first().copied().unwrap_or("field")
        ))
    })
}

// =============================================================================
// Value parsing
// =============================================================================

pub fn parse_string(value: &serde_json::Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

/// Amount in cents, given as a JSON number or a numeric string.
///
/// Processors report minor units; Paddle sends them as strings.
pub fn parse_cents(value: &serde_json::Value) -> Option<Money> {
    let cents = match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }?;
    (cents >= 0).then(|| Money::from_cents(cents))
}

/// Flat string map from a JSON object. Non-string values are stringified.
pub fn parse_metadata(value: &serde_json::Value) -> Option<BTreeMap<String, String>> {
    let object = value.as_object()?;
    Some(
        object
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| {
                let text = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), text)
            })
            .collect(),
    )
}

/// Parse a webhook body as JSON.
pub fn parse_body(payload: &[u8]) -> GatewayResult<serde_json::Value> {
    serde_json::from_slice(payload).map_err(|e| GatewayError::MalformedPayload(e.to_string()))
}

// =============================================================================
// HTTP
// =============================================================================

/// Map a transport failure.
pub fn transport_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout(e.to_string())
    } else {
        GatewayError::ConnectionFailed(e.to_string())
    }
}

/// Read a processor response, turning error statuses into `GatewayError::Api`.
///
/// `message_pointer` locates the human-readable error in the body.
pub async fn read_json(
    gateway: Gateway,
    response: reqwest::Response,
    message_pointer: &str,
) -> GatewayResult<serde_json::Value> {
    let status = response.status();
    let body: serde_json::Value = response.json().await.map_err(|e| {
        if e.is_decode() {
            GatewayError::MalformedPayload(e.to_string())
        } else {
            transport_error(e)
        }
    })?;
    if !status.is_success() {
        let message = extract_field(&body, &[message_pointer], parse_string)
            .unwrap_or_else(|| status.to_string());
        return Err(GatewayError::Api {
            gateway,
            status: status.as_u16(),
            message,
        });
    }
    Ok(body)
}
