//! HMAC-SHA256 webhook signatures in the hosted-checkout header format.
//!
//! The signature header looks like `t=1700000000,v1=5257a869...,v1=...`:
//! - `t` is the unix timestamp the gateway signed at
//! - each `v1` is a hex HMAC-SHA256 over `{t}.{raw body}` with the endpoint secret
//!
//! Several `v1` entries may be present while a secret is being rolled; any
//! one matching is enough. Timestamps older (or newer) than the tolerance are
//! rejected to limit replay.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("no matching signature")]
    Mismatch,
}

fn keyed_mac(secret: &str, timestamp: i64, payload: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Some(mac)
}

/// Compute the `v1` signature for a payload
pub fn sign(secret: &str, timestamp: i64, payload: &[u8]) -> Option<String> {
    Some(hex::encode(keyed_mac(secret, timestamp, payload)?.finalize().into_bytes()))
}

/// Build a complete signature header, as the gateway would send it
pub fn signature_header(secret: &str, timestamp: i64, payload: &[u8]) -> Option<String> {
    Some(format!("t={timestamp},v1={}", sign(secret, timestamp, payload)?))
}

/// Verify a signature header against the raw body.
pub fn verify(header: &str, payload: &[u8], secret: &str, tolerance: Duration, now: i64) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value.parse::<i64>().map_err(|_| SignatureError::Malformed)?),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if now.abs_diff(timestamp) > tolerance.as_secs() {
        return Err(SignatureError::Expired);
    }

    // verify_slice compares in constant time
    let mac = keyed_mac(secret, timestamp, payload).ok_or(SignatureError::Mismatch)?;
    if candidates.iter().any(|candidate| {
        hex::decode(candidate).is_ok_and(|digest| mac.clone().verify_slice(&digest).is_ok())
    }) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Gateway-facing check shared by every checkout provider: a missing header
/// and a bad header are reported separately.
pub(crate) fn verify_webhook(signature: Option<&str>, payload: &[u8], secret: &str, tolerance: Duration) -> super::Result<()> {
    let header = signature
        .filter(|h| !h.trim().is_empty())
        .ok_or(super::PaymentError::SignatureMissing)?;
    verify(header, payload, secret, tolerance, chrono::Utc::now().timestamp())
        .map_err(|e| super::PaymentError::SignatureInvalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const TOLERANCE: Duration = Duration::from_secs(300);

    #[test]
    fn test_sign_and_verify() {
        let body = br#"{"id":"evt_1"}"#;
        let header = signature_header(SECRET, 1_700_000_000, body).unwrap();
        assert!(verify(&header, body, SECRET, TOLERANCE, 1_700_000_010).is_ok());
    }

    #[test]
    fn test_signature_is_lowercase_hex() {
        let sig = sign("key", 1, b"x").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let header = signature_header(SECRET, 1_700_000_000, br#"{"amount":100}"#).unwrap();
        assert_eq!(
            verify(&header, br#"{"amount":999}"#, SECRET, TOLERANCE, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let body = b"{}";
        let header = signature_header("whsec_other", 1_700_000_000, body).unwrap();
        assert_eq!(verify(&header, body, SECRET, TOLERANCE, 1_700_000_000), Err(SignatureError::Mismatch));
    }

    #[test]
    fn test_stale_timestamp_is_rejected() {
        let body = b"{}";
        let header = signature_header(SECRET, 1_700_000_000, body).unwrap();
        assert_eq!(
            verify(&header, body, SECRET, TOLERANCE, 1_700_000_000 + 301),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn test_malformed_headers() {
        for header in ["", "garbage", "t=abc,v1=00", "v1=deadbeef", "t=1700000000"] {
            assert_eq!(
                verify(header, b"{}", SECRET, TOLERANCE, 1_700_000_000),
                Err(SignatureError::Malformed),
                "header {header:?}"
            );
        }
    }

    #[test]
    fn test_undecodable_candidates_do_not_match() {
        let body = b"{}";
        let good = sign(SECRET, 1_700_000_000, body).unwrap();
        for candidate in ["zz".repeat(32), good[..63].to_string(), good[..62].to_string()] {
            let header = format!("t=1700000000,v1={candidate}");
            assert_eq!(
                verify(&header, body, SECRET, TOLERANCE, 1_700_000_000),
                Err(SignatureError::Mismatch),
                "candidate {candidate:?}"
            );
        }
    }

    #[test]
    fn test_uppercase_hex_candidate_matches() {
        let body = b"{}";
        let good = sign(SECRET, 1_700_000_000, body).unwrap().to_ascii_uppercase();
        let header = format!("t=1700000000,v1={good}");
        assert!(verify(&header, body, SECRET, TOLERANCE, 1_700_000_000).is_ok());
    }

    #[test]
    fn test_any_v1_may_match() {
        let body = b"{}";
        let good = sign(SECRET, 1_700_000_000, body).unwrap();
        let header = format!("t=1700000000,v1={},v1={good}", "0".repeat(64));
        assert!(verify(&header, body, SECRET, TOLERANCE, 1_700_000_000).is_ok());
    }
}
