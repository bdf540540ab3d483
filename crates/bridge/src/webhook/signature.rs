// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use ring::hmac;

use crate::error::BridgeError;

/// Verify a webhook signature header of the form `t=<unix>,v1=<hex>`, where
/// `v1 = HMAC-SHA256(secret, "<t>.<raw-body>")`. Rejects signatures whose
/// timestamp falls outside `replay_window` of `now` as well as ones that
/// fail the MAC check.
pub fn verify(
    header: &str,
    raw_body: &[u8],
    secret: &str,
    now: Duration,
    replay_window: Duration,
) -> Result<(), BridgeError> {
    let (t, v1) = parse_header(header).ok_or(BridgeError::Unauthorized)?;

    let event_time = Duration::from_secs(t);
    let age = if now > event_time { now - event_time } else { event_time - now };
    if age > replay_window {
        return Err(BridgeError::Forbidden { detail: "webhook signature timestamp outside replay window".into() });
    }

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let mut signed_payload = format!("{t}.").into_bytes();
    signed_payload.extend_from_slice(raw_body);
    let expected_tag = hmac::sign(&key, &signed_payload);

    let provided = hex::decode(v1).map_err(|_| BridgeError::Forbidden { detail: "signature not valid hex".into() })?;
    if ring::constant_time::verify_slices_are_equal(expected_tag.as_ref(), &provided).is_err() {
        return Err(BridgeError::Forbidden { detail: "webhook signature mismatch".into() });
    }

    Ok(())
}

fn parse_header(header: &str) -> Option<(u64, &str)> {
    let mut t = None;
    let mut v1 = None;
    for part in header.split(',') {
        let (key, value) = part.split_once('=')?;
        match key {
            "t" => t = value.parse::<u64>().ok(),
            "v1" => v1 = Some(value),
            _ => {}
        }
    }
    Some((t?, v1?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, t: u64, body: &[u8]) -> String {
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
        let mut payload = format!("{t}.").into_bytes();
        payload.extend_from_slice(body);
        let tag = hmac::sign(&key, &payload);
        hex::encode(tag.as_ref())
    }

    #[test]
    fn accepts_a_valid_signature_within_window() {
        let secret = "s3cr3t";
        let body = br#"{"agent_id":"agent-1"}"#;
        let t = 1_700_000_000u64;
        let v1 = sign(secret, t, body);
        let header = format!("t={t},v1={v1}");
        let now = Duration::from_secs(t + 30);
        assert!(verify(&header, body, secret, now, Duration::from_secs(300)).is_ok());
    }

    #[test]
    fn rejects_signature_outside_replay_window() {
        let secret = "s3cr3t";
        let body = b"{}";
        let t = 1_700_000_000u64;
        let v1 = sign(secret, t, body);
        let header = format!("t={t},v1={v1}");
        let now = Duration::from_secs(t + 600);
        let err = verify(&header, body, secret, now, Duration::from_secs(300)).unwrap_err();
        assert!(matches!(err, BridgeError::Forbidden { .. }));
    }

    #[test]
    fn rejects_tampered_body() {
        let secret = "s3cr3t";
        let body = b"{}";
        let t = 1_700_000_000u64;
        let v1 = sign(secret, t, body);
        let header = format!("t={t},v1={v1}");
        let now = Duration::from_secs(t + 1);
        let err = verify(&header, b"{\"x\":1}", secret, now, Duration::from_secs(300)).unwrap_err();
        assert!(matches!(err, BridgeError::Forbidden { .. }));
    }

    #[test]
    fn rejects_malformed_header() {
        let err = verify("garbage", b"{}", "secret", Duration::from_secs(1), Duration::from_secs(300))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Unauthorized));
    }
}
