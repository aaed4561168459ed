// SPDX-License-Identifier: MIT OR Apache-2.0
//! HMAC request signatures.

use hmac::{Hmac, Mac};
use refbase_error::{RepoError, RepoResult};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Clock skew tolerated on inbound signature verification.
pub const SIGNATURE_SKEW_SECONDS: i64 = 300;

/// Hex HMAC-SHA256 over `<timestamp>.<body>` keyed by the shared secret.
#[must_use]
pub fn sign_request(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Verify an inbound signature.
///
/// The timestamp must be within the skew window of `now`, and the signature
/// must match in constant time.
pub fn verify_request(
    secret: &str,
    timestamp: i64,
    body: &[u8],
    signature: &str,
    now: i64,
) -> RepoResult<()> {
    if (now - timestamp).abs() > SIGNATURE_SKEW_SECONDS {
        return Err(RepoError::InvalidPayload {
            detail: "request timestamp outside the allowed clock-skew window".into(),
        });
    }
    let expected = sign_request(secret, timestamp, body);
    let matches = expected.len() == signature.len()
        && expected
            .bytes()
            .zip(signature.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0;
    if !matches {
        return Err(RepoError::InvalidPayload {
            detail: "request signature mismatch".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let body = br#"{"message": "info"}"#;
        let signature = sign_request("secret-secret", 1_700_000_000, body);
        verify_request("secret-secret", 1_700_000_000, body, &signature, 1_700_000_000).unwrap();
        // Within the skew window either direction.
        verify_request("secret-secret", 1_700_000_000, body, &signature, 1_700_000_299).unwrap();
        verify_request("secret-secret", 1_700_000_000, body, &signature, 1_699_999_701).unwrap();
    }

    #[test]
    fn skew_window_is_enforced() {
        let body = b"{}";
        let signature = sign_request("s", 1_700_000_000, body);
        let err =
            verify_request("s", 1_700_000_000, body, &signature, 1_700_000_301).unwrap_err();
        assert_eq!(err.status(), 422);
    }

    #[test]
    fn wrong_secret_or_tampered_body_fails() {
        let body = b"{\"k\":1}";
        let signature = sign_request("secret", 1_700_000_000, body);
        assert!(verify_request("other", 1_700_000_000, body, &signature, 1_700_000_000).is_err());
        assert!(
            verify_request("secret", 1_700_000_000, b"{\"k\":2}", &signature, 1_700_000_000)
                .is_err()
        );
    }

    #[test]
    fn signature_is_lowercase_hex() {
        let signature = sign_request("secret", 0, b"x");
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
