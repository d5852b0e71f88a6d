//! Webhook signature verification.
//!
//! `X-Hub-Signature-256: sha256=<hex>` over the raw body, HMAC-SHA256 with
//! the shared secret. Comparison is constant-time via the Mac verifier; the
//! hex decode never touches secret material.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute the signature header value for a body (used by tests and by the
/// delegation client when pushing mirrored events).
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a signature header against the raw body. Returns false for a
/// missing prefix, bad hex, or mismatched digest.
pub fn verify(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_verifies() {
        let body = br#"{"action":"queued"}"#;
        let header = sign("shhh", body);
        assert!(verify("shhh", body, &header));
    }

    #[test]
    fn wrong_secret_fails() {
        let body = b"payload";
        let header = sign("secret-a", body);
        assert!(!verify("secret-b", body, &header));
    }

    #[test]
    fn tampered_body_fails() {
        let header = sign("shhh", b"original");
        assert!(!verify("shhh", b"tampered", &header));
    }

    #[test]
    fn malformed_headers_fail_closed() {
        assert!(!verify("shhh", b"body", "sha256=deadbeef"));
        assert!(!verify("shhh", b"body", "sha1=abcdef"));
        assert!(!verify("shhh", b"body", "sha256=not-hex!"));
        assert!(!verify("shhh", b"body", ""));
    }
}
