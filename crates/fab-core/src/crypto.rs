//! Webhook signature verification (§4.E).

use ring::hmac;

/// Verify an `X-Hub-Signature-256`-style `sha256=<hex>` header against the
/// raw request body, keyed by the project's webhook secret.
///
/// `ring::hmac::verify` compares tags in constant time internally.
pub fn verify_hmac_sha256_signature(secret: &[u8], body: &[u8], signature_header: &str) -> bool {
    let hex_digest = match signature_header.strip_prefix("sha256=") {
        Some(rest) => rest,
        None => signature_header,
    };
    let expected = match decode_hex(hex_digest) {
        Some(bytes) => bytes,
        None => return false,
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, body, &expected).is_ok()
}

/// Compute a `sha256=<hex>` signature header value for `body` under `secret`.
pub fn sign_hmac_sha256(secret: &[u8], body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, body);
    format!("sha256={}", encode_hex(tag.as_ref()))
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_signature_round_trips() {
        let secret = b"webhook-secret";
        let body = b"{\"action\":\"opened\"}";
        let header = sign_hmac_sha256(secret, body);
        assert!(verify_hmac_sha256_signature(secret, body, &header));
    }

    #[test]
    fn hmac_signature_rejects_tampered_body() {
        let secret = b"webhook-secret";
        let header = sign_hmac_sha256(secret, b"original");
        assert!(!verify_hmac_sha256_signature(secret, b"tampered", &header));
    }

    #[test]
    fn hmac_signature_rejects_wrong_secret() {
        let body = b"payload";
        let header = sign_hmac_sha256(b"secret-a", body);
        assert!(!verify_hmac_sha256_signature(b"secret-b", body, &header));
    }

    #[test]
    fn hmac_signature_accepts_bare_hex_without_prefix() {
        let secret = b"webhook-secret";
        let body = b"payload";
        let header = sign_hmac_sha256(secret, body);
        let bare = header.strip_prefix("sha256=").unwrap();
        assert!(verify_hmac_sha256_signature(secret, body, bare));
    }
}
