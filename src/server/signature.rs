//! HMAC-SHA256 verification of GitHub webhook deliveries.
//!
//! GitHub signs each payload with the shared secret and sends the digest in
//! the `X-Hub-Signature-256` header as `sha256=<hex>`. Deliveries are verified
//! before their body is parsed.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The shared secret configured on the GitHub webhook.
#[derive(Clone)]
pub struct WebhookSecret(Vec<u8>);

impl WebhookSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        WebhookSecret(secret.into())
    }

    /// Checks `header` against the digest of `payload`, in constant time.
    ///
    /// Malformed headers never verify.
    pub fn verify(&self, payload: &[u8], header: &str) -> bool {
        let Some(expected) = parse_signature_header(header) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.0) else {
            return false;
        };
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    }

    /// Header value GitHub would send for `payload`.
    #[cfg(test)]
    pub fn sign(&self, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.0).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WebhookSecret(..)")
    }
}

/// Decodes a `sha256=<hex>` header. `None` for any other shape.
fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    hex::decode(header.strip_prefix("sha256=")?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_hex_digest() {
        assert_eq!(
            parse_signature_header("sha256=1234ABcd"),
            Some(vec![0x12, 0x34, 0xab, 0xcd])
        );
    }

    #[test]
    fn rejects_other_header_shapes() {
        assert_eq!(parse_signature_header("1234abcd"), None);
        assert_eq!(parse_signature_header("sha1=1234abcd"), None);
        assert_eq!(parse_signature_header("sha256=xyz"), None);
        assert_eq!(parse_signature_header("sha256=abc"), None);
        assert_eq!(parse_signature_header(""), None);
    }

    /// Vector from GitHub's "Validating webhook deliveries" guide.
    #[test]
    fn matches_github_documentation_vector() {
        let secret = WebhookSecret::new("It's a Secret to Everybody");
        let header = "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";
        assert!(secret.verify(b"Hello, World!", header));
        assert_eq!(secret.sign(b"Hello, World!"), header);
    }

    #[test]
    fn wrong_secret_or_payload_fails() {
        let secret = WebhookSecret::new("correct");
        let header = secret.sign(b"payload");

        assert!(secret.verify(b"payload", &header));
        assert!(!WebhookSecret::new("wrong").verify(b"payload", &header));
        assert!(!secret.verify(b"payload!", &header));
    }

    #[test]
    fn malformed_headers_never_verify() {
        let secret = WebhookSecret::new("secret");
        for header in ["", "sha256=", "sha256=zz", "sha1=abc123", "not-a-header"] {
            assert!(!secret.verify(b"test", header), "{header:?} verified");
        }
    }

    #[test]
    fn debug_hides_secret() {
        assert_eq!(
            format!("{:?}", WebhookSecret::new("hunter2")),
            "WebhookSecret(..)"
        );
    }

    proptest! {
        #[test]
        fn signed_payload_verifies(payload: Vec<u8>, secret: Vec<u8>) {
            let secret = WebhookSecret::new(secret);
            let header = secret.sign(&payload);
            prop_assert!(secret.verify(&payload, &header));
        }

        #[test]
        fn other_secret_fails(payload: Vec<u8>, a: Vec<u8>, b: Vec<u8>) {
            prop_assume!(a != b);
            let header = WebhookSecret::new(a).sign(&payload);
            prop_assert!(!WebhookSecret::new(b).verify(&payload, &header));
        }

        #[test]
        fn arbitrary_headers_do_not_panic(header: String, payload: Vec<u8>) {
            let _ = WebhookSecret::new("s").verify(&payload, &header);
        }
    }
}
