//! Server Dialback (XEP-0220) key handling and wire fragments.
//!
//! Dialback authenticates a domain assertion by calling back to the
//! asserting domain's authoritative server: the initiator sends `db:result`
//! with a key, the receiver opens (or reuses) a connection to the
//! authoritative server and echoes the key in `db:verify`, and the verdict
//! travels back as `type='valid'` / `type='invalid'`.
//!
//! Keys are HMAC-SHA256 over `(stream id, receiving domain, originating
//! domain)` under a per-process secret, hex-encoded. The registry stores the
//! key it issued for each pair so the incoming listener can match echoes
//! without re-deriving state.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Dialback key generator bound to a per-process secret.
///
/// The secret must stay stable for the process lifetime so keys issued
/// earlier in a stream's life remain verifiable.
#[derive(Clone)]
pub struct DialbackKeyGen {
    secret: Vec<u8>,
}

impl DialbackKeyGen {
    /// Create a generator from an existing secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Create a generator with a fresh random secret.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self::new(secret)
    }

    /// Generate the hex-encoded key for a stream.
    pub fn generate(&self, stream_id: &str, receiving: &str, originating: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(stream_id.as_bytes());
        mac.update(receiving.as_bytes());
        mac.update(originating.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a hex-encoded key in constant time.
    pub fn verify(&self, key: &str, stream_id: &str, receiving: &str, originating: &str) -> bool {
        let raw = match hex::decode(key) {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(stream_id.as_bytes());
        mac.update(receiving.as_bytes());
        mac.update(originating.as_bytes());
        mac.verify_slice(&raw).is_ok()
    }
}

impl std::fmt::Debug for DialbackKeyGen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialbackKeyGen")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// `db:result` key assertion sent by the originating server.
pub fn build_result(from: &str, to: &str, key: &str) -> String {
    format!("<db:result from='{}' to='{}'>{}</db:result>", from, to, key)
}

/// `db:result` verdict sent back by the receiving server.
pub fn build_result_response(from: &str, to: &str, valid: bool) -> String {
    format!(
        "<db:result from='{}' to='{}' type='{}'/>",
        from,
        to,
        if valid { "valid" } else { "invalid" }
    )
}

/// `db:verify` echo sent to the authoritative server.
pub fn build_verify(from: &str, to: &str, id: &str, key: &str) -> String {
    format!(
        "<db:verify from='{}' to='{}' id='{}'>{}</db:verify>",
        from, to, id, key
    )
}

/// `db:verify` verdict sent by the authoritative server.
pub fn build_verify_response(from: &str, to: &str, id: &str, valid: bool) -> String {
    format!(
        "<db:verify from='{}' to='{}' id='{}' type='{}'/>",
        from,
        to,
        id,
        if valid { "valid" } else { "invalid" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deterministic() {
        let keygen = DialbackKeyGen::new(b"process-secret");
        let key1 = keygen.generate("stream-1", "b.example", "a.example");
        let key2 = keygen.generate("stream-1", "b.example", "a.example");
        assert_eq!(key1, key2);
        assert_eq!(key1.len(), 64);
        assert!(key1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_key_varies_with_inputs() {
        let keygen = DialbackKeyGen::new(b"process-secret");
        let base = keygen.generate("stream-1", "b.example", "a.example");
        assert_ne!(base, keygen.generate("stream-2", "b.example", "a.example"));
        assert_ne!(base, keygen.generate("stream-1", "c.example", "a.example"));
        assert_ne!(base, keygen.generate("stream-1", "b.example", "c.example"));
    }

    #[test]
    fn test_verify() {
        let keygen = DialbackKeyGen::new(b"verify-secret");
        let key = keygen.generate("sid", "b.example", "a.example");

        assert!(keygen.verify(&key, "sid", "b.example", "a.example"));
        assert!(!keygen.verify(&key, "other", "b.example", "a.example"));
        assert!(!keygen.verify("zz-not-hex", "sid", "b.example", "a.example"));

        let other = DialbackKeyGen::new(b"different-secret");
        assert!(!other.verify(&key, "sid", "b.example", "a.example"));
    }

    #[test]
    fn test_wire_fragments() {
        let result = build_result("a.example", "b.example", "cafe01");
        assert!(result.contains("from='a.example'"));
        assert!(result.contains(">cafe01</db:result>"));

        let response = build_result_response("b.example", "a.example", true);
        assert!(response.contains("type='valid'"));

        let verify = build_verify("b.example", "a.example", "s1", "cafe01");
        assert!(verify.contains("id='s1'"));

        let verdict = build_verify_response("a.example", "b.example", "s1", false);
        assert!(verdict.contains("type='invalid'"));
    }
}
