// =============================================================================
// HMAC-SHA256 request signing
// =============================================================================
//
// SECURITY: the secret is never logged. Signed REST requests compose
// `apikey + timestamp + recvWindow + query`; the private websocket handshake
// signs `GET/realtime` + `expires` per spec.md §6.
// =============================================================================

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Holds the API credentials used to sign requests. Never derives `Debug`
/// directly — callers needing to log a client must redact this first.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
        }
    }

    /// HMAC-SHA256 hex digest of `payload`.
    pub fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build the REST signature payload `timestamp + api_key + recv_window + query`
    /// and return the signed query string ready to append as `&signature=...`.
    pub fn sign_rest_query(&self, timestamp_ms: u64, recv_window_ms: u64, query: &str) -> String {
        let payload = format!("{timestamp_ms}{}{recv_window_ms}{query}", self.api_key);
        self.sign(&payload)
    }

    /// Build the `{op: "auth", args: [key, expires, signature]}` payload for
    /// the private websocket handshake. `expires = now_ms + 10_000`; the
    /// signed payload is `apikey || timestamp || expires` per spec.md §6.
    pub fn ws_auth_args(&self) -> (String, u64, String) {
        let timestamp = Self::now_ms();
        let expires = timestamp + 10_000;
        let payload = format!("{}{timestamp}{expires}", self.api_key);
        let signature = self.sign(&payload);
        (self.api_key.clone(), expires, signature)
    }

    pub fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic() {
        let creds = Credentials::new("key", "secret");
        let a = creds.sign("payload");
        let b = creds.sign("payload");
        assert_eq!(a, b);
    }

    #[test]
    fn sign_differs_by_payload() {
        let creds = Credentials::new("key", "secret");
        assert_ne!(creds.sign("a"), creds.sign("b"));
    }

    #[test]
    fn debug_impl_redacts_secret() {
        let creds = Credentials::new("mykey", "mysecret");
        let dbg = format!("{:?}", creds);
        assert!(!dbg.contains("mysecret"));
    }
}
