// =============================================================================
// Authentication — HMAC event signatures and the admin key
// =============================================================================
//
// Event ingress: HMAC-SHA256 over the canonical payload bytes, hex-encoded in
// the `X-Reality-Signature` header. Verification decodes the hex and uses the
// Mac's own constant-time comparison.
//
// Admin surface: shared key in the `X-Admin-Key` header, checked with a
// constant-time byte comparison. The expected key is read from the
// environment on every request so rotation does not require a restart.
// =============================================================================

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use crate::api::error::ApiError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the event signature.
pub const SIGNATURE_HEADER: &str = "X-Reality-Signature";
/// Header carrying the admin key.
pub const ADMIN_KEY_HEADER: &str = "X-Admin-Key";
/// Environment variable holding the expected admin key.
pub const ADMIN_KEY_ENV: &str = "MERIDIAN_ADMIN_KEY";

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. The comparison examines every
/// byte even after a mismatch is found.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// =============================================================================
// Event signatures
// =============================================================================

/// Hex HMAC-SHA256 of `payload` under `secret`. Used by tests and tooling to
/// produce valid signatures.
pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature over the canonical payload bytes. The underlying
/// Mac comparison is constant time.
pub fn verify_signature(secret: &str, payload: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

// =============================================================================
// Admin key extractor
// =============================================================================

/// Axum extractor validating `X-Admin-Key` against `MERIDIAN_ADMIN_KEY`.
/// Rejects with 401 before the handler body executes.
pub struct AdminKey;

#[async_trait]
impl<S> FromRequestParts<S> for AdminKey
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var(ADMIN_KEY_ENV).unwrap_or_default();
        if expected.is_empty() {
            warn!("{ADMIN_KEY_ENV} is not set; all admin requests will be rejected");
            return Err(ApiError::Unauthorized(
                "server admin authentication not configured".to_string(),
            ));
        }

        let provided = parts
            .headers
            .get(ADMIN_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
            warn!("invalid admin key presented");
            return Err(ApiError::Unauthorized("invalid admin key".to_string()));
        }

        Ok(AdminKey)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer_string"));
        assert!(constant_time_eq(b"", b""));
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }

    #[test]
    fn signature_roundtrip() {
        let sig = sign_payload("secret", b"{\"a\":1}");
        assert!(verify_signature("secret", b"{\"a\":1}", &sig));
        assert!(!verify_signature("secret", b"{\"a\":2}", &sig));
        assert!(!verify_signature("other", b"{\"a\":1}", &sig));
    }

    #[test]
    fn malformed_hex_fails_closed() {
        assert!(!verify_signature("secret", b"payload", "not-hex!!"));
        assert!(!verify_signature("secret", b"payload", ""));
    }

    #[test]
    fn equivalent_encodings_sign_identically() {
        use crate::ingest::canonical::canonicalize;

        let a = br#"{"impact_points":10.0,"event_id":"e1"}"#;
        let b = br#"{ "event_id": "e1", "impact_points": 10.0 }"#;
        let (_, ca) = canonicalize(a).unwrap();
        let (_, cb) = canonicalize(b).unwrap();
        assert_eq!(sign_payload("k", &ca), sign_payload("k", &cb));
    }
}
