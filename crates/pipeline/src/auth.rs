//! Origin authentication for inbound push notifications.
//!
//! The sender signs each request with HMAC-SHA256 over the raw body using a
//! pre-shared secret and puts the hex digest in [`SIGNATURE_HEADER`]
//! (optionally prefixed with `sha256=`). When [`TIMESTAMP_HEADER`] is present
//! the signed message is `"{timestamp}.{body}"` and the timestamp must fall
//! within the configured tolerance of the arrival time, which bounds replay.
//!
//! Digests are compared with [`subtle::ConstantTimeEq`] so the comparison time
//! does not depend on how many leading bytes match.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::{InboundHeaders, SignatureConfig, Timestamp};

/// Header carrying the hex HMAC-SHA256 signature.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Header carrying the signing time in Unix seconds.
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

/// Why a request failed authentication. Logged, never returned to the caller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No secret is configured; every request is rejected.
    #[error("no signature secret configured")]
    NoSecret,
    /// The signature header is absent.
    #[error("missing signature header")]
    MissingSignature,
    /// The signature header is not a hex SHA-256 digest.
    #[error("malformed signature header")]
    MalformedSignature,
    /// A timestamp is required but absent.
    #[error("missing timestamp header")]
    MissingTimestamp,
    /// The timestamp header is not a Unix-seconds integer.
    #[error("malformed timestamp header")]
    MalformedTimestamp,
    /// The timestamp is outside the tolerance window.
    #[error("timestamp outside tolerance")]
    StaleTimestamp,
    /// The signature does not match.
    #[error("signature mismatch")]
    Mismatch,
}

/// Verifies that inbound requests were signed with the shared secret.
pub struct OriginAuthenticator {
    secret: SecretString,
    config: SignatureConfig,
}

impl std::fmt::Debug for OriginAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginAuthenticator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OriginAuthenticator {
    /// Creates an authenticator for `secret`.
    pub fn new(secret: SecretString, config: SignatureConfig) -> Self {
        Self { secret, config }
    }

    /// Returns `true` if the request carries a valid signature.
    ///
    /// Never panics or errors: a missing header, a malformed header and a
    /// mismatch all yield `false`.
    pub fn authenticate(&self, headers: &InboundHeaders, body: &[u8], now: Timestamp) -> bool {
        match self.verify(headers, body, now) {
            Ok(()) => true,
            Err(failure) => {
                tracing::warn!(reason = %failure, "origin authentication failed");
                false
            }
        }
    }

    /// Like [`Self::authenticate`] but reports the failure reason.
    ///
    /// # Errors
    ///
    /// Returns the first [`AuthFailure`] encountered.
    pub fn verify(
        &self,
        headers: &InboundHeaders,
        body: &[u8],
        now: Timestamp,
    ) -> Result<(), AuthFailure> {
        if self.secret.expose_secret().is_empty() {
            return Err(AuthFailure::NoSecret);
        }

        let header = headers.get(SIGNATURE_HEADER).ok_or(AuthFailure::MissingSignature)?;
        let provided = parse_signature(header)?;

        let timestamp = match headers.get(TIMESTAMP_HEADER) {
            Some(raw) => Some(self.check_timestamp(raw, now)?),
            None if self.config.require_timestamp => return Err(AuthFailure::MissingTimestamp),
            None => None,
        };

        let expected = self.digest(timestamp.as_deref(), body);
        if constant_time_eq(&expected, &provided) {
            Ok(())
        } else {
            Err(AuthFailure::Mismatch)
        }
    }

    /// Computes the hex signature a sender would attach to `body`.
    ///
    /// Used by operator tooling and tests to produce valid requests.
    pub fn sign(&self, timestamp: Option<i64>, body: &[u8]) -> String {
        let timestamp = timestamp.map(|t| t.to_string());
        hex::encode(self.digest(timestamp.as_deref(), body))
    }

    fn check_timestamp(&self, raw: &str, now: Timestamp) -> Result<String, AuthFailure> {
        let trimmed = raw.trim();
        let seconds: i64 = trimmed.parse().map_err(|_| AuthFailure::MalformedTimestamp)?;
        let signed_at =
            Timestamp::from_unix_seconds(seconds).ok_or(AuthFailure::MalformedTimestamp)?;
        if now.abs_diff(signed_at) > self.config.timestamp_tolerance {
            return Err(AuthFailure::StaleTimestamp);
        }
        Ok(trimmed.to_string())
    }

    fn digest(&self, timestamp: Option<&str>, body: &[u8]) -> Vec<u8> {
        let mut mac = match HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes()) {
            Ok(mac) => mac,
            // HMAC accepts keys of any length; keep the comparison failing if that ever changes.
            Err(_) => return Vec::new(),
        };
        if let Some(ts) = timestamp {
            mac.update(ts.as_bytes());
            mac.update(b".");
        }
        mac.update(body);
        mac.finalize().into_bytes().to_vec()
    }
}

fn parse_signature(header: &str) -> Result<Vec<u8>, AuthFailure> {
    let trimmed = header.trim();
    let hex_part = trimmed.strip_prefix(SIGNATURE_PREFIX).unwrap_or(trimmed);
    let bytes = hex::decode(hex_part).map_err(|_| AuthFailure::MalformedSignature)?;
    if bytes.len() != 32 {
        return Err(AuthFailure::MalformedSignature);
    }
    Ok(bytes)
}

/// Compares two byte strings in time independent of their contents.
///
/// Lengths are compared first; length is not considered secret.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() || a.is_empty() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const BODY: &[u8] = br#"{"message":{"data":"e30="}}"#;

    fn authenticator(config: SignatureConfig) -> OriginAuthenticator {
        OriginAuthenticator::new(SecretString::from("s3cret".to_string()), config)
    }

    fn now() -> Timestamp {
        Timestamp::from_unix_seconds(1_700_000_000).unwrap()
    }

    fn headers(signature: &str) -> InboundHeaders {
        [(SIGNATURE_HEADER, signature)].into_iter().collect()
    }

    #[test]
    fn accepts_valid_signature() {
        let auth = authenticator(SignatureConfig::default());
        let signature = auth.sign(None, BODY);
        assert!(auth.authenticate(&headers(&signature), BODY, now()));
    }

    #[test]
    fn accepts_prefixed_and_uppercase_signature() {
        let auth = authenticator(SignatureConfig::default());
        let signature = format!("sha256={}", auth.sign(None, BODY).to_uppercase());
        assert!(auth.authenticate(&headers(&signature), BODY, now()));
    }

    #[test]
    fn rejects_missing_and_malformed_headers() {
        let auth = authenticator(SignatureConfig::default());
        assert_eq!(
            auth.verify(&InboundHeaders::new(), BODY, now()),
            Err(AuthFailure::MissingSignature)
        );
        assert_eq!(
            auth.verify(&headers("not-hex"), BODY, now()),
            Err(AuthFailure::MalformedSignature)
        );
        assert_eq!(
            auth.verify(&headers("abcd"), BODY, now()),
            Err(AuthFailure::MalformedSignature)
        );
    }

    #[test]
    fn rejects_tampered_signature_and_body() {
        let auth = authenticator(SignatureConfig::default());
        let mut signature = auth.sign(None, BODY);
        let last = if signature.ends_with('0') { "1" } else { "0" };
        signature.replace_range(signature.len() - 1.., last);
        assert_eq!(auth.verify(&headers(&signature), BODY, now()), Err(AuthFailure::Mismatch));

        let good = auth.sign(None, BODY);
        assert_eq!(
            auth.verify(&headers(&good), b"{\"tampered\":true}", now()),
            Err(AuthFailure::Mismatch)
        );
    }

    #[test]
    fn rejects_signature_from_other_secret() {
        let other = OriginAuthenticator::new(SecretString::from("other".to_string()), SignatureConfig::default());
        let auth = authenticator(SignatureConfig::default());
        let signature = other.sign(None, BODY);
        assert!(!auth.authenticate(&headers(&signature), BODY, now()));
    }

    #[test]
    fn empty_secret_rejects_everything() {
        let auth = OriginAuthenticator::new(SecretString::from("".to_string()), SignatureConfig::default());
        let signature = auth.sign(None, BODY);
        assert_eq!(auth.verify(&headers(&signature), BODY, now()), Err(AuthFailure::NoSecret));
    }

    #[test]
    fn timestamp_is_bound_into_signature() {
        let auth = authenticator(SignatureConfig::default());
        let ts = 1_700_000_000_i64;
        let signature = auth.sign(Some(ts), BODY);

        let mut h = headers(&signature);
        h.insert(TIMESTAMP_HEADER, ts.to_string());
        assert!(auth.authenticate(&h, BODY, now()));

        // Same signature replayed with a different timestamp fails.
        h.insert(TIMESTAMP_HEADER, (ts + 1).to_string());
        assert_eq!(auth.verify(&h, BODY, now()), Err(AuthFailure::Mismatch));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let auth = authenticator(SignatureConfig {
            timestamp_tolerance: Duration::from_secs(60),
            require_timestamp: false,
        });
        let ts = 1_700_000_000_i64 - 61;
        let mut h = headers(&auth.sign(Some(ts), BODY));
        h.insert(TIMESTAMP_HEADER, ts.to_string());
        assert_eq!(auth.verify(&h, BODY, now()), Err(AuthFailure::StaleTimestamp));

        h.insert(TIMESTAMP_HEADER, "yesterday");
        assert_eq!(auth.verify(&h, BODY, now()), Err(AuthFailure::MalformedTimestamp));
    }

    #[test]
    fn required_timestamp_must_be_present() {
        let auth = authenticator(SignatureConfig {
            require_timestamp: true,
            ..SignatureConfig::default()
        });
        let signature = auth.sign(None, BODY);
        assert_eq!(
            auth.verify(&headers(&signature), BODY, now()),
            Err(AuthFailure::MissingTimestamp)
        );
    }

    #[test]
    fn constant_time_eq_handles_lengths() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"tokeN"));
        assert!(!constant_time_eq(b"token", b"toke"));
        assert!(!constant_time_eq(b"", b""));
    }

    #[test]
    fn debug_output_omits_secret() {
        let auth = authenticator(SignatureConfig::default());
        assert!(!format!("{auth:?}").contains("s3cret"));
    }
}
