use std::time::{SystemTime, UNIX_EPOCH};

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

/// Header carrying `sha256=<hex>` over the request body.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Header carrying the send time in unix seconds.
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

const ALGORITHM_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

/// Signature and timestamp header values for one outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeaders {
    pub signature: String,
    pub timestamp: String,
}

impl SignatureHeaders {
    /// `(header name, value)` pairs ready to be attached to a request.
    pub fn pairs(&self) -> [(&'static str, &str); 2] {
        [
            (SIGNATURE_HEADER, self.signature.as_str()),
            (TIMESTAMP_HEADER, self.timestamp.as_str()),
        ]
    }
}

/// HMAC-SHA256 signer and verifier. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct Authenticator;

impl Authenticator {
    /// Sign `payload`, producing `sha256=<lowercase hex>`.
    pub fn sign(&self, payload: &[u8], secret: &str) -> String {
        let mut mac = keyed_mac(secret);
        mac.update(payload);
        format!("{ALGORITHM_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
    }

    /// Check `signature` against `payload` in constant time.
    ///
    /// Anything malformed (missing prefix, odd-length or non-hex digest)
    /// is simply a mismatch.
    pub fn verify(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        let Some(digest_hex) = signature.strip_prefix(ALGORITHM_PREFIX) else {
            return false;
        };
        let Ok(digest) = hex::decode(digest_hex) else {
            return false;
        };

        let mut mac = keyed_mac(secret);
        mac.update(payload);
        mac.verify_slice(&digest).is_ok()
    }

    /// Headers for a request sent now.
    pub fn signature_headers(&self, payload: &[u8], secret: &str) -> SignatureHeaders {
        SignatureHeaders {
            signature: self.sign(payload, secret),
            timestamp: unix_now().to_string(),
        }
    }
}

fn keyed_mac(secret: &str) -> HmacSha256 {
    // HMAC accepts keys of any length, so the fallback is never taken.
    <HmacSha256 as KeyInit>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| <HmacSha256 as KeyInit>::new(&Default::default()))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Basic timestamp freshness check for receivers.
pub fn is_timestamp_fresh(timestamp_secs: u64, now_secs: u64, max_age_secs: u64) -> bool {
    if now_secs >= timestamp_secs {
        now_secs - timestamp_secs <= max_age_secs
    } else {
        false
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedSignature {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
}

/// Pick the signature and timestamp headers out of a header list.
/// Header names compare case-insensitively.
pub fn parse_signature_headers<'a, I>(headers: I) -> ParsedSignature
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut parsed = ParsedSignature::default();

    for (name, value) in headers {
        if name.eq_ignore_ascii_case(SIGNATURE_HEADER) {
            parsed.signature = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(TIMESTAMP_HEADER) {
            parsed.timestamp = Some(value.to_string());
        }
    }

    parsed
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("signature header missing")]
    MissingSignature,
    #[error("timestamp header missing")]
    MissingTimestamp,
    #[error("timestamp is not a unix time")]
    InvalidTimestamp,
    #[error("timestamp outside the accepted window")]
    StaleTimestamp,
    #[error("signature verification failed")]
    InvalidSignature,
}

/// Verify an incoming webhook request in one call.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &str,
    max_age_secs: u64,
    now_secs: u64,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let parsed = parse_signature_headers(headers);
    let signature = parsed.signature.ok_or(VerificationError::MissingSignature)?;
    let timestamp = parsed
        .timestamp
        .ok_or(VerificationError::MissingTimestamp)?
        .parse::<u64>()
        .map_err(|_| VerificationError::InvalidTimestamp)?;

    if !is_timestamp_fresh(timestamp, now_secs, max_age_secs) {
        return Err(VerificationError::StaleTimestamp);
    }

    if Authenticator.verify(payload, &signature, secret) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}
