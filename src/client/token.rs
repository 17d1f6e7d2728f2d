//! Local inspection of access tokens.
//!
//! The client never holds the signing secret, so these helpers only read the
//! payload. Whether a token is trustworthy is the server's call.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeekedClaims {
    pub sub: String,
    pub exp: u64,
}

impl PeekedClaims {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.exp
    }
}

/// Decode the payload of a compact JWT without checking its signature.
pub fn peek_claims(token: &str) -> Option<PeekedClaims> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Well-formed and not yet expired at `now`.
pub fn is_locally_valid(token: &str, now: u64) -> bool {
    peek_claims(token).is_some_and(|claims| !claims.is_expired(now))
}

/// Source of the current time, in seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}
