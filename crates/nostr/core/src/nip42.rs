//! NIP-42: Authentication of clients to relays.
//!
//! A relay sends `["AUTH", <challenge>]`; the client answers with
//! `["AUTH", <signed kind 22242 event>]` carrying the relay URL and the challenge.
//! Requests the relay refuses before authentication are closed with a message
//! prefixed by `auth-required:`.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/42.md>

use crate::nip01::EventTemplate;
use thiserror::Error;
use url::Url;

/// Kind of the client authentication event.
pub const AUTH_KIND: u16 = 22242;

/// Tag carrying the relay URL.
pub const RELAY_TAG: &str = "relay";

/// Tag carrying the relay-issued challenge.
pub const CHALLENGE_TAG: &str = "challenge";

/// Machine-readable prefix of `CLOSED`/`OK` messages that require authentication.
pub const AUTH_REQUIRED_PREFIX: &str = "auth-required:";

/// Machine-readable prefix used when an authenticated client is still not allowed.
pub const RESTRICTED_PREFIX: &str = "restricted:";

/// Errors that can occur during NIP-42 operations.
#[derive(Debug, Error)]
pub enum Nip42Error {
    #[error("invalid relay URL {url}: {reason}")]
    InvalidRelayUrl { url: String, reason: String },
}

/// Build the unsigned authentication event answering `challenge` from `relay_url`.
pub fn create_auth_event_template(relay_url: &str, challenge: &str, created_at: u64) -> EventTemplate {
    EventTemplate {
        created_at,
        kind: AUTH_KIND,
        tags: vec![
            vec![RELAY_TAG.to_string(), relay_url.to_string()],
            vec![CHALLENGE_TAG.to_string(), challenge.to_string()],
        ],
        content: String::new(),
    }
}

/// Whether a relay message signals that authentication is required.
pub fn is_auth_required_error(message: &str) -> bool {
    message.starts_with(AUTH_REQUIRED_PREFIX)
}

/// Whether a relay message signals that the authenticated key is not allowed.
pub fn is_restricted_error(message: &str) -> bool {
    message.starts_with(RESTRICTED_PREFIX)
}

/// Normalize a relay address.
///
/// Missing schemes default to `wss://`, `http(s)` is mapped to `ws(s)`, the host is
/// lower-cased and a bare trailing slash is dropped, so the same relay always maps to
/// the same string (used for de-duplication and for the `relay` tag).
pub fn normalize_relay_url(input: &str) -> Result<String, Nip42Error> {
    let trimmed = input.trim();
    let invalid = |reason: String| Nip42Error::InvalidRelayUrl {
        url: input.to_string(),
        reason,
    };

    if trimmed.is_empty() {
        return Err(invalid("empty address".to_string()));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("wss://{}", trimmed)
    };

    let mut url = Url::parse(&with_scheme).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {}", other))),
    };
    if url.scheme() != scheme {
        // Url refuses some special-to-special scheme swaps; rebuild instead.
        let rest = &url.as_str()[url.scheme().len()..];
        url = Url::parse(&format!("{}{}", scheme, rest)).map_err(|e| invalid(e.to_string()))?;
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }

    let mut normalized = url.to_string();
    if url.query().is_none() && url.fragment().is_none() {
        while normalized.ends_with('/') {
            normalized.pop();
        }
    }
    Ok(normalized)
}
