//! NIP-46: Nostr Remote Signing
//!
//! Message types for talking to a remote signer ("bunker"). Requests and
//! responses are JSON documents carried as NIP-44 encrypted content of kind
//! 24133 events exchanged on the bunker's relays.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/46.md>

use crate::nip01::{Event, EventTemplate};
use crate::nip19::parse_public_key;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

/// Kind of events carrying remote signing requests and responses.
pub const KIND_NOSTR_CONNECT: u16 = 24133;

/// URI scheme of a remote signer address.
pub const BUNKER_SCHEME: &str = "bunker";

/// Result value a signer uses to ask the user to visit an authorization page.
pub const AUTH_URL_RESULT: &str = "auth_url";

/// Errors that can occur during NIP-46 operations
#[derive(Debug, Error)]
pub enum Nip46Error {
    #[error("invalid bunker URL: {0}")]
    InvalidUrl(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("remote signer error: {0}")]
    Remote(String),

    #[error("empty response for request {0}")]
    EmptyResponse(String),
}

/// A parsed `bunker://<remote-pubkey>?relay=wss://...&secret=...` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BunkerUrl {
    /// Remote signer pubkey, lowercase hex.
    pub remote_pubkey: String,
    pub relays: Vec<String>,
    pub secret: Option<String>,
}

impl BunkerUrl {
    pub fn parse(input: &str) -> Result<Self, Nip46Error> {
        let url = Url::parse(input.trim()).map_err(|e| Nip46Error::InvalidUrl(e.to_string()))?;
        if url.scheme() != BUNKER_SCHEME {
            return Err(Nip46Error::InvalidUrl(format!(
                "expected {}:// scheme, got {}",
                BUNKER_SCHEME,
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| Nip46Error::InvalidUrl("missing remote signer pubkey".to_string()))?;
        let pubkey =
            parse_public_key(host).map_err(|e| Nip46Error::InvalidUrl(e.to_string()))?;

        let mut relays = Vec::new();
        let mut secret = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "relay" => {
                    if !relays.iter().any(|r| r == value.as_ref()) {
                        relays.push(value.into_owned());
                    }
                }
                "secret" => secret = Some(value.into_owned()),
                _ => {}
            }
        }

        if relays.is_empty() {
            return Err(Nip46Error::InvalidUrl("no relay given".to_string()));
        }

        Ok(Self {
            remote_pubkey: hex::encode(pubkey),
            relays,
            secret,
        })
    }
}

impl FromStr for BunkerUrl {
    type Err = Nip46Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BunkerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", BUNKER_SCHEME, self.remote_pubkey)?;
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for relay in &self.relays {
            query.append_pair("relay", relay);
        }
        if let Some(secret) = &self.secret {
            query.append_pair("secret", secret);
        }
        let query = query.finish();
        if !query.is_empty() {
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

/// Remote signing methods used by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NostrConnectMethod {
    Connect,
    GetPublicKey,
    SignEvent,
    Ping,
}

impl NostrConnectMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            NostrConnectMethod::Connect => "connect",
            NostrConnectMethod::GetPublicKey => "get_public_key",
            NostrConnectMethod::SignEvent => "sign_event",
            NostrConnectMethod::Ping => "ping",
        }
    }
}

impl FromStr for NostrConnectMethod {
    type Err = Nip46Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connect" => Ok(NostrConnectMethod::Connect),
            "get_public_key" => Ok(NostrConnectMethod::GetPublicKey),
            "sign_event" => Ok(NostrConnectMethod::SignEvent),
            "ping" => Ok(NostrConnectMethod::Ping),
            other => Err(Nip46Error::UnknownMethod(other.to_string())),
        }
    }
}

/// A request sent to the remote signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NostrConnectRequest {
    pub id: String,
    pub method: String,
    pub params: Vec<String>,
}

impl NostrConnectRequest {
    pub fn new(method: NostrConnectMethod, params: Vec<String>) -> Self {
        Self {
            id: generate_request_id(),
            method: method.as_str().to_string(),
            params,
        }
    }

    pub fn connect(remote_pubkey: &str, secret: Option<&str>) -> Self {
        let mut params = vec![remote_pubkey.to_string()];
        if let Some(secret) = secret {
            params.push(secret.to_string());
        }
        Self::new(NostrConnectMethod::Connect, params)
    }

    pub fn get_public_key() -> Self {
        Self::new(NostrConnectMethod::GetPublicKey, Vec::new())
    }

    /// `sign_event` carries the template (no pubkey, id or sig) as a JSON string.
    pub fn sign_event(template: &EventTemplate) -> Result<Self, Nip46Error> {
        let json = serde_json::to_string(template)?;
        Ok(Self::new(NostrConnectMethod::SignEvent, vec![json]))
    }

    pub fn method(&self) -> Result<NostrConnectMethod, Nip46Error> {
        self.method.parse()
    }

    pub fn to_json(&self) -> Result<String, Nip46Error> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A response from the remote signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NostrConnectResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NostrConnectResponse {
    pub fn from_json(json: &str) -> Result<Self, Nip46Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// The authorization URL, when the signer wants the user to approve first.
    pub fn auth_url(&self) -> Option<&str> {
        match self.result.as_deref() {
            Some(AUTH_URL_RESULT) => self.error.as_deref(),
            _ => None,
        }
    }

    /// Convert into the result string, surfacing remote errors.
    pub fn into_result(self) -> Result<String, Nip46Error> {
        if let Some(error) = self.error.filter(|e| !e.is_empty()) {
            return Err(Nip46Error::Remote(error));
        }
        self.result.ok_or(Nip46Error::EmptyResponse(self.id))
    }
}

/// Random request id (16 hex characters).
pub fn generate_request_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Whether `event` is a remote signing message.
pub fn is_nostr_connect_event(event: &Event) -> bool {
    event.kind == KIND_NOSTR_CONNECT
}
