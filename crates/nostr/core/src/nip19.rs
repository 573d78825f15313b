//! NIP-19: bech32-encoded keys.
//!
//! Only the bare key entities (`nsec`, `npub`) are needed to read secrets and
//! remote-signer pubkeys from the command line; TLV entities are out of scope.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/19.md>

use bech32::{Bech32, Hrp};
use thiserror::Error;

/// Human readable part for secret keys.
pub const NSEC_HRP: &str = "nsec";

/// Human readable part for public keys.
pub const NPUB_HRP: &str = "npub";

/// Errors that can occur while decoding keys.
#[derive(Debug, Error)]
pub enum Nip19Error {
    #[error("bech32 error: {0}")]
    Bech32(String),

    #[error("unexpected prefix: expected {expected}, got {actual}")]
    WrongPrefix { expected: &'static str, actual: String },

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex key: {0}")]
    InvalidHex(String),
}

fn decode_entity(expected: &'static str, value: &str) -> Result<[u8; 32], Nip19Error> {
    let (hrp, data) = bech32::decode(value).map_err(|e| Nip19Error::Bech32(e.to_string()))?;
    let actual = hrp.to_string().to_lowercase();
    if actual != expected {
        return Err(Nip19Error::WrongPrefix { expected, actual });
    }
    to_key(&data)
}

fn encode_entity(hrp: &str, key: &[u8; 32]) -> Result<String, Nip19Error> {
    let hrp = Hrp::parse(hrp).map_err(|e| Nip19Error::Bech32(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, key).map_err(|e| Nip19Error::Bech32(e.to_string()))
}

fn to_key(bytes: &[u8]) -> Result<[u8; 32], Nip19Error> {
    if bytes.len() != 32 {
        return Err(Nip19Error::InvalidLength(bytes.len()));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(bytes);
    Ok(key)
}

fn decode_hex_key(value: &str) -> Result<[u8; 32], Nip19Error> {
    if value.len() != 64 {
        return Err(Nip19Error::InvalidHex(format!(
            "expected 64 hex characters, got {}",
            value.len()
        )));
    }
    let bytes = hex::decode(value).map_err(|e| Nip19Error::InvalidHex(e.to_string()))?;
    to_key(&bytes)
}

/// Decode an `nsec1...` string into a secret key.
pub fn decode_nsec(value: &str) -> Result<[u8; 32], Nip19Error> {
    decode_entity(NSEC_HRP, value)
}

/// Decode an `npub1...` string into an x-only public key.
pub fn decode_npub(value: &str) -> Result<[u8; 32], Nip19Error> {
    decode_entity(NPUB_HRP, value)
}

/// Encode a secret key as `nsec1...`.
pub fn encode_nsec(secret_key: &[u8; 32]) -> Result<String, Nip19Error> {
    encode_entity(NSEC_HRP, secret_key)
}

/// Encode an x-only public key as `npub1...`.
pub fn encode_npub(public_key: &[u8; 32]) -> Result<String, Nip19Error> {
    encode_entity(NPUB_HRP, public_key)
}

/// Parse a secret key given either as 64 hex characters or as an `nsec`.
pub fn parse_secret_key(value: &str) -> Result<[u8; 32], Nip19Error> {
    let value = value.trim();
    if value.starts_with("nsec1") {
        decode_nsec(value)
    } else {
        decode_hex_key(value)
    }
}

/// Parse a public key given either as 64 hex characters or as an `npub`.
pub fn parse_public_key(value: &str) -> Result<[u8; 32], Nip19Error> {
    let value = value.trim();
    if value.starts_with("npub1") {
        decode_npub(value)
    } else {
        decode_hex_key(value)
    }
}
