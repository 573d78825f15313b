//! Nostr protocol types for the `nostr-req` query client.
//!
//! This crate provides:
//! - NIP-01: Basic protocol (events, signing, verification)
//! - NIP-19: bech32-encoded keys (`nsec`, `npub`)
//! - NIP-42: Authentication of clients to relays, relay URL normalization
//! - NIP-44: Versioned encryption (v2)
//! - NIP-46: Nostr Remote Signing message types

mod nip01;
mod nip19;
mod nip42;
mod nip44;
mod nip46;

pub use nip01::{
    Event, EventTemplate, Nip01Error, UnsignedEvent, finalize_event, generate_secret_key,
    get_event_hash, get_public_key, get_public_key_hex, now, serialize_event, validate_event,
    validate_unsigned_event, verify_event,
};

pub use nip19::{
    NPUB_HRP, NSEC_HRP, Nip19Error, decode_npub, decode_nsec, encode_npub, encode_nsec,
    parse_public_key, parse_secret_key,
};

pub use nip42::{
    AUTH_KIND, AUTH_REQUIRED_PREFIX, CHALLENGE_TAG, Nip42Error, RELAY_TAG, RESTRICTED_PREFIX,
    create_auth_event_template, is_auth_required_error, is_restricted_error, normalize_relay_url,
};

pub use nip44::{
    MAC_SIZE, MAX_PLAINTEXT_LEN, MIN_PLAINTEXT_LEN, NONCE_SIZE, Nip44Error, VERSION,
    calc_padded_len, decrypt as decrypt_v2, decrypt_with_conversation_key,
    encrypt as encrypt_v2, encrypt_with_conversation_key, get_conversation_key,
};

pub use nip46::{
    AUTH_URL_RESULT, BUNKER_SCHEME, BunkerUrl, KIND_NOSTR_CONNECT, Nip46Error,
    NostrConnectMethod, NostrConnectRequest, NostrConnectResponse, generate_request_id,
    is_nostr_connect_event,
};
