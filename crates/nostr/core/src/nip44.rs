//! NIP-44: Versioned encryption (version 2).
//!
//! secp256k1 ECDH + HKDF-SHA256 for the conversation key, ChaCha20 for the payload,
//! HMAC-SHA256 over `nonce || ciphertext`, power-of-two padding, base64 framing.
//! Used here to talk to NIP-46 remote signers.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/44.md>

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bitcoin::secp256k1::{PublicKey, SecretKey, ecdh};
use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

/// Payload version byte.
pub const VERSION: u8 = 0x02;

/// Size of the random nonce prepended to every payload.
pub const NONCE_SIZE: usize = 32;

/// Size of the HMAC-SHA256 tag appended to every payload.
pub const MAC_SIZE: usize = 32;

/// Smallest accepted plaintext, in bytes.
pub const MIN_PLAINTEXT_LEN: usize = 1;

/// Largest accepted plaintext, in bytes.
pub const MAX_PLAINTEXT_LEN: usize = 65535;

const SALT: &[u8] = b"nip44-v2";

type HmacSha256 = Hmac<Sha256>;

/// Errors that can occur during NIP-44 operations.
#[derive(Debug, Error)]
pub enum Nip44Error {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid plaintext length: {0}")]
    InvalidPlaintextLength(usize),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unknown version: {0}")]
    UnknownVersion(u8),

    #[error("invalid MAC")]
    InvalidMac,

    #[error("invalid padding")]
    InvalidPadding,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

fn parse_public_key(public_key: &[u8]) -> Result<PublicKey, Nip44Error> {
    let result = match public_key.len() {
        32 => {
            let mut compressed = [0u8; 33];
            compressed[0] = 0x02;
            compressed[1..].copy_from_slice(public_key);
            PublicKey::from_slice(&compressed)
        }
        _ => PublicKey::from_slice(public_key),
    };
    result.map_err(|e| Nip44Error::InvalidPublicKey(e.to_string()))
}

/// Derive the conversation key shared by `secret_key` and `public_key`.
///
/// `public_key` may be x-only (32 bytes) or compressed (33 bytes).
pub fn get_conversation_key(
    secret_key: &[u8; 32],
    public_key: &[u8],
) -> Result<[u8; 32], Nip44Error> {
    let sk =
        SecretKey::from_slice(secret_key).map_err(|e| Nip44Error::InvalidSecretKey(e.to_string()))?;
    let pk = parse_public_key(public_key)?;

    let point = ecdh::shared_secret_point(&pk, &sk);
    let (prk, _) = Hkdf::<Sha256>::extract(Some(SALT), &point[..32]);

    let mut key = [0u8; 32];
    key.copy_from_slice(&prk);
    Ok(key)
}

struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

fn get_message_keys(conversation_key: &[u8; 32], nonce: &[u8; 32]) -> Result<MessageKeys, Nip44Error> {
    let hk = Hkdf::<Sha256>::from_prk(conversation_key)
        .map_err(|e| Nip44Error::KeyDerivation(e.to_string()))?;
    let mut okm = [0u8; 76];
    hk.expand(nonce, &mut okm)
        .map_err(|e| Nip44Error::KeyDerivation(e.to_string()))?;

    let mut keys = MessageKeys {
        chacha_key: [0u8; 32],
        chacha_nonce: [0u8; 12],
        hmac_key: [0u8; 32],
    };
    keys.chacha_key.copy_from_slice(&okm[..32]);
    keys.chacha_nonce.copy_from_slice(&okm[32..44]);
    keys.hmac_key.copy_from_slice(&okm[44..]);
    Ok(keys)
}

/// Padded length for a plaintext of `unpadded_len` bytes.
pub fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (unpadded_len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((unpadded_len - 1) / chunk + 1)
}

fn pad(plaintext: &str) -> Result<Vec<u8>, Nip44Error> {
    let bytes = plaintext.as_bytes();
    let len = bytes.len();
    if !(MIN_PLAINTEXT_LEN..=MAX_PLAINTEXT_LEN).contains(&len) {
        return Err(Nip44Error::InvalidPlaintextLength(len));
    }

    let mut padded = Vec::with_capacity(2 + calc_padded_len(len));
    padded.extend_from_slice(&(len as u16).to_be_bytes());
    padded.extend_from_slice(bytes);
    padded.resize(2 + calc_padded_len(len), 0);
    Ok(padded)
}

fn unpad(padded: &[u8]) -> Result<String, Nip44Error> {
    if padded.len() < 2 {
        return Err(Nip44Error::InvalidPadding);
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len < MIN_PLAINTEXT_LEN
        || padded.len() < 2 + len
        || padded.len() != 2 + calc_padded_len(len)
    {
        return Err(Nip44Error::InvalidPadding);
    }
    String::from_utf8(padded[2..2 + len].to_vec())
        .map_err(|e| Nip44Error::InvalidPayload(e.to_string()))
}

fn hmac_aad(key: &[u8; 32], nonce: &[u8; 32], ciphertext: &[u8]) -> Result<HmacSha256, Nip44Error> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| Nip44Error::KeyDerivation(e.to_string()))?;
    mac.update(nonce);
    mac.update(ciphertext);
    Ok(mac)
}

/// Encrypt with an explicit conversation key and nonce.
pub fn encrypt_with_conversation_key(
    conversation_key: &[u8; 32],
    nonce: &[u8; 32],
    plaintext: &str,
) -> Result<String, Nip44Error> {
    let keys = get_message_keys(conversation_key, nonce)?;
    let mut buffer = pad(plaintext)?;

    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut buffer);

    let tag = hmac_aad(&keys.hmac_key, nonce, &buffer)?.finalize().into_bytes();

    let mut payload = Vec::with_capacity(1 + NONCE_SIZE + buffer.len() + MAC_SIZE);
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&buffer);
    payload.extend_from_slice(&tag);
    Ok(BASE64.encode(payload))
}

/// Decrypt with an explicit conversation key.
pub fn decrypt_with_conversation_key(
    conversation_key: &[u8; 32],
    payload: &str,
) -> Result<String, Nip44Error> {
    if payload.is_empty() || payload.starts_with('#') {
        return Err(Nip44Error::InvalidPayload("unknown encoding".to_string()));
    }
    let data = BASE64
        .decode(payload)
        .map_err(|e| Nip44Error::InvalidPayload(e.to_string()))?;
    if data.len() < 1 + NONCE_SIZE + 2 + 32 + MAC_SIZE {
        return Err(Nip44Error::InvalidPayload(format!(
            "payload too short: {} bytes",
            data.len()
        )));
    }
    if data[0] != VERSION {
        return Err(Nip44Error::UnknownVersion(data[0]));
    }

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&data[1..1 + NONCE_SIZE]);
    let mac_start = data.len() - MAC_SIZE;
    let ciphertext = &data[1 + NONCE_SIZE..mac_start];

    let keys = get_message_keys(conversation_key, &nonce)?;
    hmac_aad(&keys.hmac_key, &nonce, ciphertext)?
        .verify_slice(&data[mac_start..])
        .map_err(|_| Nip44Error::InvalidMac)?;

    let mut buffer = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut buffer);
    unpad(&buffer)
}

/// Encrypt `plaintext` from `secret_key` to `public_key` with a random nonce.
pub fn encrypt(secret_key: &[u8; 32], public_key: &[u8], plaintext: &str) -> Result<String, Nip44Error> {
    let conversation_key = get_conversation_key(secret_key, public_key)?;
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);
    encrypt_with_conversation_key(&conversation_key, &nonce, plaintext)
}

/// Decrypt a payload sent by `public_key` to `secret_key`.
pub fn decrypt(secret_key: &[u8; 32], public_key: &[u8], payload: &str) -> Result<String, Nip44Error> {
    let conversation_key = get_conversation_key(secret_key, public_key)?;
    decrypt_with_conversation_key(&conversation_key, payload)
}
