//! Signing seam used to answer NIP-42 challenges.
//!
//! [`LocalSigner`] signs with a secret key held in memory; the NIP-46 remote signer
//! lives in [`crate::bunker`].

use async_trait::async_trait;
use nostr::{Event, EventTemplate, finalize_event, get_public_key_hex};
use thiserror::Error;

/// Errors that can occur while obtaining a signature.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid secret key: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("remote signer error: {0}")]
    Remote(String),

    #[error("remote signer did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("remote signer unreachable: {0}")]
    Connection(String),

    #[error("no signer configured")]
    Unavailable,
}

/// Something that can sign events on behalf of one pubkey.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex pubkey the signatures belong to.
    async fn public_key(&self) -> Result<String, SignerError>;

    /// Sign `template`, producing a complete event.
    async fn sign_event(&self, template: EventTemplate) -> Result<Event, SignerError>;
}

/// Signs with a local secret key.
pub struct LocalSigner {
    secret_key: [u8; 32],
    public_key: String,
}

impl LocalSigner {
    pub fn new(secret_key: [u8; 32]) -> Result<Self, SignerError> {
        let public_key =
            get_public_key_hex(&secret_key).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    /// Parse a hex or `nsec` secret key.
    pub fn from_str_key(value: &str) -> Result<Self, SignerError> {
        let secret_key =
            nostr::parse_secret_key(value).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Self::new(secret_key)
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn public_key(&self) -> Result<String, SignerError> {
        Ok(self.public_key.clone())
    }

    async fn sign_event(&self, template: EventTemplate) -> Result<Event, SignerError> {
        finalize_event(&template, &self.secret_key).map_err(|e| SignerError::Signing(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{create_auth_event_template, verify_event};

    const KEY_ONE: &str = "0000000000000000000000000000000000000000000000000000000000000001";

    #[tokio::test]
    async fn test_local_signer_signs_auth_event() {
        let signer = LocalSigner::from_str_key(KEY_ONE).unwrap();
        assert_eq!(
            signer.public_key().await.unwrap(),
            "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
        );

        let template = create_auth_event_template("wss://relay.example.com", "abc", 1_700_000_000);
        let event = signer.sign_event(template).await.unwrap();
        assert_eq!(event.kind, 22242);
        assert_eq!(event.tag_value("challenge"), Some("abc"));
        assert!(verify_event(&event).unwrap());
    }

    #[test]
    fn test_local_signer_rejects_bad_keys() {
        assert!(matches!(
            LocalSigner::from_str_key("deadbeef"),
            Err(SignerError::InvalidKey(_))
        ));
        assert!(LocalSigner::new([0u8; 32]).is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let signer = LocalSigner::from_str_key(KEY_ONE).unwrap();
        let debug = format!("{:?}", signer);
        assert!(!debug.contains(KEY_ONE));
        assert!(debug.contains("79be667e"));
    }
}
