//! NIP-46 remote signer client.
//!
//! [`BunkerSigner`] delegates signing to a remote signer ("bunker") reached through the
//! relays named in its `bunker://` address. Requests and responses are kind 24133 events
//! whose content is NIP-44 encrypted between the client key and the bunker key.
//!
//! The session (relay pool, response listener, `connect` handshake) is opened on first
//! use and shared by every later request.

use crate::auth::AuthPolicy;
use crate::connection::Connector;
use crate::filter::Filter;
use crate::pool::RelayPool;
use crate::relay::RelayConfig;
use crate::signer::{Signer, SignerError};
use crate::subscription::{DeliveryMode, EventStream, RelayEvent};
use async_trait::async_trait;
use futures::StreamExt;
use nostr::{
    BunkerUrl, Event, EventTemplate, KIND_NOSTR_CONNECT, NostrConnectRequest, NostrConnectResponse,
    decrypt_v2, encrypt_v2, finalize_event, generate_secret_key, get_public_key_hex, now,
    verify_event,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type PendingRequests = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<NostrConnectResponse>>>>;

/// Signs through a NIP-46 remote signer.
pub struct BunkerSigner {
    bunker: BunkerUrl,
    remote_pubkey: [u8; 32],
    client_secret: [u8; 32],
    client_pubkey: String,
    connector: Arc<dyn Connector>,
    relay_config: RelayConfig,
    timeout: Duration,
    cancel: CancellationToken,
    session: OnceCell<BunkerSession>,
    user_pubkey: OnceCell<String>,
}

struct BunkerSession {
    pool: RelayPool,
    pending: PendingRequests,
    listener: JoinHandle<()>,
}

impl Drop for BunkerSession {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl BunkerSigner {
    /// Create a signer for `bunker`, talking as `client_secret` (random when `None`).
    ///
    /// Nothing is sent until the first signing request.
    pub fn new(
        bunker: BunkerUrl,
        client_secret: Option<[u8; 32]>,
        connector: Arc<dyn Connector>,
        relay_config: RelayConfig,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, SignerError> {
        let remote_pubkey: [u8; 32] = hex::decode(&bunker.remote_pubkey)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| SignerError::InvalidKey(format!("bad bunker pubkey {}", bunker.remote_pubkey)))?;
        let client_secret = client_secret.unwrap_or_else(generate_secret_key);
        let client_pubkey =
            get_public_key_hex(&client_secret).map_err(|e| SignerError::InvalidKey(e.to_string()))?;

        Ok(Self {
            bunker,
            remote_pubkey,
            client_secret,
            client_pubkey,
            connector,
            relay_config,
            timeout,
            cancel,
            session: OnceCell::new(),
            user_pubkey: OnceCell::new(),
        })
    }

    /// Pubkey the client uses towards the bunker.
    pub fn client_pubkey(&self) -> &str {
        &self.client_pubkey
    }

    pub fn bunker(&self) -> &BunkerUrl {
        &self.bunker
    }

    async fn session(&self) -> Result<&BunkerSession, SignerError> {
        self.session.get_or_try_init(|| self.open_session()).await
    }

    async fn open_session(&self) -> Result<BunkerSession, SignerError> {
        info!("Connecting to remote signer {}", self.bunker.remote_pubkey);
        let (pool, _) = RelayPool::connect(
            &self.bunker.relays,
            self.connector.clone(),
            AuthPolicy::Disabled,
            None,
            self.relay_config.clone(),
            &self.cancel,
        )
        .await
        .map_err(|e| SignerError::Connection(e.to_string()))?;

        // Only responses published from now on are of interest.
        let filter = Filter::new()
            .kinds(vec![KIND_NOSTR_CONNECT])
            .pubkey_refs(vec![self.client_pubkey.clone()])
            .limit(0);
        let responses = pool.subscribe(filter, DeliveryMode::Stream, self.cancel.child_token());

        let pending: PendingRequests = Arc::default();
        let listener = tokio::spawn(listen_for_responses(
            responses,
            pending.clone(),
            self.client_secret,
            self.remote_pubkey,
            self.bunker.remote_pubkey.clone(),
        ));
        let session = BunkerSession {
            pool,
            pending,
            listener,
        };

        let connect = NostrConnectRequest::connect(&self.bunker.remote_pubkey, self.bunker.secret.as_deref());
        let reply = self.request(&session, connect).await?;
        debug!("Remote signer accepted connect: {}", reply);
        Ok(session)
    }

    async fn request(&self, session: &BunkerSession, request: NostrConnectRequest) -> Result<String, SignerError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.pending.lock().await.insert(request.id.clone(), tx);
        let result = self.exchange(session, &request, &mut rx).await;
        session.pending.lock().await.remove(&request.id);
        result
    }

    async fn exchange(
        &self,
        session: &BunkerSession,
        request: &NostrConnectRequest,
        responses: &mut mpsc::UnboundedReceiver<NostrConnectResponse>,
    ) -> Result<String, SignerError> {
        let json = request.to_json().map_err(|e| SignerError::Remote(e.to_string()))?;
        let content = encrypt_v2(&self.client_secret, &self.remote_pubkey, &json)
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        let template = EventTemplate {
            created_at: now(),
            kind: KIND_NOSTR_CONNECT,
            tags: vec![vec!["p".to_string(), self.bunker.remote_pubkey.clone()]],
            content,
        };
        let event = finalize_event(&template, &self.client_secret)
            .map_err(|e| SignerError::Signing(e.to_string()))?;

        debug!("Sending {} request {} to remote signer", request.method, request.id);
        if session.pool.publish(&event) == 0 {
            return Err(SignerError::Connection("no remote signer relay connected".to_string()));
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let response = match timeout_at(deadline, responses.recv()).await {
                Ok(Some(response)) => response,
                Ok(None) => return Err(SignerError::Connection("remote signer session closed".to_string())),
                Err(_) => return Err(SignerError::Timeout(self.timeout)),
            };
            if let Some(url) = response.auth_url() {
                warn!("Remote signer asks for approval at {}", url);
                continue;
            }
            return response
                .into_result()
                .map_err(|e| SignerError::Remote(e.to_string()));
        }
    }
}

impl std::fmt::Debug for BunkerSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BunkerSigner")
            .field("remote_pubkey", &self.bunker.remote_pubkey)
            .field("relays", &self.bunker.relays)
            .field("client_pubkey", &self.client_pubkey)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for BunkerSigner {
    async fn public_key(&self) -> Result<String, SignerError> {
        self.user_pubkey
            .get_or_try_init(|| async {
                let session = self.session().await?;
                self.request(session, NostrConnectRequest::get_public_key()).await
            })
            .await
            .cloned()
    }

    async fn sign_event(&self, template: EventTemplate) -> Result<Event, SignerError> {
        let session = self.session().await?;
        let request = NostrConnectRequest::sign_event(&template).map_err(|e| SignerError::Signing(e.to_string()))?;
        let reply = self.request(session, request).await?;

        let event: Event = serde_json::from_str(&reply)
            .map_err(|e| SignerError::Remote(format!("invalid signed event: {}", e)))?;
        if event.kind != template.kind || event.tags != template.tags {
            return Err(SignerError::Remote("signed event does not match the request".to_string()));
        }
        if !verify_event(&event).unwrap_or(false) {
            return Err(SignerError::Remote("signed event has an invalid signature".to_string()));
        }
        Ok(event)
    }
}

async fn listen_for_responses(
    mut responses: EventStream,
    pending: PendingRequests,
    client_secret: [u8; 32],
    remote_pubkey: [u8; 32],
    remote_pubkey_hex: String,
) {
    while let Some(RelayEvent { relay_url, event }) = responses.next().await {
        if event.pubkey != remote_pubkey_hex {
            debug!("Ignoring kind {} event from {} on {}", event.kind, event.pubkey, relay_url);
            continue;
        }
        let response = match decrypt_v2(&client_secret, &remote_pubkey, &event.content)
            .map_err(|e| e.to_string())
            .and_then(|plaintext| NostrConnectResponse::from_json(&plaintext).map_err(|e| e.to_string()))
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Unreadable remote signer response {}: {}", event.id, e);
                continue;
            }
        };
        match pending.lock().await.get(&response.id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!("No pending request for response {}", response.id),
        }
    }
    debug!("Remote signer listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::error::{ClientError, Result};

    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn open(&self, url: &str) -> Result<Box<dyn Connection>> {
            Err(ClientError::Connection(format!("{} unreachable", url)))
        }
    }

    fn bunker() -> BunkerUrl {
        BunkerUrl::parse(
            "bunker://79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798?relay=wss://bunker.example.com",
        )
        .unwrap()
    }

    #[test]
    fn test_client_key_from_connect_as() {
        let mut secret = [0u8; 32];
        secret[31] = 1;
        let signer = BunkerSigner::new(
            bunker(),
            Some(secret),
            Arc::new(Unreachable),
            RelayConfig::default(),
            Duration::from_secs(1),
            CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(
            signer.client_pubkey(),
            "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
        );
    }

    #[tokio::test]
    async fn test_unreachable_bunker_is_connection_error() {
        let signer = BunkerSigner::new(
            bunker(),
            None,
            Arc::new(Unreachable),
            RelayConfig::default(),
            Duration::from_secs(1),
            CancellationToken::new(),
        )
        .unwrap();
        assert!(matches!(
            signer.public_key().await,
            Err(SignerError::Connection(_))
        ));
    }
}
