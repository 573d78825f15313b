//! Relay pool for querying multiple Nostr relays at once.
//!
//! The pool connects to every requested relay concurrently, optionally authenticates
//! before any request (forced pre-auth), and fans subscriptions out to all connected
//! relays, merging what comes back into one [`EventStream`].

use crate::auth::{AuthHandler, AuthPolicy, AuthState};
use crate::connection::Connector;
use crate::error::{ClientError, Result};
use crate::filter::Filter;
use crate::paginate::PaginationController;
use crate::relay::{RelayConfig, RelayHandle, spawn_relay};
use crate::signer::Signer;
use crate::subscription::{DeliveryMode, EventStream, RoundEnd, SeenEvents, drive_round, open_round};
use futures::FutureExt;
use futures::future::join_all;
use indexmap::IndexSet;
use nostr::{Event, normalize_relay_url};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long [`RelayPool::close`] waits for relay actors to finish.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A pool of connected Nostr relays.
pub struct RelayPool {
    relays: Vec<RelayHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayPool {
    /// Connect to all `addresses` concurrently.
    ///
    /// Addresses are normalized (`wss://` is assumed when no scheme is given) and
    /// de-duplicated. Relays that cannot be reached within the connect timeout, or
    /// that refuse forced pre-auth, are left out. Returns the pool together with the
    /// addresses that ended up connected, in request order.
    pub async fn connect(
        addresses: &[String],
        connector: Arc<dyn Connector>,
        policy: AuthPolicy,
        signer: Option<Arc<dyn Signer>>,
        config: RelayConfig,
        cancel: &CancellationToken,
    ) -> Result<(Self, Vec<String>)> {
        let urls = normalize_addresses(addresses);
        debug!("Connecting to {} relays", urls.len());

        let attempts = urls.into_iter().map(|url| {
            let label = url.clone();
            connect_relay(
                url,
                connector.clone(),
                policy,
                signer.clone(),
                &config,
                cancel,
            )
            .map(move |attempt| {
                attempt
                    .inspect_err(|e| warn!("Skipping relay {}: {}", label, e))
                    .ok()
            })
        });
        let (relays, tasks): (Vec<_>, Vec<_>) = join_all(attempts).await.into_iter().flatten().unzip();

        if relays.is_empty() {
            error!("Failed to connect to any of the given relays");
            return Err(ClientError::NoRelaysConnected);
        }

        let pool = Self { relays, tasks };
        let connected = pool.relay_urls();
        info!("Connected to {} relays", connected.len());
        Ok((pool, connected))
    }

    /// Get all relay URLs in the pool.
    pub fn relay_urls(&self) -> Vec<String> {
        self.relays.iter().map(|r| r.url().to_string()).collect()
    }

    pub fn relays(&self) -> &[RelayHandle] {
        &self.relays
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Open a subscription on every relay.
    ///
    /// Events are deduplicated by id across relays. The stream ends according to
    /// `mode`, when `cancel` fires, or when the stream is dropped.
    pub fn subscribe(&self, filter: Filter, mode: DeliveryMode, cancel: CancellationToken) -> EventStream {
        let relays = self.relays.clone();
        let (out, stream) = EventStream::channel();

        match mode {
            DeliveryMode::Eose | DeliveryMode::Stream => {
                let end = if mode == DeliveryMode::Stream {
                    RoundEnd::AllClosed
                } else {
                    RoundEnd::AllEose
                };
                // REQs are queued now so later publishes on this pool follow them.
                let round = open_round(&relays, filter);
                tokio::spawn(async move {
                    // `limit` is applied per relay by the relays themselves.
                    let mut seen = SeenEvents::new();
                    let outcome = drive_round(&relays, round, end, None, &mut seen, &out, &cancel).await;
                    debug!("Subscription delivered {} of {} events", outcome.yielded, outcome.received);
                });
            }
            DeliveryMode::Paginate(config) => {
                tokio::spawn(async move {
                    PaginationController::new(filter, config)
                        .run(&relays, &out, &cancel)
                        .await;
                });
            }
        }

        stream
    }

    /// Publish an event to every relay. Returns how many relays it was handed to.
    pub fn publish(&self, event: &Event) -> usize {
        self.relays
            .iter()
            .filter(|relay| match relay.publish(event.clone()) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to publish {} to {}: {}", event.id, relay.url(), e);
                    false
                }
            })
            .count()
    }

    /// Close every relay connection and wait for the actors to stop.
    pub async fn close(mut self) {
        for relay in &self.relays {
            relay.shutdown();
        }
        if timeout(CLOSE_TIMEOUT, join_all(self.tasks.iter_mut())).await.is_err() {
            warn!("Relay connections did not close within {:?}", CLOSE_TIMEOUT);
        }
        self.tasks.clear();
    }
}

impl Drop for RelayPool {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("relays", &self.relays)
            .finish()
    }
}

/// Normalize and de-duplicate relay addresses, skipping invalid ones.
pub fn normalize_addresses(addresses: &[String]) -> Vec<String> {
    let mut urls = IndexSet::new();
    for address in addresses {
        match normalize_relay_url(address) {
            Ok(url) => {
                urls.insert(url);
            }
            Err(e) => warn!("Skipping relay: {}", e),
        }
    }
    urls.into_iter().collect()
}

async fn connect_relay(
    url: String,
    connector: Arc<dyn Connector>,
    policy: AuthPolicy,
    signer: Option<Arc<dyn Signer>>,
    config: &RelayConfig,
    cancel: &CancellationToken,
) -> Result<(RelayHandle, JoinHandle<()>)> {
    let connection = timeout(config.connect_timeout, connector.open(&url))
        .await
        .map_err(|_| {
            ClientError::Timeout(format!(
                "connecting to {} took longer than {:?}",
                url, config.connect_timeout
            ))
        })??;

    let auth = AuthHandler::new(url.clone(), policy);
    let (handle, task) = spawn_relay(url, connection, auth, signer, config, cancel.child_token());

    if policy == AuthPolicy::Proactive {
        if let Err(e) = pre_authenticate(&handle, config).await {
            handle.shutdown();
            let _ = task.await;
            return Err(e);
        }
    }
    Ok((handle, task))
}

/// Wait for a challenge and the outcome of answering it.
///
/// A relay that sends no challenge within `pre_auth_wait` is kept as is.
async fn pre_authenticate(handle: &RelayHandle, config: &RelayConfig) -> Result<()> {
    let challenged = timeout(
        config.pre_auth_wait,
        handle.wait_for_auth_state(|s| *s != AuthState::NoAuth),
    )
    .await;
    match challenged {
        Err(_) => {
            info!("{} sent no auth challenge, continuing unauthenticated", handle.url());
            return Ok(());
        }
        Ok(None) => return Err(ClientError::ConnectionDropped(handle.url().to_string())),
        Ok(Some(_)) => {}
    }

    match handle
        .wait_for_auth_state(|s| matches!(s, AuthState::Authed | AuthState::Refused))
        .await
    {
        Some(AuthState::Authed) => Ok(()),
        Some(_) => Err(ClientError::AuthRefused {
            relay: handle.url().to_string(),
            reason: "pre-auth failed".to_string(),
        }),
        None => Err(ClientError::ConnectionDropped(handle.url().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::signer::LocalSigner;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    /// Never finishes opening.
    struct Hanging;

    #[async_trait]
    impl Connector for Hanging {
        async fn open(&self, _url: &str) -> Result<Box<dyn Connection>> {
            std::future::pending().await
        }
    }

    /// Sends a challenge on connect and rejects every AUTH event.
    struct RejectsAuth;

    struct RejectsAuthConnection {
        tx: mpsc::UnboundedSender<String>,
        rx: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl Connector for RejectsAuth {
        async fn open(&self, _url: &str) -> Result<Box<dyn Connection>> {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(json!(["AUTH", "challenge"]).to_string());
            Ok(Box::new(RejectsAuthConnection { tx, rx }))
        }
    }

    #[async_trait]
    impl Connection for RejectsAuthConnection {
        async fn send(&mut self, text: String) -> Result<()> {
            let frame: Value = serde_json::from_str(&text)?;
            if frame[0] == "AUTH" {
                let _ = self
                    .tx
                    .send(json!(["OK", frame[1]["id"], false, "restricted: members only"]).to_string());
            }
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            self.rx.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_reported() {
        let result = connect_relay(
            "wss://slow.example.com".to_string(),
            Arc::new(Hanging),
            AuthPolicy::Disabled,
            None,
            &RelayConfig::default(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_refused_pre_auth_is_reported() {
        let secret = {
            let mut key = [0u8; 32];
            key[31] = 1;
            key
        };
        let signer: Arc<dyn Signer> = Arc::new(LocalSigner::new(secret).unwrap());
        let result = connect_relay(
            "wss://members.example.com".to_string(),
            Arc::new(RejectsAuth),
            AuthPolicy::Proactive,
            Some(signer),
            &RelayConfig::default(),
            &CancellationToken::new(),
        )
        .await;
        match result {
            Err(ClientError::AuthRefused { relay, .. }) => {
                assert_eq!(relay, "wss://members.example.com")
            }
            other => panic!("expected AuthRefused, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_normalize_addresses_dedups_and_skips_invalid() {
        let addresses = vec![
            "relay.example.com".to_string(),
            "wss://relay.example.com/".to_string(),
            "ftp://nope.example.com".to_string(),
            "ws://localhost:7777".to_string(),
        ];
        assert_eq!(
            normalize_addresses(&addresses),
            vec!["wss://relay.example.com", "ws://localhost:7777"]
        );
    }
}
