//! NIP-46 remote signing against an in-memory bunker.

mod common;

use common::*;
use futures::StreamExt;
use nostr::{
    BunkerUrl, Event, EventTemplate, KIND_NOSTR_CONNECT, NostrConnectRequest, NostrConnectResponse,
    decrypt_v2, encrypt_v2, finalize_event, get_public_key_hex, now, verify_event,
};
use nostr_client::{
    AuthPolicy, AuthState, BunkerSigner, DeliveryMode, Filter, RelayConfig, RelayPool, Signer,
    SignerError,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BUNKER_RELAY: &str = "wss://bunker.example.com";
const PROTECTED_RELAY: &str = "wss://members.example.com";

fn secret(n: u8) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[31] = n;
    key
}

fn bunker_secret() -> [u8; 32] {
    secret(2)
}

fn user_secret() -> [u8; 32] {
    secret(3)
}

fn client_secret() -> [u8; 32] {
    secret(4)
}

/// A remote signer holding the user key. Every request it decrypts is logged;
/// `sign_event` answers are preceded by a response for another request and by an
/// `auth_url` prompt. With `tamper` set it signs a different event than asked.
#[derive(Clone)]
struct Bunker {
    relay: MockRelay,
    requests: Arc<Mutex<Vec<NostrConnectRequest>>>,
}

impl Bunker {
    fn new(tamper: bool) -> Self {
        let requests: Arc<Mutex<Vec<NostrConnectRequest>>> = Arc::default();
        let subscription: Arc<Mutex<Option<Value>>> = Arc::default();
        let log = requests.clone();

        let relay = MockRelay::new(Arc::new(move |frame: &Value| {
            if frame[0] == "REQ" {
                *subscription.lock().unwrap() = Some(frame[1].clone());
                return vec![Reply::Frame(eose_frame(&frame[1]))];
            }
            if frame[0] != "EVENT" {
                return Vec::new();
            }
            let Some(sub) = subscription.lock().unwrap().clone() else {
                return Vec::new();
            };

            let incoming: Event = serde_json::from_value(frame[1].clone()).unwrap();
            assert_eq!(incoming.kind, KIND_NOSTR_CONNECT);
            let client_pubkey = hex::decode(&incoming.pubkey).unwrap();
            let plaintext = decrypt_v2(&bunker_secret(), &client_pubkey, &incoming.content).unwrap();
            let request: NostrConnectRequest = serde_json::from_str(&plaintext).unwrap();
            log.lock().unwrap().push(request.clone());

            let respond = |id: &str, result: &str, error: Option<&str>| {
                let response = NostrConnectResponse {
                    id: id.to_string(),
                    result: Some(result.to_string()),
                    error: error.map(str::to_string),
                };
                let content = encrypt_v2(
                    &bunker_secret(),
                    &client_pubkey,
                    &serde_json::to_string(&response).unwrap(),
                )
                .unwrap();
                let template = EventTemplate {
                    created_at: now(),
                    kind: KIND_NOSTR_CONNECT,
                    tags: vec![vec!["p".to_string(), incoming.pubkey.clone()]],
                    content,
                };
                Reply::Frame(event_frame(&sub, &finalize_event(&template, &bunker_secret()).unwrap()))
            };

            match request.method.as_str() {
                "connect" => vec![respond(&request.id, "ack", None)],
                "get_public_key" => {
                    vec![respond(&request.id, &get_public_key_hex(&user_secret()).unwrap(), None)]
                }
                "sign_event" => {
                    let mut template: EventTemplate = serde_json::from_str(&request.params[0]).unwrap();
                    if tamper {
                        template.tags.push(vec!["t".to_string(), "extra".to_string()]);
                    }
                    let signed = finalize_event(&template, &user_secret()).unwrap();
                    vec![
                        respond("unrelated-request", "ignored", None),
                        respond(&request.id, "auth_url", Some("https://signer.example.com/approve")),
                        respond(&request.id, &serde_json::to_string(&signed).unwrap(), None),
                    ]
                }
                _ => Vec::new(),
            }
        }));

        Self { relay, requests }
    }

    fn methods(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.method.clone())
            .collect()
    }

    fn signer(&self, connector: MockConnector) -> BunkerSigner {
        let address = format!(
            "bunker://{}?relay={}&secret=s3cret",
            get_public_key_hex(&bunker_secret()).unwrap(),
            BUNKER_RELAY
        );
        BunkerSigner::new(
            BunkerUrl::parse(&address).unwrap(),
            Some(client_secret()),
            Arc::new(connector),
            RelayConfig::default(),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .unwrap()
    }
}

/// Serves one event once an AUTH event was accepted.
fn protected_relay() -> MockRelay {
    let authed = Arc::new(AtomicBool::new(false));
    MockRelay::new(Arc::new(move |frame: &Value| {
        if let Some(reply) = accept_auth(frame) {
            authed.store(true, Ordering::SeqCst);
            return vec![reply];
        }
        if frame[0] != "REQ" {
            return Vec::new();
        }
        if authed.load(Ordering::SeqCst) {
            vec![
                Reply::Frame(event_frame(&frame[1], &note(100, "members only"))),
                Reply::Frame(eose_frame(&frame[1])),
            ]
        } else {
            vec![Reply::Frame(closed_frame(&frame[1], "auth-required: members only"))]
        }
    }))
    .with_challenge("challenge-token")
}

#[tokio::test]
async fn test_bunker_signs_auth_for_protected_relay() {
    init_tracing();
    let bunker = Bunker::new(false);
    let relay = protected_relay();
    let connector = MockConnector::new()
        .with_relay(BUNKER_RELAY, bunker.relay.clone())
        .with_relay(PROTECTED_RELAY, relay.clone());
    let signer: Arc<dyn Signer> = Arc::new(bunker.signer(connector.clone()));

    let (pool, _) = RelayPool::connect(
        &[PROTECTED_RELAY.to_string()],
        Arc::new(connector),
        AuthPolicy::Reactive,
        Some(signer),
        RelayConfig::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let mut stream = pool.subscribe(Filter::new(), DeliveryMode::Eose, CancellationToken::new());
    assert_eq!(stream.next().await.unwrap().event.content, "members only");
    assert!(stream.next().await.is_none());
    assert_eq!(pool.relays()[0].auth_state(), AuthState::Authed);

    // The handshake carries the bunker pubkey and secret, then one signing request.
    assert_eq!(bunker.methods(), vec!["connect", "sign_event"]);
    let connect = bunker.requests.lock().unwrap()[0].clone();
    assert_eq!(connect.params[0], get_public_key_hex(&bunker_secret()).unwrap());
    assert_eq!(connect.params[1], "s3cret");

    // Requests to the bunker are addressed to it and subscribed to before sending.
    let sent: Vec<Value> = bunker.relay.received();
    assert_eq!(sent[0][0], "REQ");
    assert_eq!(sent[0][2]["#p"][0], get_public_key_hex(&client_secret()).unwrap());
    assert_eq!(sent[1][1]["tags"][0][1], get_public_key_hex(&bunker_secret()).unwrap());

    let auth: Event = serde_json::from_value(relay.received_of("AUTH")[0][1].clone()).unwrap();
    assert_eq!(auth.pubkey, get_public_key_hex(&user_secret()).unwrap());
    assert_eq!(auth.kind, 22242);
    assert!(verify_event(&auth).unwrap());
}

#[tokio::test]
async fn test_bunker_public_key_is_fetched_once() {
    init_tracing();
    let bunker = Bunker::new(false);
    let connector = MockConnector::new().with_relay(BUNKER_RELAY, bunker.relay.clone());
    let signer = bunker.signer(connector);

    let user = get_public_key_hex(&user_secret()).unwrap();
    assert_eq!(signer.public_key().await.unwrap(), user);
    assert_eq!(signer.public_key().await.unwrap(), user);
    assert_eq!(bunker.methods(), vec!["connect", "get_public_key"]);
}

#[tokio::test]
async fn test_bunker_event_not_matching_request_is_rejected() {
    init_tracing();
    let bunker = Bunker::new(true);
    let connector = MockConnector::new().with_relay(BUNKER_RELAY, bunker.relay.clone());
    let signer = bunker.signer(connector);

    let template = EventTemplate {
        created_at: 1,
        kind: 22242,
        tags: vec![vec!["challenge".to_string(), "c".to_string()]],
        content: String::new(),
    };
    let result = signer.sign_event(template).await;
    assert!(matches!(result, Err(SignerError::Remote(_))));
}
