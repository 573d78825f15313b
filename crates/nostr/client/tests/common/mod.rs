//! In-memory relays for driving the client without a network.

#![allow(dead_code)]

use async_trait::async_trait;
use nostr::{Event, EventTemplate, finalize_event};
use nostr_client::{ClientError, Connection, Connector, Result};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::mpsc;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

pub const SECRET_ONE: [u8; 32] = {
    let mut key = [0u8; 32];
    key[31] = 1;
    key
};

pub fn note(created_at: u64, content: &str) -> Event {
    let template = EventTemplate {
        created_at,
        kind: 1,
        tags: Vec::new(),
        content: content.to_string(),
    };
    finalize_event(&template, &SECRET_ONE).unwrap()
}

/// A frame the mock relay sends back.
pub enum Reply {
    Frame(String),
    Delayed(Duration, String),
    /// Close the connection.
    Drop,
}

pub type Script = Arc<dyn Fn(&Value) -> Vec<Reply> + Send + Sync>;

#[derive(Clone)]
pub struct MockRelay {
    pub greeting: Vec<String>,
    pub script: Script,
    pub received: Arc<Mutex<Vec<Value>>>,
}

impl MockRelay {
    pub fn new(script: Script) -> Self {
        Self {
            greeting: Vec::new(),
            script,
            received: Arc::default(),
        }
    }

    pub fn with_challenge(mut self, challenge: &str) -> Self {
        self.greeting.push(json!(["AUTH", challenge]).to_string());
        self
    }

    /// Every frame the client sent, in order.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// Frames of type `kind` ("REQ", "AUTH", "CLOSE", ...) the client sent.
    pub fn received_of(&self, kind: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|frame| frame[0] == kind)
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct MockConnector {
    relays: HashMap<String, MockRelay>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relay(mut self, url: &str, relay: MockRelay) -> Self {
        self.relays.insert(url.to_string(), relay);
        self
    }
}

const DROP_SENTINEL: &str = "\u{0}drop";

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn Connection>> {
        let relay = self
            .relays
            .get(url)
            .cloned()
            .ok_or_else(|| ClientError::Connection(format!("{} unreachable", url)))?;
        let (tx, rx) = mpsc::unbounded_channel();
        for frame in &relay.greeting {
            let _ = tx.send(frame.clone());
        }
        Ok(Box::new(MockConnection { relay, tx, rx }))
    }
}

struct MockConnection {
    relay: MockRelay,
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, text: String) -> Result<()> {
        let frame: Value = serde_json::from_str(&text)?;
        self.relay.received.lock().unwrap().push(frame.clone());
        for reply in (self.relay.script)(&frame) {
            match reply {
                Reply::Frame(text) => {
                    let _ = self.tx.send(text);
                }
                Reply::Delayed(delay, text) => {
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(text);
                    });
                }
                Reply::Drop => {
                    let _ = self.tx.send(DROP_SENTINEL.to_string());
                }
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        match self.rx.recv().await {
            Some(text) if text == DROP_SENTINEL => None,
            Some(text) => Some(Ok(text)),
            None => None,
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn event_frame(subscription_id: &Value, event: &Event) -> String {
    json!(["EVENT", subscription_id, event]).to_string()
}

pub fn eose_frame(subscription_id: &Value) -> String {
    json!(["EOSE", subscription_id]).to_string()
}

pub fn closed_frame(subscription_id: &Value, message: &str) -> String {
    json!(["CLOSED", subscription_id, message]).to_string()
}

pub fn ok_frame(event_id: &Value, accepted: bool) -> String {
    json!(["OK", event_id, accepted, ""]).to_string()
}

/// A relay holding `events`, answering each REQ with at most `page` matching events
/// (newest first, honoring `since`/`until`) followed by EOSE.
pub fn store_script(events: Vec<Event>, page: usize) -> Script {
    Arc::new(move |frame: &Value| {
        if frame[0] != "REQ" {
            return Vec::new();
        }
        let sub = &frame[1];
        let filter = &frame[2];
        let since = filter["since"].as_u64();
        let until = filter["until"].as_u64();

        let mut matching: Vec<&Event> = events
            .iter()
            .filter(|e| since.is_none_or(|s| e.created_at >= s))
            .filter(|e| until.is_none_or(|u| e.created_at <= u))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut replies: Vec<Reply> = matching
            .into_iter()
            .take(page)
            .map(|e| Reply::Frame(event_frame(sub, e)))
            .collect();
        replies.push(Reply::Frame(eose_frame(sub)));
        replies
    })
}

/// Accepts every AUTH event.
pub fn accept_auth(frame: &Value) -> Option<Reply> {
    (frame[0] == "AUTH").then(|| Reply::Frame(ok_frame(&frame[1]["id"], true)))
}
