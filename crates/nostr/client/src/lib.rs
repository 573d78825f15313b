//! Nostr relay client for the `nostr-req` query tool.
//!
//! This crate provides:
//! - Filter construction from JSON and command-line overrides
//! - Concurrent connections to many relays, one actor task per relay
//! - NIP-42 authentication as an explicit state machine
//! - Subscriptions that end on EOSE, stream live events, or paginate backwards
//! - NIP-46 remote signing
//!
//! # Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use nostr_client::{AuthPolicy, DeliveryMode, Filter, RelayConfig, RelayPool, WebSocketConnector};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), nostr_client::ClientError> {
//!     let cancel = CancellationToken::new();
//!     let (pool, connected) = RelayPool::connect(
//!         &["relay.damus.io".to_string(), "nos.lol".to_string()],
//!         Arc::new(WebSocketConnector::new()),
//!         AuthPolicy::Disabled,
//!         None,
//!         RelayConfig::default(),
//!         &cancel,
//!     )
//!     .await?;
//!     println!("Connected to {:?}", connected);
//!
//!     // Stored kind 1 notes, until every relay sent EOSE
//!     let filter = Filter::new().kinds(vec![1]).limit(10);
//!     let mut events = pool.subscribe(filter, DeliveryMode::Eose, cancel.clone());
//!     while let Some(item) = events.next().await {
//!         println!("{} from {}", item.event.id, item.relay_url);
//!     }
//!
//!     pool.close().await;
//!     Ok(())
//! }
//! ```

mod auth;
mod bunker;
mod connection;
mod error;
mod filter;
mod message;
mod paginate;
mod pool;
mod relay;
mod signer;
mod subscription;

// Re-export main types
pub use auth::{AuthAction, AuthHandler, AuthPolicy, AuthState};
pub use bunker::BunkerSigner;
pub use connection::{Connection, Connector, WebSocketConnector};
pub use error::{ClientError, Result};
pub use filter::{Filter, FilterBuilder, FilterError, FilterOverrides, parse_tag_flag};
pub use message::{ClientMessage, MessageError, RelayMessage};
pub use paginate::{PaginationConfig, PaginationController, PaginationState, StopReason};
pub use pool::{RelayPool, normalize_addresses};
pub use relay::{RelayConfig, RelayHandle, RelayUpdate, SubscriptionUpdate, UpdateSender, spawn_relay};
pub use signer::{LocalSigner, Signer, SignerError};
pub use subscription::{
    DeliveryMode, EventStream, RelayEvent, RoundEnd, RoundOutcome, SubscriptionTracker,
    generate_subscription_id,
};
