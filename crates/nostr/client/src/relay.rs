//! Single relay connection management
//!
//! Each connected relay is owned by one actor task. The task holds the
//! [`Connection`], the relay's [`AuthHandler`] and the open subscriptions; everything
//! else talks to it through a [`RelayHandle`]. Subscription traffic flows back to the
//! subscriber as [`RelayUpdate`]s on the channel given at subscribe time.

use crate::auth::{AuthAction, AuthHandler, AuthState};
use crate::connection::Connection;
use crate::error::{ClientError, Result};
use crate::filter::Filter;
use crate::message::{ClientMessage, RelayMessage};
use crate::signer::{Signer, SignerError};
use nostr::{Event, is_auth_required_error};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Relay connection configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// How long to wait for a challenge before the first request in pre-auth mode
    pub pre_auth_wait: Duration,
    /// How long the relay has to answer an AUTH event with OK, or to send a
    /// challenge after rejecting a request with `auth-required`
    pub auth_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            pre_auth_wait: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(10),
        }
    }
}

/// What happened to a subscription on one relay.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionUpdate {
    /// A matching event.
    Event(Event),
    /// End of stored events.
    Eose,
    /// The relay closed the subscription.
    Closed(String),
    /// The subscription needed authentication that was refused.
    Refused(String),
    /// The connection is gone.
    Dropped(String),
}

impl SubscriptionUpdate {
    /// Whether this relay is done with the subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionUpdate::Closed(_) | SubscriptionUpdate::Refused(_) | SubscriptionUpdate::Dropped(_)
        )
    }
}

/// A subscription update tagged with the relay it came from.
#[derive(Debug, Clone)]
pub struct RelayUpdate {
    pub relay_url: String,
    pub update: SubscriptionUpdate,
}

pub type UpdateSender = mpsc::UnboundedSender<RelayUpdate>;

enum RelayCommand {
    Subscribe {
        subscription_id: String,
        filter: Filter,
        updates: UpdateSender,
    },
    Unsubscribe {
        subscription_id: String,
    },
    Publish {
        event: Event,
    },
    Shutdown,
}

/// Cheap handle to a relay actor.
#[derive(Clone)]
pub struct RelayHandle {
    url: String,
    commands: mpsc::UnboundedSender<RelayCommand>,
    auth_state: watch::Receiver<AuthState>,
}

impl RelayHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send `["REQ", subscription_id, filter]`; updates arrive on `updates`.
    pub fn subscribe(&self, subscription_id: &str, filter: Filter, updates: UpdateSender) -> Result<()> {
        self.send(RelayCommand::Subscribe {
            subscription_id: subscription_id.to_string(),
            filter,
            updates,
        })
    }

    /// Send `["CLOSE", subscription_id]` if the relay still holds it.
    pub fn unsubscribe(&self, subscription_id: &str) {
        let _ = self.send(RelayCommand::Unsubscribe {
            subscription_id: subscription_id.to_string(),
        });
    }

    /// Send `["EVENT", event]`.
    pub fn publish(&self, event: Event) -> Result<()> {
        self.send(RelayCommand::Publish { event })
    }

    /// Ask the actor to close the connection.
    pub fn shutdown(&self) {
        let _ = self.send(RelayCommand::Shutdown);
    }

    pub fn auth_state(&self) -> AuthState {
        *self.auth_state.borrow()
    }

    /// Wait until the auth state satisfies `predicate`. `None` if the actor is gone.
    pub async fn wait_for_auth_state(&self, predicate: impl FnMut(&AuthState) -> bool) -> Option<AuthState> {
        let mut rx = self.auth_state.clone();
        let state = rx.wait_for(predicate).await.ok().map(|s| *s);
        state
    }

    fn send(&self, command: RelayCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::ConnectionDropped(self.url.clone()))
    }
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("url", &self.url)
            .field("auth_state", &self.auth_state())
            .finish()
    }
}

/// Start the actor for an open connection.
pub fn spawn_relay(
    url: String,
    connection: Box<dyn Connection>,
    auth: AuthHandler,
    signer: Option<Arc<dyn Signer>>,
    config: &RelayConfig,
    cancel: CancellationToken,
) -> (RelayHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (signed_tx, signed_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(auth.state());

    let actor = RelayActor {
        url: url.clone(),
        connection,
        auth,
        signer,
        auth_timeout: config.auth_timeout,
        auth_deadline: None,
        subscriptions: HashMap::new(),
        state_tx,
        signed_tx,
    };
    let task = tokio::spawn(actor.run(commands_rx, signed_rx, cancel));

    let handle = RelayHandle {
        url,
        commands: commands_tx,
        auth_state: state_rx,
    };
    (handle, task)
}

struct ActiveSubscription {
    filter: Filter,
    updates: UpdateSender,
}

struct RelayActor {
    url: String,
    connection: Box<dyn Connection>,
    auth: AuthHandler,
    signer: Option<Arc<dyn Signer>>,
    auth_timeout: Duration,
    auth_deadline: Option<Instant>,
    subscriptions: HashMap<String, ActiveSubscription>,
    state_tx: watch::Sender<AuthState>,
    signed_tx: mpsc::UnboundedSender<std::result::Result<Event, SignerError>>,
}

impl RelayActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RelayCommand>,
        mut signed: mpsc::UnboundedReceiver<std::result::Result<Event, SignerError>>,
        cancel: CancellationToken,
    ) {
        loop {
            let deadline = self.auth_deadline;
            let step = tokio::select! {
                _ = cancel.cancelled() => {
                    self.shutdown().await;
                    break;
                }
                command = commands.recv() => match command {
                    Some(RelayCommand::Shutdown) | None => {
                        self.shutdown().await;
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },
                frame = self.connection.recv() => match frame {
                    Some(Ok(text)) => self.handle_frame(&text).await,
                    Some(Err(e)) => Err(e),
                    None => Err(ClientError::ConnectionDropped("connection closed".to_string())),
                },
                Some(result) = signed.recv() => {
                    let action = self.auth.on_signed(result);
                    self.apply(action).await
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let action = self.auth.on_timeout();
                    self.apply(action).await
                }
            };

            match self.auth.state() {
                AuthState::Signing => {}
                AuthState::NoAuth if self.auth.awaiting_challenge() => {
                    if self.auth_deadline.is_none() {
                        self.auth_deadline = Some(Instant::now() + self.auth_timeout);
                    }
                }
                _ => self.auth_deadline = None,
            }
            self.state_tx.send_replace(self.auth.state());

            if let Err(e) = step {
                warn!("Lost connection to {}: {}", self.url, e);
                self.drop_all(&e.to_string());
                break;
            }
        }
        debug!("Relay actor for {} stopped", self.url);
    }

    async fn handle_command(&mut self, command: RelayCommand) -> Result<()> {
        match command {
            RelayCommand::Subscribe {
                subscription_id,
                filter,
                updates,
            } => {
                let message = ClientMessage::req(subscription_id.as_str(), filter.clone());
                self.subscriptions
                    .insert(subscription_id, ActiveSubscription { filter, updates });
                self.send(&message).await
            }
            RelayCommand::Unsubscribe { subscription_id } => {
                if self.subscriptions.remove(&subscription_id).is_some() {
                    self.auth.forget(&subscription_id);
                    self.send(&ClientMessage::close(subscription_id)).await
                } else {
                    Ok(())
                }
            }
            RelayCommand::Publish { event } => self.send(&ClientMessage::Event(event)).await,
            RelayCommand::Shutdown => Ok(()),
        }
    }

    async fn handle_frame(&mut self, text: &str) -> Result<()> {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring unparseable message from {}: {}", self.url, e);
                return Ok(());
            }
        };

        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                self.forward(&subscription_id, SubscriptionUpdate::Event(event)).await
            }
            RelayMessage::Eose { subscription_id } => {
                self.forward(&subscription_id, SubscriptionUpdate::Eose).await
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                if !self.subscriptions.contains_key(&subscription_id) {
                    return Ok(());
                }
                if is_auth_required_error(&message) {
                    info!("{} requires auth for {}: {}", self.url, subscription_id, message);
                    let action = self.auth.on_auth_required(&subscription_id);
                    self.apply(action).await
                } else {
                    info!("Subscription {} closed by {}: {}", subscription_id, self.url, message);
                    self.finish(&subscription_id, SubscriptionUpdate::Closed(message));
                    Ok(())
                }
            }
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                debug!("OK from {} for {}: {} {}", self.url, event_id, success, message);
                let action = self.auth.on_ok(&event_id, success, &message);
                self.apply(action).await
            }
            RelayMessage::Notice { message } => {
                info!("NOTICE from {}: {}", self.url, message);
                Ok(())
            }
            RelayMessage::Auth { challenge } => {
                let action = self.auth.on_challenge(&challenge);
                self.apply(action).await
            }
            RelayMessage::Count {
                subscription_id,
                count,
            } => {
                debug!("COUNT from {} for {}: {}", self.url, subscription_id, count);
                Ok(())
            }
        }
    }

    async fn apply(&mut self, action: AuthAction) -> Result<()> {
        match action {
            AuthAction::None => Ok(()),
            AuthAction::Sign(template) => {
                // The OK deadline starts once the signed event is sent.
                self.auth_deadline = None;
                let tx = self.signed_tx.clone();
                match self.signer.clone() {
                    Some(signer) => {
                        tokio::spawn(async move {
                            let _ = tx.send(signer.sign_event(template).await);
                        });
                    }
                    None => {
                        let _ = tx.send(Err(SignerError::Unavailable));
                    }
                }
                Ok(())
            }
            AuthAction::Send(event) => {
                self.auth_deadline = Some(Instant::now() + self.auth_timeout);
                self.send(&ClientMessage::Auth(event)).await
            }
            AuthAction::Resend(ids) => {
                for id in ids {
                    let message = match self.subscriptions.get(&id) {
                        Some(sub) => ClientMessage::req(id.as_str(), sub.filter.clone()),
                        None => continue,
                    };
                    info!("Re-sending {} to {} after auth", id, self.url);
                    self.send(&message).await?;
                }
                Ok(())
            }
            AuthAction::Refuse { ids, reason } => {
                for id in ids {
                    warn!("{} refused {}: {}", self.url, id, reason);
                    self.finish(&id, SubscriptionUpdate::Refused(reason.clone()));
                }
                Ok(())
            }
        }
    }

    async fn forward(&mut self, subscription_id: &str, update: SubscriptionUpdate) -> Result<()> {
        let Some(sub) = self.subscriptions.get(subscription_id) else {
            return Ok(());
        };
        let delivered = sub
            .updates
            .send(RelayUpdate {
                relay_url: self.url.clone(),
                update,
            })
            .is_ok();
        if delivered {
            return Ok(());
        }

        debug!("Subscription {} receiver gone, closing", subscription_id);
        self.subscriptions.remove(subscription_id);
        self.auth.forget(subscription_id);
        self.send(&ClientMessage::close(subscription_id)).await
    }

    fn finish(&mut self, subscription_id: &str, update: SubscriptionUpdate) {
        self.auth.forget(subscription_id);
        if let Some(sub) = self.subscriptions.remove(subscription_id) {
            let _ = sub.updates.send(RelayUpdate {
                relay_url: self.url.clone(),
                update,
            });
        }
    }

    fn drop_all(&mut self, reason: &str) {
        for (_, sub) in self.subscriptions.drain() {
            let _ = sub.updates.send(RelayUpdate {
                relay_url: self.url.clone(),
                update: SubscriptionUpdate::Dropped(reason.to_string()),
            });
        }
    }

    async fn shutdown(&mut self) {
        let ids: Vec<String> = self.subscriptions.keys().cloned().collect();
        for id in ids {
            let _ = self.send(&ClientMessage::close(id)).await;
        }
        self.drop_all("relay closed");
        if let Err(e) = self.connection.close().await {
            debug!("Error closing {}: {}", self.url, e);
        }
        info!("Disconnected from relay: {}", self.url);
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let text = message.to_json()?;
        self.connection.send(text).await
    }
}
