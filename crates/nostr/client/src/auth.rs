//! NIP-42 authentication state machine.
//!
//! One [`AuthHandler`] lives inside each relay actor. The actor feeds it the relay's
//! `AUTH` challenges, `auth-required:` rejections, signing results and `OK` answers;
//! every call returns the [`AuthAction`] the actor must carry out.
//!
//! ```text
//! NoAuth -> ChallengeReceived -> Signing -> Authed
//!                  ^                     \-> Refused
//!                  +--- new challenge ------/ (from Authed)
//! ```

use crate::signer::SignerError;
use nostr::{Event, EventTemplate, create_auth_event_template};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Whether and when the client authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthPolicy {
    /// Never sign; requests rejected with `auth-required` fail permanently.
    #[default]
    Disabled,
    /// Sign once a request is rejected with `auth-required`, then retry it once.
    Reactive,
    /// Sign as soon as the relay sends a challenge, before any request.
    Proactive,
}

impl AuthPolicy {
    pub fn from_flags(auth: bool, force_pre_auth: bool) -> Self {
        if force_pre_auth {
            AuthPolicy::Proactive
        } else if auth {
            AuthPolicy::Reactive
        } else {
            AuthPolicy::Disabled
        }
    }
}

/// Authentication state of one relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    NoAuth,
    ChallengeReceived,
    Signing,
    Authed,
    Refused,
}

/// What the relay actor must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthAction {
    None,
    /// Sign this template with the configured signer.
    Sign(EventTemplate),
    /// Send `["AUTH", event]` on the connection.
    Send(Event),
    /// Re-send these subscriptions, once.
    Resend(Vec<String>),
    /// Fail these subscriptions permanently.
    Refuse { ids: Vec<String>, reason: String },
}

#[derive(Debug)]
pub struct AuthHandler {
    relay_url: String,
    policy: AuthPolicy,
    state: AuthState,
    challenge: Option<String>,
    auth_event_id: Option<String>,
    /// Subscriptions rejected with `auth-required`, waiting for the outcome.
    pending: Vec<String>,
    /// Subscriptions already re-sent after authenticating.
    retried: HashSet<String>,
}

impl AuthHandler {
    pub fn new(relay_url: impl Into<String>, policy: AuthPolicy) -> Self {
        Self {
            relay_url: relay_url.into(),
            policy,
            state: AuthState::NoAuth,
            challenge: None,
            auth_event_id: None,
            pending: Vec::new(),
            retried: HashSet::new(),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn policy(&self) -> AuthPolicy {
        self.policy
    }

    pub fn challenge(&self) -> Option<&str> {
        self.challenge.as_deref()
    }

    /// Requests were rejected with `auth-required` but the relay has not sent a
    /// challenge yet.
    pub fn awaiting_challenge(&self) -> bool {
        self.state == AuthState::NoAuth && !self.pending.is_empty()
    }

    /// The relay sent `["AUTH", token]`.
    pub fn on_challenge(&mut self, token: &str) -> AuthAction {
        debug!(relay = %self.relay_url, "auth challenge received");
        let fresh = self.challenge.as_deref() != Some(token);
        self.challenge = Some(token.to_string());

        match self.state {
            AuthState::Authed if fresh => {
                // The previous auth event no longer covers new requests.
                info!(relay = %self.relay_url, "new challenge after authenticating");
                self.state = AuthState::ChallengeReceived;
                self.auth_event_id = None;
                if self.policy == AuthPolicy::Proactive {
                    self.begin_signing()
                } else {
                    AuthAction::None
                }
            }
            AuthState::NoAuth | AuthState::ChallengeReceived => {
                self.state = AuthState::ChallengeReceived;
                let wanted = self.policy == AuthPolicy::Proactive
                    || (self.policy == AuthPolicy::Reactive && !self.pending.is_empty());
                if wanted {
                    self.begin_signing()
                } else {
                    AuthAction::None
                }
            }
            AuthState::Signing | AuthState::Authed | AuthState::Refused => AuthAction::None,
        }
    }

    /// The relay closed `subscription_id` with an `auth-required:` message.
    pub fn on_auth_required(&mut self, subscription_id: &str) -> AuthAction {
        if self.policy == AuthPolicy::Disabled {
            self.state = AuthState::Refused;
            return refuse(subscription_id, "authentication not enabled");
        }
        if self.retried.contains(subscription_id) {
            self.state = AuthState::Refused;
            warn!(relay = %self.relay_url, subscription = subscription_id, "auth-required again after authenticating");
            return refuse(subscription_id, "auth-required after authenticating");
        }

        match self.state {
            AuthState::Refused => refuse(subscription_id, "authentication refused"),
            AuthState::Authed => {
                self.retried.insert(subscription_id.to_string());
                AuthAction::Resend(vec![subscription_id.to_string()])
            }
            AuthState::Signing => {
                self.queue(subscription_id);
                AuthAction::None
            }
            AuthState::ChallengeReceived => {
                self.queue(subscription_id);
                self.begin_signing()
            }
            AuthState::NoAuth => {
                debug!(relay = %self.relay_url, "auth-required before any challenge, waiting for one");
                self.queue(subscription_id);
                AuthAction::None
            }
        }
    }

    /// The signer finished.
    pub fn on_signed(&mut self, result: Result<Event, SignerError>) -> AuthAction {
        if self.state != AuthState::Signing {
            return AuthAction::None;
        }
        match result {
            Ok(event) => {
                info!(relay = %self.relay_url, "performing auth as {}", event.pubkey);
                self.auth_event_id = Some(event.id.clone());
                AuthAction::Send(event)
            }
            Err(e) => self.refuse_all(format!("signing failed: {}", e)),
        }
    }

    /// The relay answered `["OK", event_id, accepted, message]`.
    pub fn on_ok(&mut self, event_id: &str, accepted: bool, message: &str) -> AuthAction {
        if self.state != AuthState::Signing || self.auth_event_id.as_deref() != Some(event_id) {
            return AuthAction::None;
        }
        if accepted {
            info!(relay = %self.relay_url, "authenticated");
            self.state = AuthState::Authed;
            let ids = std::mem::take(&mut self.pending);
            self.retried.extend(ids.iter().cloned());
            if ids.is_empty() {
                AuthAction::None
            } else {
                AuthAction::Resend(ids)
            }
        } else {
            self.refuse_all(format!("auth rejected: {}", message))
        }
    }

    /// The auth deadline passed: either no `OK` arrived for the auth event, or no
    /// challenge arrived for requests rejected with `auth-required`.
    pub fn on_timeout(&mut self) -> AuthAction {
        match self.state {
            AuthState::Signing => self.refuse_all("auth timed out".to_string()),
            AuthState::NoAuth if !self.pending.is_empty() => {
                warn!(relay = %self.relay_url, "auth-required but no challenge arrived");
                AuthAction::Refuse {
                    ids: std::mem::take(&mut self.pending),
                    reason: "auth-required without a challenge".to_string(),
                }
            }
            _ => AuthAction::None,
        }
    }

    /// Forget a subscription that is no longer open.
    pub fn forget(&mut self, subscription_id: &str) {
        self.pending.retain(|id| id != subscription_id);
        self.retried.remove(subscription_id);
    }

    fn queue(&mut self, subscription_id: &str) {
        if !self.pending.iter().any(|id| id == subscription_id) {
            self.pending.push(subscription_id.to_string());
        }
    }

    fn begin_signing(&mut self) -> AuthAction {
        let Some(challenge) = self.challenge.clone() else {
            return AuthAction::None;
        };
        self.state = AuthState::Signing;
        AuthAction::Sign(create_auth_event_template(
            &self.relay_url,
            &challenge,
            nostr::now(),
        ))
    }

    fn refuse_all(&mut self, reason: String) -> AuthAction {
        warn!(relay = %self.relay_url, "auth refused: {}", reason);
        self.state = AuthState::Refused;
        AuthAction::Refuse {
            ids: std::mem::take(&mut self.pending),
            reason,
        }
    }
}

fn refuse(subscription_id: &str, reason: &str) -> AuthAction {
    AuthAction::Refuse {
        ids: vec![subscription_id.to_string()],
        reason: reason.to_string(),
    }
}
