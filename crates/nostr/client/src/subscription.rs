//! Subscription management across relays.
//!
//! A subscription is opened on every connected relay under one id. The updates of all
//! relays are merged by a single task that tracks EOSE per relay, drops events whose id
//! was already delivered, and ends the subscription according to its [`DeliveryMode`].

use crate::filter::Filter;
use crate::paginate::PaginationConfig;
use crate::relay::{RelayHandle, RelayUpdate, SubscriptionUpdate};
use futures::Stream;
use indexmap::IndexSet;
use lru::LruCache;
use nostr::Event;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Events buffered between the merge task and the consumer.
const EVENT_BUFFER: usize = 256;

/// Event ids remembered per subscription for de-duplication.
const SEEN_CAPACITY: usize = 100_000;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// How a subscription delivers events and when it ends.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Stored events only: ends once every relay sent EOSE (or gave up).
    #[default]
    Eose,
    /// Stored and live events: ends on cancellation or when every relay is gone.
    Stream,
    /// Repeated EOSE rounds with a decreasing `until`.
    Paginate(PaginationConfig),
}

/// An event together with the relay that delivered it first.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEvent {
    pub relay_url: String,
    pub event: Event,
}

/// Lazily consumed stream of events for one subscription.
///
/// Dropping the stream ends the subscription and closes it on every relay.
pub struct EventStream {
    rx: mpsc::Receiver<RelayEvent>,
}

impl EventStream {
    pub(crate) fn channel() -> (mpsc::Sender<RelayEvent>, Self) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        (tx, Self { rx })
    }
}

impl Stream for EventStream {
    type Item = RelayEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

/// When one round of a subscription is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundEnd {
    /// Every relay sent EOSE or stopped.
    AllEose,
    /// Every relay stopped.
    AllClosed,
}

/// Tracks which relays have a specific subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionTracker {
    /// Subscription ID
    pub id: String,
    /// Filter for this subscription
    pub filter: Filter,
    /// Relays that have this subscription
    pub relays: IndexSet<String>,
    /// Relays that have sent EOSE
    pub eose_relays: HashSet<String>,
    /// Relays that closed, refused or dropped the subscription
    pub finished_relays: HashSet<String>,
}

impl SubscriptionTracker {
    /// Create a new subscription tracker.
    pub fn new(id: impl Into<String>, filter: Filter) -> Self {
        Self {
            id: id.into(),
            filter,
            relays: IndexSet::new(),
            eose_relays: HashSet::new(),
            finished_relays: HashSet::new(),
        }
    }

    /// Add a relay to this subscription.
    pub fn add_relay(&mut self, relay_url: impl Into<String>) {
        self.relays.insert(relay_url.into());
    }

    /// Mark EOSE received from a relay.
    pub fn mark_eose(&mut self, relay_url: impl Into<String>) {
        self.eose_relays.insert(relay_url.into());
    }

    /// Mark a relay as done with this subscription.
    pub fn mark_finished(&mut self, relay_url: impl Into<String>) {
        self.finished_relays.insert(relay_url.into());
    }

    /// Whether every relay sent EOSE or stopped.
    pub fn all_eose(&self) -> bool {
        self.relays
            .iter()
            .all(|r| self.eose_relays.contains(r) || self.finished_relays.contains(r))
    }

    /// Whether every relay stopped.
    pub fn all_finished(&self) -> bool {
        self.relays.iter().all(|r| self.finished_relays.contains(r))
    }

    pub fn is_done(&self, end: RoundEnd) -> bool {
        match end {
            RoundEnd::AllEose => self.all_eose(),
            RoundEnd::AllClosed => self.all_finished(),
        }
    }

    /// Relays that may still hold the subscription.
    pub fn open_relays(&self) -> impl Iterator<Item = &String> {
        self.relays.iter().filter(|r| !self.finished_relays.contains(*r))
    }
}

/// What one round delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundOutcome {
    /// Events received from all relays, duplicates included
    pub received: u64,
    /// Events forwarded to the consumer
    pub yielded: u64,
    /// Oldest `created_at` seen in the round
    pub oldest: Option<u64>,
    /// Oldest `created_at` seen per relay
    pub oldest_by_relay: HashMap<String, u64>,
    /// The consumer went away or the subscription was cancelled
    pub interrupted: bool,
}

impl RoundOutcome {
    fn record(&mut self, relay_url: &str, created_at: u64) {
        self.received += 1;
        self.oldest = Some(self.oldest.map_or(created_at, |o| o.min(created_at)));
        self.oldest_by_relay
            .entry(relay_url.to_string())
            .and_modify(|o| *o = (*o).min(created_at))
            .or_insert(created_at);
    }
}

/// Ids of events a subscription already delivered.
///
/// Holds at most `capacity` ids; the least recently seen are forgotten first.
pub(crate) struct SeenEvents {
    ids: LruCache<String, ()>,
}

impl SeenEvents {
    pub(crate) fn new() -> Self {
        Self::with_capacity(SEEN_CAPACITY)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// `true` the first time `id` is offered.
    pub(crate) fn insert(&mut self, id: &str) -> bool {
        if self.ids.get(id).is_some() {
            return false;
        }
        self.ids.put(id.to_string(), ());
        true
    }
}

/// A subscription whose REQ has been handed to every relay.
pub(crate) struct OpenRound {
    tracker: SubscriptionTracker,
    updates: mpsc::UnboundedReceiver<RelayUpdate>,
}

/// Send the REQ for `filter` to every relay under a fresh subscription id.
///
/// The subscribe commands are queued before this returns, so anything sent to the
/// same relays afterwards reaches them after the REQ.
pub(crate) fn open_round(relays: &[RelayHandle], filter: Filter) -> OpenRound {
    let subscription_id = generate_subscription_id();
    let (updates_tx, updates) = mpsc::unbounded_channel::<RelayUpdate>();
    let mut tracker = SubscriptionTracker::new(subscription_id.as_str(), filter);

    for relay in relays {
        match relay.subscribe(&subscription_id, tracker.filter.clone(), updates_tx.clone()) {
            Ok(()) => tracker.add_relay(relay.url()),
            Err(e) => debug!("Skipping {} for {}: {}", relay.url(), subscription_id, e),
        }
    }
    debug!(subscription = %subscription_id, filter = %tracker.filter, relays = tracker.relays.len(), "subscription opened");
    OpenRound { tracker, updates }
}

/// Run one subscription round over `relays`, forwarding new events to `out`.
///
/// Stops after `cap` forwarded events when given. `seen` carries event ids across
/// rounds so a later round never repeats an event.
pub(crate) async fn run_round(
    relays: &[RelayHandle],
    filter: Filter,
    end: RoundEnd,
    cap: Option<u64>,
    seen: &mut SeenEvents,
    out: &mpsc::Sender<RelayEvent>,
    cancel: &CancellationToken,
) -> RoundOutcome {
    if cap == Some(0) {
        return RoundOutcome::default();
    }
    let round = open_round(relays, filter);
    drive_round(relays, round, end, cap, seen, out, cancel).await
}

/// Merge the updates of an opened round until it ends, then close it where still open.
pub(crate) async fn drive_round(
    relays: &[RelayHandle],
    round: OpenRound,
    end: RoundEnd,
    cap: Option<u64>,
    seen: &mut SeenEvents,
    out: &mpsc::Sender<RelayEvent>,
    cancel: &CancellationToken,
) -> RoundOutcome {
    let OpenRound {
        mut tracker,
        updates: mut updates_rx,
    } = round;
    let subscription_id = tracker.id.clone();
    let mut outcome = RoundOutcome::default();

    while !tracker.is_done(end) {
        let next = tokio::select! {
            _ = cancel.cancelled() => None,
            _ = out.closed() => None,
            update = updates_rx.recv() => Some(update),
        };
        let Some(update) = next else {
            outcome.interrupted = true;
            break;
        };
        let Some(RelayUpdate { relay_url, update }) = update else {
            break;
        };

        match update {
            SubscriptionUpdate::Event(event) => {
                outcome.record(&relay_url, event.created_at);
                if !seen.insert(&event.id) {
                    continue;
                }
                let sent = tokio::select! {
                    _ = cancel.cancelled() => false,
                    sent = out.send(RelayEvent { relay_url, event }) => sent.is_ok(),
                };
                if !sent {
                    outcome.interrupted = true;
                    break;
                }
                outcome.yielded += 1;
                if cap.is_some_and(|cap| outcome.yielded >= cap) {
                    break;
                }
            }
            SubscriptionUpdate::Eose => {
                debug!("EOSE from {} for {}", relay_url, subscription_id);
                tracker.mark_eose(relay_url);
            }
            SubscriptionUpdate::Closed(reason)
            | SubscriptionUpdate::Refused(reason)
            | SubscriptionUpdate::Dropped(reason) => {
                debug!("{} stopped {}: {}", relay_url, subscription_id, reason);
                tracker.mark_finished(relay_url);
            }
        }
    }

    for relay in relays {
        if tracker.open_relays().any(|r| r == relay.url()) {
            relay.unsubscribe(&subscription_id);
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_subscription_id() {
        let id1 = generate_subscription_id();
        let id2 = generate_subscription_id();
        assert_eq!(id1.len(), 8);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_tracker_eose_across_relays() {
        let mut tracker = SubscriptionTracker::new("sub", Filter::new());
        tracker.add_relay("wss://a");
        tracker.add_relay("wss://b");
        assert!(!tracker.all_eose());

        tracker.mark_eose("wss://a");
        assert!(!tracker.is_done(RoundEnd::AllEose));

        tracker.mark_finished("wss://b");
        assert!(tracker.is_done(RoundEnd::AllEose));
        assert!(!tracker.is_done(RoundEnd::AllClosed));
        assert_eq!(tracker.open_relays().collect::<Vec<_>>(), vec!["wss://a"]);

        tracker.mark_finished("wss://a");
        assert!(tracker.all_finished());
    }

    #[test]
    fn test_empty_tracker_is_done() {
        let tracker = SubscriptionTracker::new("sub", Filter::new());
        assert!(tracker.is_done(RoundEnd::AllEose));
        assert!(tracker.is_done(RoundEnd::AllClosed));
    }

    #[test]
    fn test_round_outcome_records_oldest() {
        let mut outcome = RoundOutcome::default();
        outcome.record("wss://a", 100);
        outcome.record("wss://b", 90);
        outcome.record("wss://a", 95);
        assert_eq!(outcome.received, 3);
        assert_eq!(outcome.oldest, Some(90));
        assert_eq!(outcome.oldest_by_relay["wss://a"], 95);
        assert_eq!(outcome.oldest_by_relay["wss://b"], 90);
    }

    #[tokio::test]
    async fn test_round_without_relays_ends_immediately() {
        let (tx, _stream) = EventStream::channel();
        let mut seen = SeenEvents::new();
        let outcome = run_round(
            &[],
            Filter::new(),
            RoundEnd::AllEose,
            None,
            &mut seen,
            &tx,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome, RoundOutcome::default());
    }

    #[test]
    fn test_seen_events_rejects_repeats() {
        let mut seen = SeenEvents::new();
        assert!(seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(!seen.insert("a"));
        assert!(!seen.insert("b"));
    }

    #[test]
    fn test_seen_events_is_bounded() {
        let mut seen = SeenEvents::with_capacity(2);
        assert!(seen.insert("a"));
        assert!(seen.insert("b"));
        // Touching "a" makes "b" the oldest.
        assert!(!seen.insert("a"));
        assert!(seen.insert("c"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("b"));

        let mut tiny = SeenEvents::with_capacity(0);
        assert!(tiny.insert("x"));
        assert!(!tiny.insert("x"));
        assert!(tiny.insert("y"));
        assert!(tiny.insert("x"));
    }
}
