//! Backward pagination over stored events.
//!
//! Each round is an EOSE-terminated subscription. After a round the `until` of the next
//! one moves just below the oldest event the round saw, so successive rounds walk back
//! in time until a limit, the filter's `since`, or an empty round ends the walk.

use crate::filter::Filter;
use crate::relay::RelayHandle;
use crate::subscription::{RelayEvent, RoundEnd, RoundOutcome, SeenEvents, run_round};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pagination settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationConfig {
    /// Pause between rounds.
    pub interval: Duration,
    /// Upper bound on events across all rounds.
    pub global_limit: Option<u64>,
    /// Treat an explicit `limit: 0` as "one round only".
    pub stop_on_explicit_zero_limit: bool,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::ZERO,
            global_limit: None,
            stop_on_explicit_zero_limit: true,
        }
    }
}

/// Progress across rounds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationState {
    /// `until` of the next round; `None` for the first round of an unbounded filter
    pub current_until: Option<u64>,
    /// Events delivered so far
    pub total_received: u64,
    /// Oldest `created_at` each relay returned
    pub oldest_by_relay: HashMap<String, u64>,
    /// Completed rounds
    pub rounds: u32,
}

/// Why pagination ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    FilterLimit,
    GlobalLimit,
    PastSince,
    EmptyRound,
    ExplicitZeroLimit,
    Exhausted,
}

/// Drives the rounds of one paginated subscription.
#[derive(Debug, Clone)]
pub struct PaginationController {
    filter: Filter,
    config: PaginationConfig,
    state: PaginationState,
}

impl PaginationController {
    pub fn new(filter: Filter, config: PaginationConfig) -> Self {
        let state = PaginationState {
            current_until: filter.until,
            ..Default::default()
        };
        Self {
            filter,
            config,
            state,
        }
    }

    pub fn state(&self) -> &PaginationState {
        &self.state
    }

    /// The filter for the next round.
    pub fn round_filter(&self) -> Filter {
        let mut filter = self.filter.clone();
        filter.until = self.state.current_until;
        filter
    }

    /// How many more events may be delivered, if bounded.
    pub fn remaining(&self) -> Option<u64> {
        let total = self.state.total_received;
        let by_filter = self.filter.limit.map(|l| l.saturating_sub(total));
        let by_global = self.config.global_limit.map(|l| l.saturating_sub(total));
        match (by_filter, by_global) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Account for a finished round. `Ok(())` means another round follows.
    pub fn finish_round(&mut self, outcome: &RoundOutcome) -> Result<(), StopReason> {
        self.state.rounds += 1;
        self.state.total_received += outcome.yielded;
        for (relay, oldest) in &outcome.oldest_by_relay {
            self.state
                .oldest_by_relay
                .entry(relay.clone())
                .and_modify(|o| *o = (*o).min(*oldest))
                .or_insert(*oldest);
        }

        if self.filter.limit_zero && self.config.stop_on_explicit_zero_limit {
            return Err(StopReason::ExplicitZeroLimit);
        }
        if self
            .filter
            .limit
            .is_some_and(|l| self.state.total_received >= l)
        {
            return Err(StopReason::FilterLimit);
        }
        if self
            .config
            .global_limit
            .is_some_and(|l| self.state.total_received >= l)
        {
            return Err(StopReason::GlobalLimit);
        }
        let Some(round_min) = outcome.oldest.filter(|_| outcome.received > 0) else {
            return Err(StopReason::EmptyRound);
        };

        let mut next_until = round_min.checked_sub(1).ok_or(StopReason::Exhausted)?;
        if let Some(prev) = self.state.current_until {
            next_until = next_until.min(prev.checked_sub(1).ok_or(StopReason::Exhausted)?);
        }
        if self.filter.since.is_some_and(|since| next_until < since) {
            return Err(StopReason::PastSince);
        }

        self.state.current_until = Some(next_until);
        Ok(())
    }

    /// Run rounds until a stop condition, the consumer going away, or cancellation.
    pub(crate) async fn run(
        mut self,
        relays: &[RelayHandle],
        out: &mpsc::Sender<RelayEvent>,
        cancel: &CancellationToken,
    ) -> PaginationState {
        let mut seen = SeenEvents::new();
        loop {
            let filter = self.round_filter();
            debug!(round = self.state.rounds + 1, until = ?filter.until, "pagination round");
            let outcome = run_round(
                relays,
                filter,
                RoundEnd::AllEose,
                self.remaining(),
                &mut seen,
                out,
                cancel,
            )
            .await;
            if outcome.interrupted {
                break;
            }
            if let Err(reason) = self.finish_round(&outcome) {
                info!(
                    "Pagination finished after {} rounds and {} events: {:?}",
                    self.state.rounds, self.state.total_received, reason
                );
                break;
            }

            if !self.config.interval.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = out.closed() => break,
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
            }
        }
        self.state
    }
}
