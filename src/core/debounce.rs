//! Quiet-period gate for response delivery.
//!
//! When a party sends several messages in quick succession, a response to it
//! must not be handed out until that party has gone quiet. Each gated
//! [`Channel`] tracks the origin's last activity and the newest response
//! waiting for it. Readiness is evaluated lazily on each poll; there is no
//! timer.
//!
//! A poll and a send touching the same channel serialize on that channel's
//! lock (see [`DebounceController::lock_channels`]), so origin activity can
//! never slip in between the readiness check and the dequeue it permits.
//!
//! Nothing here is durable. After a restart no activity is known, so the first
//! poll finds the channel deliverable.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::protocol::Envelope;

/// Responses from `responder` to `origin`, gated by `origin`'s activity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Channel {
    pub origin: String,
    pub responder: String,
}

impl Channel {
    pub fn new(origin: impl Into<String>, responder: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            responder: responder.into(),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.responder, self.origin)
    }
}

/// Timing rules for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPolicy {
    /// Silence required from the origin before delivery.
    pub quiet_period: Duration,
    /// Release a withheld response after this long even if the origin is
    /// still active.
    pub max_hold: Option<Duration>,
    /// Hand out only the newest queued response, dropping superseded ones.
    pub coalesce: bool,
}

impl ChannelPolicy {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            max_hold: None,
            coalesce: false,
        }
    }
}

/// Channel state as seen by a poll at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DebounceState {
    /// No pending response.
    Idle,
    /// A response exists but the origin has not been quiet long enough.
    Withheld,
    /// The pending response may be handed out.
    Deliverable,
}

/// The newest response waiting on a channel. The body stays in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingResponse {
    pub id: String,
    pub correlates_with: Option<String>,
    pub noted_at: i64,
}

/// Outcome of checking a destination before a dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// Destination is not gated.
    Open,
    /// Origin still active; report empty.
    Withheld,
    /// Quiet period satisfied; dequeue and then call
    /// [`DebounceController::complete`] while still holding the channel lock.
    Released { channel: Channel, coalesce: bool },
}

#[derive(Debug, Default)]
struct ChannelState {
    last_origin_activity_at: Option<i64>,
    pending_response: Option<PendingResponse>,
}

/// Diagnostics view of one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub channel: Channel,
    pub state: DebounceState,
    pub last_origin_activity_at: Option<i64>,
    pub pending_response: Option<PendingResponse>,
    pub quiet_period_ms: u64,
}

/// Per-channel debounce bookkeeping.
#[derive(Debug, Default)]
pub struct DebounceController {
    policies: HashMap<Channel, ChannelPolicy>,
    /// Ordered so several channels are always locked in the same order.
    gates: BTreeMap<Channel, Mutex<()>>,
    states: Mutex<HashMap<Channel, ChannelState>>,
}

impl DebounceController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate responses on `channel` with `policy`.
    pub fn with_channel(mut self, channel: Channel, policy: ChannelPolicy) -> Self {
        self.gates.insert(channel.clone(), Mutex::new(()));
        self.policies.insert(channel, policy);
        self
    }

    /// Lock every channel whose origin is one of `parties`.
    ///
    /// Hold the guards across a whole send (enqueue, activity, response) or a
    /// whole poll (check, dequeue, complete).
    pub fn lock_channels(&self, parties: &[&str]) -> Vec<MutexGuard<'_, ()>> {
        self.gates
            .iter()
            .filter(|(channel, _)| parties.contains(&channel.origin.as_str()))
            .map(|(_, gate)| gate.lock().unwrap_or_else(PoisonError::into_inner))
            .collect()
    }

    /// The channel gating deliveries to `destination`, if any.
    pub fn channel_for(&self, destination: &str) -> Option<&Channel> {
        self.policies.keys().find(|c| c.origin == destination)
    }

    /// Record a message from `origin`. Resets the quiet period of every
    /// channel answering it.
    pub fn record_activity(&self, origin: &str, now: i64) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        for channel in self.policies.keys().filter(|c| c.origin == origin) {
            states
                .entry(channel.clone())
                .or_default()
                .last_origin_activity_at = Some(now);
            tracing::trace!("Activity from {} at {}", origin, now);
        }
    }

    /// Record a response queued on `channel`. Replaces any older pending one.
    pub fn note_response(&self, channel: &Channel, response: &Envelope, now: i64) {
        if !self.policies.contains_key(channel) {
            return;
        }

        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(channel.clone()).or_default();

        if let Some(previous) = &state.pending_response {
            tracing::debug!(
                "Pending response on {} superseded: {} -> {}",
                channel,
                previous.id,
                response.id
            );
        }

        state.pending_response = Some(PendingResponse {
            id: response.id.clone(),
            correlates_with: response.correlates_with.clone(),
            noted_at: now,
        });
    }

    /// State of `channel` at `now`.
    pub fn state(&self, channel: &Channel, now: i64) -> DebounceState {
        let Some(policy) = self.policies.get(channel) else {
            return DebounceState::Idle;
        };

        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        match states.get(channel) {
            Some(state) if state.pending_response.is_some() => {
                if is_ready(policy, state, now) {
                    DebounceState::Deliverable
                } else {
                    DebounceState::Withheld
                }
            }
            _ => DebounceState::Idle,
        }
    }

    /// Decide whether a poll for `destination` may dequeue at `now`.
    pub fn check(&self, destination: &str, now: i64) -> Gate {
        let Some(channel) = self.channel_for(destination) else {
            return Gate::Open;
        };
        let policy = &self.policies[channel];

        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let ready = states
            .get(channel)
            .map_or(true, |state| is_ready(policy, state, now));

        if ready {
            Gate::Released {
                channel: channel.clone(),
                coalesce: policy.coalesce,
            }
        } else {
            Gate::Withheld
        }
    }

    /// Finish a released poll. `delivered` holds every envelope taken from
    /// the queue; empty means the queue turned out to be empty. The pending
    /// slot is cleared once its response has gone out.
    pub fn complete(&self, channel: &Channel, delivered: &[Envelope]) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(state) = states.get_mut(channel) else {
            return;
        };

        let clear = match &state.pending_response {
            Some(pending) => {
                delivered.is_empty() || delivered.iter().any(|e| e.id == pending.id)
            }
            None => false,
        };

        if clear {
            state.pending_response = None;
            tracing::debug!("Channel {} idle", channel);
        }
    }

    /// Diagnostics for every gated channel, sorted.
    pub fn snapshot(&self, now: i64) -> Vec<ChannelStatus> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);

        let mut out: Vec<ChannelStatus> = self
            .policies
            .iter()
            .map(|(channel, policy)| {
                let state = states.get(channel);
                let pending = state.and_then(|s| s.pending_response.clone());
                let debounce_state = match state {
                    Some(s) if pending.is_some() && is_ready(policy, s, now) => {
                        DebounceState::Deliverable
                    }
                    Some(_) if pending.is_some() => DebounceState::Withheld,
                    _ => DebounceState::Idle,
                };

                ChannelStatus {
                    channel: channel.clone(),
                    state: debounce_state,
                    last_origin_activity_at: state.and_then(|s| s.last_origin_activity_at),
                    pending_response: pending,
                    quiet_period_ms: u64::try_from(policy.quiet_period.as_millis())
                        .unwrap_or(u64::MAX),
                }
            })
            .collect();

        out.sort_by(|a, b| a.channel.cmp(&b.channel));
        out
    }
}

fn is_ready(policy: &ChannelPolicy, state: &ChannelState, now: i64) -> bool {
    let quiet = match state.last_origin_activity_at {
        None => true,
        Some(last) => now.saturating_sub(last) >= millis(policy.quiet_period),
    };
    if quiet {
        return true;
    }

    match (policy.max_hold, &state.pending_response) {
        (Some(max_hold), Some(pending)) => {
            now.saturating_sub(pending.noted_at) >= millis(max_hold)
        }
        _ => false,
    }
}

/// Whole milliseconds, saturating for durations beyond the clock's range.
fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
