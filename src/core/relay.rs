//! Relay coordinator: two mailboxes over one queue store.
//!
//! Every boundary call goes through here. Read paths never fail: a store or
//! gate fault is logged, kept for diagnostics, and reported as "nothing
//! available". Send paths report store faults explicitly so a message is never
//! acknowledged without being on disk.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::clock::{Clock, SystemClock};
use super::debounce::{ChannelStatus, DebounceController, Gate};
use super::queue::QueueStore;
use super::routing::RoutingTable;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::protocol::{Envelope, EnvelopeBuilder, SendAck, SendRequest};

/// Most recent internal fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    pub ts: i64,
    pub operation: String,
    pub message: String,
}

#[derive(Debug, Default)]
struct Diagnostics {
    last_enqueue_ts: Option<i64>,
    last_dequeue_ts: Option<i64>,
    last_error: Option<LastError>,
}

/// Diagnostics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayStatus {
    pub ts: i64,
    /// Queue length per destination.
    pub queues: BTreeMap<String, usize>,
    pub last_enqueue_ts: Option<i64>,
    pub last_dequeue_ts: Option<i64>,
    pub last_error: Option<LastError>,
    /// Debounce state per gated channel.
    pub channels: Vec<ChannelStatus>,
}

/// Binds routing, the queue store and the debounce gate.
pub struct RelayCoordinator {
    store: QueueStore,
    routing: RoutingTable,
    debounce: DebounceController,
    clock: Arc<dyn Clock>,
    diagnostics: Mutex<Diagnostics>,
}

impl RelayCoordinator {
    pub fn new(store: QueueStore, routing: RoutingTable, debounce: DebounceController) -> Self {
        Self {
            store,
            routing,
            debounce,
            clock: Arc::new(SystemClock),
            diagnostics: Mutex::new(Diagnostics::default()),
        }
    }

    /// Open the store and build routing and debounce from settings.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let data_dir = settings.storage.resolve_data_dir()?;
        let store = QueueStore::open(&data_dir)?;
        let routing = RoutingTable::from_config(&settings.routing);

        let debounce = settings
            .debounce
            .channels
            .iter()
            .fold(DebounceController::new(), |debounce, cfg| {
                debounce.with_channel(cfg.channel(), cfg.policy())
            });

        tracing::info!(
            "Relay ready: parties {:?}, fallback {}, data in {}",
            routing.parties(),
            routing.fallback(),
            data_dir.display()
        );
        Ok(Self::new(store, routing, debounce))
    }

    /// Replace the clock (tests drive time by hand).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    /// Queue a message. Returns its ID.
    ///
    /// Fails with [`Error::Validation`] for a blank payload and
    /// [`Error::StoreWrite`] if the message did not reach disk.
    pub fn send(&self, request: SendRequest) -> Result<String> {
        let now = self.clock.now_ms();
        let origin = self.routing.resolve_origin(request.from.as_deref());
        let destination = self
            .routing
            .resolve_destination(request.to.as_deref(), origin.as_deref())
            .to_string();

        let envelope = EnvelopeBuilder::to(&destination)
            .maybe_origin(origin.clone())
            .text(request.text.unwrap_or_default())
            .maybe_id(request.id)
            .maybe_correlates_with(request.correlates_with)
            .build_at(now)
            .map_err(|e| {
                tracing::debug!("Not queued for {}: {}", destination, e);
                e
            })?;

        // Channels answering either side see this send as one step.
        let parties: Vec<&str> = origin
            .as_deref()
            .into_iter()
            .chain(std::iter::once(destination.as_str()))
            .collect();
        let _gates = self.debounce.lock_channels(&parties);

        let stored = match self.store.enqueue(&destination, envelope) {
            Ok(stored) => stored,
            Err(e) => {
                self.absorb("send", &e);
                return Err(e);
            }
        };

        if let Some(origin) = origin.as_deref() {
            self.debounce.record_activity(origin, now);
        }
        if let Some(channel) = self.debounce.channel_for(&destination) {
            if origin.as_deref() == Some(channel.responder.as_str()) {
                self.debounce.note_response(channel, &stored, now);
            }
        }

        self.diagnostics().last_enqueue_ts = Some(now);
        tracing::info!(
            "Queued {} from {} to {}",
            stored.id,
            stored.origin.as_deref().unwrap_or("unknown"),
            destination
        );
        Ok(stored.id)
    }

    /// Queue a message and describe the outcome as an acknowledgment.
    pub fn acknowledge(&self, request: SendRequest) -> SendAck {
        match self.send(request) {
            Ok(id) => SendAck::queued(id),
            Err(e) if e.is_validation() => SendAck::rejected(e.to_string()),
            Err(e) => SendAck::failed(e.to_string()),
        }
    }

    /// Hand out the oldest message for `party`, if one may be delivered now.
    pub fn receive(&self, party: &str) -> Option<Envelope> {
        match self.try_receive(party) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.absorb("receive", &e);
                None
            }
        }
    }

    /// Hand out everything queued for `party`, if delivery is allowed now.
    pub fn receive_all(&self, party: &str) -> Vec<Envelope> {
        match self.try_receive_all(party) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                self.absorb("receive_all", &e);
                Vec::new()
            }
        }
    }

    fn try_receive(&self, party: &str) -> Result<Option<Envelope>> {
        let destination = self.resolve_party(party)?;
        let _gate = self.debounce.lock_channels(&[destination.as_str()]);
        let now = self.clock.now_ms();

        let envelope = match self.debounce.check(&destination, now) {
            Gate::Withheld => {
                tracing::debug!("Delivery to {} withheld, origin still active", destination);
                return Ok(None);
            }
            Gate::Open => self.store.dequeue_one(&destination)?,
            Gate::Released { channel, coalesce } => {
                if coalesce {
                    let drained = self.store.dequeue_all(&destination)?;
                    self.debounce.complete(&channel, &drained);
                    keep_newest(&destination, drained)
                } else {
                    let envelope = self.store.dequeue_one(&destination)?;
                    self.debounce.complete(&channel, envelope.as_slice());
                    envelope
                }
            }
        };

        if let Some(envelope) = &envelope {
            self.diagnostics().last_dequeue_ts = Some(now);
            tracing::info!("Delivered {} to {}", envelope.id, destination);
        }
        Ok(envelope)
    }

    fn try_receive_all(&self, party: &str) -> Result<Vec<Envelope>> {
        let destination = self.resolve_party(party)?;
        let _gate = self.debounce.lock_channels(&[destination.as_str()]);
        let now = self.clock.now_ms();

        let envelopes = match self.debounce.check(&destination, now) {
            Gate::Withheld => {
                tracing::debug!("Delivery to {} withheld, origin still active", destination);
                return Ok(Vec::new());
            }
            Gate::Open => self.store.dequeue_all(&destination)?,
            Gate::Released { channel, coalesce } => {
                let drained = self.store.dequeue_all(&destination)?;
                self.debounce.complete(&channel, &drained);
                if coalesce {
                    keep_newest(&destination, drained).into_iter().collect()
                } else {
                    drained
                }
            }
        };

        if !envelopes.is_empty() {
            self.diagnostics().last_dequeue_ts = Some(now);
            tracing::info!("Delivered {} messages to {}", envelopes.len(), destination);
        }
        Ok(envelopes)
    }

    /// Diagnostics snapshot. Every party is listed, even with no log yet.
    pub fn status(&self) -> RelayStatus {
        let now = self.clock.now_ms();

        let mut queues: BTreeMap<String, usize> = self
            .routing
            .parties()
            .iter()
            .map(|p| (p.clone(), 0))
            .collect();

        match self.store.stats() {
            Ok(stats) => queues.extend(stats.lengths),
            Err(e) => self.absorb("status", &e),
        }

        let channels = self.debounce.snapshot(now);
        let diagnostics = self.diagnostics();

        RelayStatus {
            ts: now,
            queues,
            last_enqueue_ts: diagnostics.last_enqueue_ts,
            last_dequeue_ts: diagnostics.last_dequeue_ts,
            last_error: diagnostics.last_error.clone(),
            channels,
        }
    }

    fn resolve_party(&self, party: &str) -> Result<String> {
        self.routing
            .resolve(party)
            .map(str::to_string)
            .ok_or_else(|| Error::Validation(format!("unknown party '{}'", party)))
    }

    fn diagnostics(&self) -> std::sync::MutexGuard<'_, Diagnostics> {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Log a read-path error. Validation problems are the caller's, not ours.
    fn absorb(&self, operation: &str, error: &Error) {
        if error.is_validation() {
            tracing::debug!("{} rejected: {}", operation, error);
        } else {
            self.record_error(operation, error);
        }
    }

    fn record_error(&self, operation: &str, error: &Error) {
        tracing::error!("{} failed: {}", operation, error);
        self.diagnostics().last_error = Some(LastError {
            ts: self.clock.now_ms(),
            operation: operation.to_string(),
            message: error.to_string(),
        });
    }
}

/// Keep only the newest of a drained batch, logging what it supersedes.
fn keep_newest(destination: &str, mut envelopes: Vec<Envelope>) -> Option<Envelope> {
    let newest = envelopes.pop();

    if !envelopes.is_empty() {
        let superseded: Vec<&str> = envelopes.iter().map(|e| e.id.as_str()).collect();
        tracing::info!(
            "Dropped {} superseded responses for {}: {:?}",
            superseded.len(),
            destination,
            superseded
        );
    }
    newest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::debounce::DebounceState;
    use std::fs;
    use std::path::Path;

    const Q: i64 = 1_000;
    const T0: i64 = 1_700_000_000_000;

    fn settings(data_dir: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.storage.data_dir = Some(data_dir.to_path_buf());
        settings.debounce.channels[0].quiet_period_ms = Q as u64;
        settings
    }

    fn relay(data_dir: &Path, clock: &ManualClock) -> RelayCoordinator {
        RelayCoordinator::from_settings(&settings(data_dir))
            .unwrap()
            .with_clock(Arc::new(clock.clone()))
    }

    fn request(from: &str, to: Option<&str>, text: &str) -> SendRequest {
        SendRequest {
            from: Some(from.to_string()),
            to: to.map(str::to_string),
            text: Some(text.to_string()),
            ..Default::default()
        }
    }

    fn texts(envelopes: &[Envelope]) -> Vec<&str> {
        envelopes.iter().map(|e| e.payload.as_str()).collect()
    }

    #[test]
    fn test_hello_world_drain() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(T0);
        let relay = relay(temp_dir.path(), &clock);

        relay.send(request("mobile", Some("core"), "hello")).unwrap();
        relay.send(request("mobile", Some("core"), "world")).unwrap();

        let drained = relay.receive_all("core");
        assert_eq!(texts(&drained), vec!["hello", "world"]);
        assert_eq!(relay.status().queues["core"], 0);
        assert!(relay.receive("core").is_none());
    }

    #[test]
    fn test_blank_text_not_queued() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(T0);
        let relay = relay(temp_dir.path(), &clock);

        let ack = relay.acknowledge(request("mobile", Some("core"), "   "));
        assert!(!ack.queued);
        assert!(ack.reason.is_some());
        assert_eq!(relay.store().peek_length("core").unwrap(), 0);

        let ack = relay.acknowledge(SendRequest {
            to: Some("core".to_string()),
            ..Default::default()
        });
        assert!(!ack.queued);

        let status = relay.status();
        assert_eq!(status.queues["core"], 0);
        assert!(status.last_error.is_none());
        assert!(status.last_enqueue_ts.is_none());
    }

    #[test]
    fn test_response_withheld_until_quiet() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(T0);
        let relay = relay(temp_dir.path(), &clock);

        let question = relay.send(request("mobile", None, "question")).unwrap();

        clock.set(T0 + 1);
        let answer = relay
            .send(SendRequest {
                correlates_with: Some(question.clone()),
                ..request("core", None, "answer")
            })
            .unwrap();

        clock.set(T0 + Q - 1);
        assert!(relay.receive("mobile").is_none());
        assert!(relay.receive_all("mobile").is_empty());
        assert_eq!(relay.store().peek_length("mobile").unwrap(), 1);
        assert_eq!(relay.status().channels[0].state, DebounceState::Withheld);

        clock.set(T0 + Q + 1);
        let delivered = relay.receive("mobile").unwrap();
        assert_eq!(delivered.id, answer);
        assert!(delivered.answers(&question));
        assert_eq!(delivered.origin.as_deref(), Some("core"));
        assert_eq!(relay.status().channels[0].state, DebounceState::Idle);
    }

    #[test]
    fn test_new_activity_resets_quiet_period() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(T0);
        let relay = relay(temp_dir.path(), &clock);

        relay.send(request("mobile", None, "one")).unwrap();
        clock.set(T0 + 1);
        relay.send(request("core", None, "reply")).unwrap();
        clock.set(T0 + Q - 1);
        relay.send(request("mobile", None, "two")).unwrap();

        clock.set(T0 + Q + 1);
        assert!(relay.receive("mobile").is_none());

        clock.set(T0 + 2 * Q);
        assert_eq!(relay.receive("mobile").unwrap().payload, "reply");
    }

    #[test]
    fn test_core_direction_not_gated() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(T0);
        let relay = relay(temp_dir.path(), &clock);

        relay.send(request("mobile", None, "ping")).unwrap();
        assert_eq!(relay.receive("core").unwrap().payload, "ping");
    }

    #[test]
    fn test_queue_survives_restart_and_debounce_does_not() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(T0);

        {
            let relay = relay(temp_dir.path(), &clock);
            relay.send(request("mobile", None, "question")).unwrap();
            relay.send(request("core", None, "answer")).unwrap();
            assert!(relay.receive("mobile").is_none());
        }

        let restarted = relay(temp_dir.path(), &clock);
        assert_eq!(restarted.receive("mobile").unwrap().payload, "answer");
        assert_eq!(restarted.receive("core").unwrap().payload, "question");
    }

    #[test]
    fn test_routing_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(T0);
        let relay = relay(temp_dir.path(), &clock);

        relay.send(request("legacy_app", None, "no target")).unwrap();
        relay.send(request("mobile", Some("pluto"), "bad target")).unwrap();
        relay.send(request("client", Some("agent"), "aliases")).unwrap();

        let drained = relay.receive_all("backend");
        assert_eq!(texts(&drained), vec!["no target", "bad target", "aliases"]);
        assert_eq!(drained[0].origin.as_deref(), Some("legacy_app"));
        assert_eq!(drained[2].origin.as_deref(), Some("mobile"));
    }

    #[test]
    fn test_unknown_party_reads_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(T0);
        let relay = relay(temp_dir.path(), &clock);

        assert!(relay.receive("stranger").is_none());
        assert!(relay.receive_all("../core").is_empty());
        assert!(relay.status().last_error.is_none());
    }

    #[test]
    fn test_store_failure_on_send_is_explicit() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(T0);
        let relay = relay(temp_dir.path(), &clock);

        fs::create_dir(relay.store().base_path().join("core.jsonl")).unwrap();

        let err = relay.send(request("mobile", None, "lost?")).unwrap_err();
        assert!(matches!(err, Error::StoreWrite { .. }));

        let ack = relay.acknowledge(request("mobile", None, "lost?"));
        assert!(!ack.queued);
        assert!(ack.error.is_some());

        let last_error = relay.status().last_error.unwrap();
        assert_eq!(last_error.operation, "send");
        assert_eq!(last_error.ts, T0);
    }

    #[test]
    fn test_store_failure_on_receive_returns_nothing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(T0);
        let relay = relay(temp_dir.path(), &clock);

        relay.send(request("mobile", None, "keep")).unwrap();
        let tmp = relay.store().base_path().join("core.jsonl.tmp");
        fs::create_dir(&tmp).unwrap();

        assert!(relay.receive("core").is_none());
        assert!(relay.receive_all("core").is_empty());
        assert_eq!(relay.status().last_error.unwrap().operation, "receive_all");
        assert_eq!(relay.status().queues["core"], 1);

        fs::remove_dir(&tmp).unwrap();
        assert_eq!(relay.receive("core").unwrap().payload, "keep");
    }

    #[test]
    fn test_coalesce_keeps_newest() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(T0);
        let mut settings = settings(temp_dir.path());
        settings.debounce.channels[0].coalesce = true;
        let relay = RelayCoordinator::from_settings(&settings)
            .unwrap()
            .with_clock(Arc::new(clock.clone()));

        for text in ["draft", "better", "final"] {
            relay.send(request("core", None, text)).unwrap();
        }

        assert_eq!(relay.receive("mobile").unwrap().payload, "final");
        assert!(relay.receive("mobile").is_none());
        assert_eq!(relay.status().queues["mobile"], 0);
    }

    #[test]
    fn test_bulk_drain_clears_pending_response() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(T0);
        let relay = relay(temp_dir.path(), &clock);

        relay.send(request("mobile", None, "q")).unwrap();
        relay.send(request("core", None, "r")).unwrap();
        relay.send(request("freja_app", Some("mobile"), "late")).unwrap();

        clock.set(T0 + Q);
        let drained = relay.receive_all("mobile");
        assert_eq!(texts(&drained), vec!["r", "late"]);

        let channel = &relay.status().channels[0];
        assert_eq!(channel.state, DebounceState::Idle);
        assert!(channel.pending_response.is_none());
    }

    #[test]
    fn test_concurrent_send_and_poll_on_gated_channel() {
        use std::thread;

        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(T0);
        let relay = Arc::new(relay(temp_dir.path(), &clock));

        for round in 0..20 {
            relay.send(request("core", None, &format!("answer {}", round))).unwrap();
            // Origin quiet: the answer is deliverable until mobile speaks again.
            clock.advance(Q);

            let poller = {
                let relay = relay.clone();
                thread::spawn(move || relay.receive("mobile"))
            };
            let sender = {
                let relay = relay.clone();
                thread::spawn(move || relay.send(request("mobile", None, "more")).unwrap())
            };

            sender.join().unwrap();
            let delivered = poller.join().unwrap();

            // Either the poll ran first and took the answer, or mobile's
            // activity landed first and the answer is still withheld.
            let channel = relay.status().channels[0].clone();
            match delivered {
                Some(envelope) => {
                    assert_eq!(envelope.payload, format!("answer {}", round));
                    assert_eq!(relay.store().peek_length("mobile").unwrap(), 0);
                    assert_eq!(channel.state, DebounceState::Idle);
                }
                None => {
                    assert_eq!(relay.store().peek_length("mobile").unwrap(), 1);
                    assert_eq!(channel.state, DebounceState::Withheld);
                    clock.advance(Q);
                    assert_eq!(
                        relay.receive("mobile").unwrap().payload,
                        format!("answer {}", round)
                    );
                }
            }
            relay.receive_all("core");
        }
    }

    #[test]
    fn test_status_timestamps() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(T0);
        let relay = relay(temp_dir.path(), &clock);

        let status = relay.status();
        assert_eq!(status.queues.len(), 2);
        assert!(status.last_enqueue_ts.is_none());

        relay.send(request("mobile", None, "x")).unwrap();
        clock.advance(5);
        relay.receive("core").unwrap();

        let status = relay.status();
        assert_eq!(status.last_enqueue_ts, Some(T0));
        assert_eq!(status.last_dequeue_ts, Some(T0 + 5));
        assert_eq!(status.channels.len(), 1);
    }
}
