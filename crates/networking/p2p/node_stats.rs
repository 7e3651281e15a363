//! Per-peer quality tracking.
//!
//! Keeps a rolling transfer-speed average per request kind and a short
//! history of connection events, persisted across sessions keyed by node
//! id. Peer selection reads the averages; the dialer asks
//! [`NodeStats::is_connection_delayed`] before re-dialing a peer that
//! recently failed or disconnected us.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use ethwire_common::H512;

use crate::rlpx::p2p::DisconnectReason;

/// Smoothing factor of the exponentially weighted averages.
const TRANSFER_SPEED_ALPHA: f64 = 0.5;
/// Number of samples an average needs before it is reported.
const TRANSFER_SPEED_WARMUP: u64 = 2;
/// How many recent events are kept per peer.
const EVENT_HISTORY_LIMIT: usize = 8;

const FAILED_CONNECTION_DELAY: Duration = Duration::from_secs(10);
const DISCONNECT_DELAY: Duration = Duration::from_millis(100);

/// Transfer kinds tracked separately; `Latency` is an inverted measure fed
/// by round-trip times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferSpeedKind {
    Headers,
    Bodies,
    Receipts,
    NodeData,
    Latency,
    SnapRanges,
}

const TRANSFER_SPEED_KINDS: usize = 6;

impl TransferSpeedKind {
    fn index(self) -> usize {
        match self {
            TransferSpeedKind::Headers => 0,
            TransferSpeedKind::Bodies => 1,
            TransferSpeedKind::Receipts => 2,
            TransferSpeedKind::NodeData => 3,
            TransferSpeedKind::Latency => 4,
            TransferSpeedKind::SnapRanges => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatsEvent {
    Connecting,
    ConnectionFailed,
    ConnectionFailedTargetUnreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectDirection {
    Local,
    Remote,
}

/// Event class blamed for an active reconnection delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayCause {
    Event(NodeStatsEvent),
    Disconnect(DisconnectDirection, DisconnectReason),
}

#[derive(Debug, Clone, Copy)]
enum RecordedEvent {
    Event(NodeStatsEvent),
    Disconnect(DisconnectDirection, DisconnectReason),
}

impl RecordedEvent {
    fn delay(&self) -> Duration {
        match self {
            RecordedEvent::Event(_) => FAILED_CONNECTION_DELAY,
            RecordedEvent::Disconnect(_, reason) => match reason {
                DisconnectReason::UselessPeer => Duration::from_secs(15 * 60),
                DisconnectReason::ClientQuitting => Duration::from_secs(5 * 60),
                DisconnectReason::AlreadyConnected => Duration::from_secs(60),
                DisconnectReason::TooManyPeers => Duration::from_secs(30),
                _ => DISCONNECT_DELAY,
            },
        }
    }

    fn cause(&self) -> DelayCause {
        match self {
            RecordedEvent::Event(event) => DelayCause::Event(*event),
            RecordedEvent::Disconnect(direction, reason) => {
                DelayCause::Disconnect(*direction, *reason)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DecayingAverage {
    average: f64,
    samples: u64,
}

impl DecayingAverage {
    /// `avg_n = α·v + (1−α)·avg_{n−1}`. Zero-valued samples still count:
    /// they represent observed idle time.
    fn update(&mut self, value: u64) {
        if self.samples == 0 {
            self.average = value as f64;
        } else {
            self.average =
                TRANSFER_SPEED_ALPHA * value as f64 + (1.0 - TRANSFER_SPEED_ALPHA) * self.average;
        }
        self.samples += 1;
    }

    fn current(&self) -> Option<u64> {
        if self.samples < TRANSFER_SPEED_WARMUP {
            return None;
        }
        Some(self.average as u64)
    }
}

#[derive(Debug, Default)]
struct NodeStatsInner {
    averages: [DecayingAverage; TRANSFER_SPEED_KINDS],
    events: VecDeque<(Instant, RecordedEvent)>,
}

impl NodeStatsInner {
    fn push_event(&mut self, event: RecordedEvent, at: Instant) {
        if self.events.len() == EVENT_HISTORY_LIMIT {
            self.events.pop_front();
        }
        self.events.push_back((at, event));
    }
}

/// Stats for one peer. Updates are linearizable under the entry lock.
#[derive(Debug, Default)]
pub struct NodeStats {
    inner: Mutex<NodeStatsInner>,
}

impl NodeStats {
    pub fn add_event(&self, event: NodeStatsEvent) {
        self.lock()
            .push_event(RecordedEvent::Event(event), Instant::now());
    }

    pub fn add_disconnect(&self, direction: DisconnectDirection, reason: DisconnectReason) {
        self.lock()
            .push_event(RecordedEvent::Disconnect(direction, reason), Instant::now());
    }

    pub fn add_transfer_speed(&self, kind: TransferSpeedKind, value: u64) {
        self.lock().averages[kind.index()].update(value);
    }

    pub fn average_transfer_speed(&self, kind: TransferSpeedKind) -> Option<u64> {
        self.lock().averages[kind.index()].current()
    }

    /// Whether dialing this peer should wait, and which event is to blame.
    /// Once the window of the latest event elapses the peer is immediately
    /// eligible again.
    pub fn is_connection_delayed(&self) -> (bool, Option<DelayCause>) {
        self.connection_delayed_at(Instant::now())
    }

    fn connection_delayed_at(&self, now: Instant) -> (bool, Option<DelayCause>) {
        let inner = self.lock();
        let Some((at, event)) = inner.events.back() else {
            return (false, None);
        };
        let delayed = now < *at + event.delay();
        (delayed, delayed.then(|| event.cause()))
    }

    fn lock(&self) -> MutexGuard<'_, NodeStatsInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[cfg(test)]
    fn push_event_at(&self, event: RecordedEvent, at: Instant) {
        self.lock().push_event(event, at);
    }
}

/// Process-wide map of per-peer stats, passed as an explicit dependency.
/// Entries outlive sessions: a peer keeps its history across reconnects.
///
/// Cheaply cloneable (Arc-backed). Pass clones to spawned tasks.
#[derive(Debug, Clone, Default)]
pub struct NodeStatsRegistry {
    entries: Arc<Mutex<HashMap<H512, Arc<NodeStats>>>>,
}

impl NodeStatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats_for(&self, public_key: H512) -> Arc<NodeStats> {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.entry(public_key).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_needs_two_samples() {
        let stats = NodeStats::default();
        assert_eq!(stats.average_transfer_speed(TransferSpeedKind::Headers), None);
        stats.add_transfer_speed(TransferSpeedKind::Headers, 100);
        assert_eq!(stats.average_transfer_speed(TransferSpeedKind::Headers), None);
        stats.add_transfer_speed(TransferSpeedKind::Headers, 100);
        assert_eq!(
            stats.average_transfer_speed(TransferSpeedKind::Headers),
            Some(100)
        );
    }

    #[test]
    fn decaying_average_reference_sequence() {
        let stats = NodeStats::default();
        for value in [30, 51, 140, 110, 133, 51, 140, 110, 133, 51, 140, 110, 133] {
            stats.add_transfer_speed(TransferSpeedKind::Bodies, value);
        }
        assert_eq!(
            stats.average_transfer_speed(TransferSpeedKind::Bodies),
            Some(122)
        );

        // zero samples count: they drag the average down
        stats.add_transfer_speed(TransferSpeedKind::Bodies, 0);
        stats.add_transfer_speed(TransferSpeedKind::Bodies, 0);
        assert_eq!(
            stats.average_transfer_speed(TransferSpeedKind::Bodies),
            Some(30)
        );
    }

    #[test]
    fn kinds_are_tracked_independently() {
        let stats = NodeStats::default();
        stats.add_transfer_speed(TransferSpeedKind::Headers, 10);
        stats.add_transfer_speed(TransferSpeedKind::Headers, 10);
        assert_eq!(
            stats.average_transfer_speed(TransferSpeedKind::SnapRanges),
            None
        );
    }

    #[test]
    fn no_events_means_no_delay() {
        let stats = NodeStats::default();
        assert_eq!(stats.is_connection_delayed(), (false, None));
    }

    #[test]
    fn short_disconnect_window_elapses() {
        let stats = NodeStats::default();
        let just_past_window = Instant::now() - Duration::from_millis(125);
        stats.push_event_at(
            RecordedEvent::Disconnect(DisconnectDirection::Remote, DisconnectReason::Other),
            just_past_window,
        );
        assert_eq!(stats.is_connection_delayed(), (false, None));
    }

    #[test]
    fn useless_peer_is_delayed_for_a_long_time() {
        let stats = NodeStats::default();
        let earlier = Instant::now() - Duration::from_millis(125);
        stats.push_event_at(
            RecordedEvent::Disconnect(DisconnectDirection::Remote, DisconnectReason::UselessPeer),
            earlier,
        );
        let (delayed, cause) = stats.is_connection_delayed();
        assert!(delayed);
        assert_eq!(
            cause,
            Some(DelayCause::Disconnect(
                DisconnectDirection::Remote,
                DisconnectReason::UselessPeer
            ))
        );
    }

    #[test]
    fn failed_connection_delays_ten_seconds() {
        let stats = NodeStats::default();
        stats.add_event(NodeStatsEvent::ConnectionFailed);
        let (delayed, cause) = stats.is_connection_delayed();
        assert!(delayed);
        assert_eq!(
            cause,
            Some(DelayCause::Event(NodeStatsEvent::ConnectionFailed))
        );
    }

    #[test]
    fn latest_event_wins() {
        let stats = NodeStats::default();
        stats.push_event_at(
            RecordedEvent::Disconnect(DisconnectDirection::Local, DisconnectReason::UselessPeer),
            Instant::now() - Duration::from_secs(3600),
        );
        stats.push_event_at(
            RecordedEvent::Disconnect(DisconnectDirection::Local, DisconnectReason::Other),
            Instant::now() - Duration::from_secs(3599),
        );
        // the newest event's window (100 ms) has long elapsed, even though
        // the older UselessPeer window would still be open
        assert_eq!(stats.is_connection_delayed(), (false, None));
    }

    #[test]
    fn registry_persists_entries_across_lookups() {
        let registry = NodeStatsRegistry::new();
        let key = H512::from_low_u64_be(9);
        registry
            .stats_for(key)
            .add_transfer_speed(TransferSpeedKind::Headers, 5);
        registry
            .stats_for(key)
            .add_transfer_speed(TransferSpeedKind::Headers, 5);
        assert_eq!(
            registry
                .stats_for(key)
                .average_transfer_speed(TransferSpeedKind::Headers),
            Some(5)
        );
    }
}
