use std::sync::LazyLock;

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::default);

/// Operator-visible counters, one per request/response kind plus session
/// lifecycle events. Labels carry the wire name of the message
/// (`eth66_get_block_headers`, `snap_get_account_range`, ...).
#[derive(Debug)]
pub struct Metrics {
    _registry: Registry,

    pub messages_sent: IntCounterVec,
    pub messages_received: IntCounterVec,
    pub messages_dropped: IntCounterVec,

    pub sessions_established: IntCounter,
    pub disconnects: IntCounterVec,
    pub incoming_queue_full: IntCounter,
    pub request_timeouts: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let registry = Registry::new();

        let messages_sent = IntCounterVec::new(
            Opts::new("p2p_messages_sent", "Wire messages sent, by kind"),
            &["message"],
        )
        .expect("valid metric definition");
        let messages_received = IntCounterVec::new(
            Opts::new("p2p_messages_received", "Wire messages received, by kind"),
            &["message"],
        )
        .expect("valid metric definition");
        let messages_dropped = IntCounterVec::new(
            Opts::new(
                "p2p_messages_dropped",
                "Messages dropped before processing (unknown ids, bad frames)",
            ),
            &["message"],
        )
        .expect("valid metric definition");
        let sessions_established = IntCounter::new(
            "p2p_sessions_established",
            "Sessions that completed the p2p handshake",
        )
        .expect("valid metric definition");
        let disconnects = IntCounterVec::new(
            Opts::new("p2p_disconnects", "Session disconnects, by wire reason"),
            &["reason"],
        )
        .expect("valid metric definition");
        let incoming_queue_full = IntCounter::new(
            "p2p_incoming_queue_full",
            "Sessions dropped because the backpressure queue overflowed",
        )
        .expect("valid metric definition");
        let request_timeouts = IntCounterVec::new(
            Opts::new("p2p_request_timeouts", "Requests that timed out, by kind"),
            &["message"],
        )
        .expect("valid metric definition");

        for collector in [
            &messages_sent,
            &messages_received,
            &messages_dropped,
            &disconnects,
            &request_timeouts,
        ] {
            let _ = registry.register(Box::new(collector.clone()));
        }
        let _ = registry.register(Box::new(sessions_established.clone()));
        let _ = registry.register(Box::new(incoming_queue_full.clone()));

        Self {
            _registry: registry,
            messages_sent,
            messages_received,
            messages_dropped,
            sessions_established,
            disconnects,
            incoming_queue_full,
            request_timeouts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label() {
        let metrics = Metrics::default();
        metrics
            .messages_sent
            .with_label_values(&["eth66_get_block_headers"])
            .inc();
        metrics
            .messages_sent
            .with_label_values(&["eth66_get_block_headers"])
            .inc();
        assert_eq!(
            metrics
                .messages_sent
                .with_label_values(&["eth66_get_block_headers"])
                .get(),
            2
        );
    }
}
