//! Prometheus metrics for meshmq
//!
//! Counters and gauges for the delivery core. [`Metrics::encode_text`]
//! renders the exposition format for whatever endpoint the embedding
//! application serves it on.

use prometheus::core::Collector;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::queue::DropReason;

/// All meshmq metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Connection and session metrics
    pub connections_total: IntCounter,
    pub connections_current: IntGauge,
    pub sessions_current: IntGauge,
    pub sessions_expired_total: IntCounter,
    pub sessions_taken_over_total: IntCounter,

    // Message metrics
    pub messages_published_total: IntCounter,
    pub messages_delivered_total: IntCounter,
    pub messages_dropped_total: IntCounterVec,
    pub messages_acked_total: IntCounter,
    pub messages_redelivered_total: IntCounter,
    pub messages_unrouted_total: IntCounter,

    // Subscription metrics
    pub subscriptions_current: IntGauge,
    pub retained_messages_current: IntGauge,

    // Hook metrics
    pub hook_denials_total: IntCounterVec,

    // Federation metrics
    pub federation_events_appended_total: IntCounterVec,
    pub federation_events_acked_total: IntCounterVec,
    pub federation_messages_received_total: IntCounter,
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> prometheus::Result<C> {
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    register(registry, IntCounter::with_opts(Opts::new(name, help))?)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    register(registry, IntGauge::with_opts(Opts::new(name, help))?)
}

fn counter_vec(registry: &Registry, name: &str, help: &str, label: &str) -> prometheus::Result<IntCounterVec> {
    register(registry, IntCounterVec::new(Opts::new(name, help), &[label])?)
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let r = &registry;

        Ok(Metrics {
            connections_total: counter(
                r,
                "meshmq_connections_total",
                "Total number of client connections since startup",
            )?,
            connections_current: gauge(r, "meshmq_connections_current", "Current number of connected clients")?,
            sessions_current: gauge(r, "meshmq_sessions_current", "Sessions held, connected or not")?,
            sessions_expired_total: counter(
                r,
                "meshmq_sessions_expired_total",
                "Total sessions expired since startup",
            )?,
            sessions_taken_over_total: counter(
                r,
                "meshmq_sessions_taken_over_total",
                "Connections closed because the client id reconnected elsewhere",
            )?,
            messages_published_total: counter(
                r,
                "meshmq_messages_published_total",
                "Messages accepted into the dispatch core",
            )?,
            messages_delivered_total: counter(
                r,
                "meshmq_messages_delivered_total",
                "PUBLISH transmissions handed to connections",
            )?,
            messages_dropped_total: counter_vec(
                r,
                "meshmq_messages_dropped_total",
                "Queued messages dropped by reason",
                "reason",
            )?,
            messages_acked_total: counter(
                r,
                "meshmq_messages_acked_total",
                "QoS 1/2 deliveries completed by the client",
            )?,
            messages_redelivered_total: counter(
                r,
                "meshmq_messages_redelivered_total",
                "Inflight messages sent again after their deadline",
            )?,
            messages_unrouted_total: counter(
                r,
                "meshmq_messages_unrouted_total",
                "Published messages with no matching subscriber",
            )?,
            subscriptions_current: gauge(
                r,
                "meshmq_subscriptions_current",
                "Current number of active subscriptions",
            )?,
            retained_messages_current: gauge(
                r,
                "meshmq_retained_messages_current",
                "Current number of retained messages",
            )?,
            hook_denials_total: counter_vec(r, "meshmq_hook_denials_total", "Events rejected by plugins", "hook")?,
            federation_events_appended_total: counter_vec(
                r,
                "meshmq_federation_events_appended_total",
                "Events appended to a peer's replication log",
                "peer",
            )?,
            federation_events_acked_total: counter_vec(
                r,
                "meshmq_federation_events_acked_total",
                "Events confirmed by a peer",
                "peer",
            )?,
            federation_messages_received_total: counter(
                r,
                "meshmq_federation_messages_received_total",
                "Messages accepted from federation peers",
            )?,
            registry,
        })
    }

    pub fn client_connected(&self) {
        self.connections_total.inc();
        self.connections_current.inc();
    }

    pub fn client_disconnected(&self) {
        self.connections_current.dec();
    }

    pub fn message_dropped(&self, reason: DropReason) {
        self.messages_dropped_total
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    pub fn hook_denied(&self, hook: &str) {
        self.hook_denials_total.with_label_values(&[hook]).inc();
    }

    pub fn federation_appended(&self, peer: &str, count: usize) {
        self.federation_events_appended_total
            .with_label_values(&[peer])
            .inc_by(count as u64);
    }

    pub fn federation_acked(&self, peer: &str, count: u64) {
        self.federation_events_acked_total
            .with_label_values(&[peer])
            .inc_by(count);
    }

    /// Render every metric in the Prometheus text format
    pub fn encode_text(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
