//! # Prometheus Metrics
//!
//! Operational metrics for a paynode process, registered in a dedicated
//! [`prometheus::Registry`] under the `paynode` namespace and served at
//! `/metrics`.
//!
//! Session and channel gauges are sampled from the node when scraped; the
//! counters are bumped by the API handlers as things happen.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use paynode_protocol::{ErrorCategory, LockState, Node};

/// Holds every metric handle of the node.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Sessions currently open.
    pub sessions_open: IntGauge,
    /// Channels not yet closed, across all sessions.
    pub channels_open: IntGauge,
    /// API errors returned, by category.
    pub api_errors_total: IntCounterVec,
    /// Notifications pushed to WebSocket subscribers, by stream.
    pub notifications_pushed_total: IntCounterVec,
}

impl NodeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("paynode".into()), None)?;

        let sessions_open = IntGauge::new("sessions_open", "Number of open sessions")?;
        registry.register(Box::new(sessions_open.clone()))?;

        let channels_open = IntGauge::new(
            "channels_open",
            "Number of channels in open or finalized state across all sessions",
        )?;
        registry.register(Box::new(channels_open.clone()))?;

        let api_errors_total = IntCounterVec::new(
            Opts::new("api_errors_total", "API errors returned to callers"),
            &["category"],
        )?;
        registry.register(Box::new(api_errors_total.clone()))?;

        let notifications_pushed_total = IntCounterVec::new(
            Opts::new(
                "notifications_pushed_total",
                "Notifications written to WebSocket subscribers",
            ),
            &["stream"],
        )?;
        registry.register(Box::new(notifications_pushed_total.clone()))?;

        Ok(Self {
            registry,
            sessions_open,
            channels_open,
            api_errors_total,
            notifications_pushed_total,
        })
    }

    pub fn record_error(&self, category: ErrorCategory) {
        self.api_errors_total
            .with_label_values(&[&category.to_string()])
            .inc();
    }

    pub fn record_notification(&self, stream: &str) {
        self.notifications_pushed_total
            .with_label_values(&[stream])
            .inc();
    }

    /// Refresh the gauges from the node's current state.
    pub fn sample(&self, node: &Node) {
        let sessions = node.sessions();
        let channels: usize = sessions
            .iter()
            .map(|s| {
                s.get_channels()
                    .iter()
                    .filter(|c| c.lock_state != LockState::Closed)
                    .count()
            })
            .sum();
        self.sessions_open.set(sessions.len() as i64);
        self.channels_open.set(channels as i64);
    }

    /// Encode every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
