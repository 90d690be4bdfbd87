//! Prometheus metrics
//!
//! Counters and gauges live in a per-broker [`Registry`];
//! [`Metrics::gather_text`] renders the text exposition format.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub connections_current: IntGauge,
    pub connections_maximum: IntGauge,

    // Publish metrics
    pub publish_messages_received: IntCounter,
    pub publish_messages_sent: IntCounter,
    pub publish_messages_dropped: IntCounter,
    pub messages_bytes_received: IntCounter,
    pub messages_bytes_sent: IntCounter,

    // Subscription metrics
    pub subscriptions_current: IntGauge,
    pub subscriptions_total: IntCounter,

    // In-band requests by action and status
    pub requests_total: IntCounterVec,

    // Storage
    pub messages_stored_total: IntCounter,

    // Cluster metrics
    pub cluster_peers_current: IntGauge,
    pub cluster_messages_forwarded: IntCounter,
    pub cluster_messages_received: IntCounter,
    pub surveys_total: IntCounter,
    pub bans_total: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let c = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let g = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new(
                "vibemesh_requests_total",
                "In-band emitter requests by action and status",
            ),
            &["action", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        Ok(Metrics {
            connections_total: counter(
                &registry,
                "vibemesh_connections_total",
                "Total number of client connections since startup",
            )?,
            connections_current: gauge(
                &registry,
                "vibemesh_connections_current",
                "Current number of connected clients",
            )?,
            connections_maximum: gauge(
                &registry,
                "vibemesh_connections_maximum",
                "Maximum concurrent connections since startup",
            )?,
            publish_messages_received: counter(
                &registry,
                "vibemesh_publish_messages_received_total",
                "Total PUBLISH packets received",
            )?,
            publish_messages_sent: counter(
                &registry,
                "vibemesh_publish_messages_sent_total",
                "Total messages delivered to local subscribers",
            )?,
            publish_messages_dropped: counter(
                &registry,
                "vibemesh_publish_messages_dropped_total",
                "Total messages dropped on full outbound buffers",
            )?,
            messages_bytes_received: counter(
                &registry,
                "vibemesh_messages_bytes_received_total",
                "Channel and payload bytes received",
            )?,
            messages_bytes_sent: counter(
                &registry,
                "vibemesh_messages_bytes_sent_total",
                "Channel and payload bytes delivered",
            )?,
            subscriptions_current: gauge(
                &registry,
                "vibemesh_subscriptions_current",
                "Current number of local subscriptions",
            )?,
            subscriptions_total: counter(
                &registry,
                "vibemesh_subscriptions_total",
                "Total subscriptions since startup",
            )?,
            requests_total,
            messages_stored_total: counter(
                &registry,
                "vibemesh_messages_stored_total",
                "Messages appended to storage",
            )?,
            cluster_peers_current: gauge(
                &registry,
                "vibemesh_cluster_peers_current",
                "Current number of known cluster peers",
            )?,
            cluster_messages_forwarded: counter(
                &registry,
                "vibemesh_cluster_messages_forwarded_total",
                "Messages queued to cluster peers",
            )?,
            cluster_messages_received: counter(
                &registry,
                "vibemesh_cluster_messages_received_total",
                "Messages received from cluster peers",
            )?,
            surveys_total: counter(&registry, "vibemesh_surveys_total", "Surveys issued")?,
            bans_total: counter(&registry, "vibemesh_bans_total", "Key bans and unbans that changed state")?,
            registry,
        })
    }

    pub fn client_connected(&self) {
        self.connections_total.inc();
        self.connections_current.inc();
        let current = self.connections_current.get();
        if current > self.connections_maximum.get() {
            self.connections_maximum.set(current);
        }
    }

    pub fn client_disconnected(&self) {
        self.connections_current.dec();
    }

    pub fn publish_received(&self, bytes: usize) {
        self.publish_messages_received.inc();
        self.messages_bytes_received.inc_by(bytes as u64);
    }

    pub fn publish_sent(&self, bytes: usize) {
        self.publish_messages_sent.inc();
        self.messages_bytes_sent.inc_by(bytes as u64);
    }

    pub fn publish_dropped(&self) {
        self.publish_messages_dropped.inc();
    }

    pub fn subscription_added(&self) {
        self.subscriptions_current.inc();
        self.subscriptions_total.inc();
    }

    pub fn subscription_removed(&self) {
        self.subscriptions_current.dec();
    }

    pub fn request(&self, action: &str, status: u16) {
        self.requests_total
            .with_label_values(&[action, &status.to_string()])
            .inc();
    }

    /// Text exposition of every registered metric.
    pub fn gather_text(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_text() {
        let metrics = Metrics::new().unwrap();
        metrics.client_connected();
        metrics.client_connected();
        metrics.client_disconnected();
        metrics.request("keygen", 200);

        assert_eq!(metrics.connections_current.get(), 1);
        assert_eq!(metrics.connections_maximum.get(), 2);

        let text = metrics.gather_text();
        assert!(text.contains("vibemesh_connections_total 2"));
        assert!(text.contains("vibemesh_requests_total{action=\"keygen\",status=\"200\"} 1"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.publish_received(10);
        assert_eq!(b.publish_messages_received.get(), 0);
    }
}
