//! Metrics Collection for the Burrow Relay
//!
//! Atomic counters per terminal request outcome plus a latency ring buffer,
//! rendered as Prometheus text at `/_burrow/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// How a proxied request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Agent response relayed to the caller
    Proxied,
    /// No agent was connected
    NoAgent,
    /// Tunnel failure or agent-reported error
    GatewayError,
    /// Agent's upstream refused the connection
    UpstreamRefused,
    /// Per-request deadline expired
    GatewayTimeout,
    /// Caller hung up before the reply arrived
    ClientClosed,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Outcome::Proxied => "proxied",
            Outcome::NoAgent => "no_agent",
            Outcome::GatewayError => "gateway_error",
            Outcome::UpstreamRefused => "upstream_refused",
            Outcome::GatewayTimeout => "gateway_timeout",
            Outcome::ClientClosed => "client_closed",
        }
    }

    /// In discriminant order, matching the counter array
    const ALL: [Outcome; 6] = [
        Outcome::Proxied,
        Outcome::NoAgent,
        Outcome::GatewayError,
        Outcome::UpstreamRefused,
        Outcome::GatewayTimeout,
        Outcome::ClientClosed,
    ];
}

/// Relay-wide metrics
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    outcomes: [AtomicU64; 6],
    tunnel_connects: AtomicU64,
    tunnel_disconnects: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    latencies: Mutex<LatencyHistogram>,
}

/// Latency histogram for percentile calculation
struct LatencyHistogram {
    /// Recent latencies (ring buffer, microseconds)
    values: Vec<u64>,
    pos: usize,
    count: u64,
    sum: u64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            pos: 0,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.values[self.pos] = latency_us;
        self.pos = (self.pos + 1) % self.values.len();
        self.count += 1;
        self.sum = self.sum.saturating_add(latency_us);
    }

    fn percentile(&self, p: f64) -> u64 {
        let count = self.count.min(self.values.len() as u64) as usize;
        if count == 0 {
            return 0;
        }

        let mut sorted = self.values[..count].to_vec();
        sorted.sort_unstable();

        let idx = ((count as f64 * p / 100.0) as usize).min(count - 1);
        sorted[idx]
    }

    fn average(&self) -> u64 {
        if self.count == 0 { 0 } else { self.sum / self.count }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request that reached its terminal outcome
    pub async fn record_request(&self, outcome: Outcome, latency_us: u64, bytes_in: u64, bytes_out: u64) {
        self.record_outcome(outcome, bytes_in, bytes_out);
        self.inner.latencies.lock().await.record(latency_us);
    }

    /// Count an outcome without a latency sample. Safe to call from `Drop`.
    pub fn record_outcome(&self, outcome: Outcome, bytes_in: u64, bytes_out: u64) {
        self.inner.outcomes[outcome as usize].fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.inner.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    pub fn tunnel_opened(&self) {
        self.inner.tunnel_connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_closed(&self) {
        self.inner.tunnel_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outcome_count(&self, outcome: Outcome) -> u64 {
        self.inner.outcomes[outcome as usize].load(Ordering::Relaxed)
    }

    /// Generate Prometheus-format metrics text
    pub async fn to_prometheus(&self, connected: bool, pending: usize) -> String {
        let lat = self.inner.latencies.lock().await;
        let (p50, p95, p99, avg) = (lat.percentile(50.0), lat.percentile(95.0), lat.percentile(99.0), lat.average());
        drop(lat);

        let mut out = String::new();
        out.push_str("# HELP burrow_requests_total Proxied requests by terminal outcome\n");
        out.push_str("# TYPE burrow_requests_total counter\n");
        for outcome in Outcome::ALL {
            out.push_str(&format!(
                "burrow_requests_total{{outcome=\"{}\"}} {}\n",
                outcome.label(),
                self.outcome_count(outcome)
            ));
        }

        out.push_str(&format!(
            r#"
# HELP burrow_agent_connected Whether an agent tunnel is open
# TYPE burrow_agent_connected gauge
burrow_agent_connected {}

# HELP burrow_pending_requests Requests waiting on the agent
# TYPE burrow_pending_requests gauge
burrow_pending_requests {}

# HELP burrow_tunnel_connections_total Tunnel connection events
# TYPE burrow_tunnel_connections_total counter
burrow_tunnel_connections_total{{event="open"}} {}
burrow_tunnel_connections_total{{event="close"}} {}

# HELP burrow_bytes_total Total body bytes transferred
# TYPE burrow_bytes_total counter
burrow_bytes_total{{direction="in"}} {}
burrow_bytes_total{{direction="out"}} {}

# HELP burrow_latency_us Request latency in microseconds
# TYPE burrow_latency_us summary
burrow_latency_us{{quantile="0.5"}} {}
burrow_latency_us{{quantile="0.95"}} {}
burrow_latency_us{{quantile="0.99"}} {}
burrow_latency_us_avg {}
"#,
            u8::from(connected),
            pending,
            self.inner.tunnel_connects.load(Ordering::Relaxed),
            self.inner.tunnel_disconnects.load(Ordering::Relaxed),
            self.inner.bytes_in.load(Ordering::Relaxed),
            self.inner.bytes_out.load(Ordering::Relaxed),
            p50, p95, p99, avg,
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles() {
        let mut h = LatencyHistogram::new(100);
        for v in 1..=100 {
            h.record(v);
        }
        assert_eq!(h.percentile(50.0), 51);
        assert_eq!(h.percentile(99.0), 100);
        assert_eq!(h.average(), 50);
    }

    #[test]
    fn test_ring_buffer_wraps() {
        let mut h = LatencyHistogram::new(4);
        for v in [1000, 1000, 1000, 1000, 1, 1, 1, 1] {
            h.record(v);
        }
        assert_eq!(h.percentile(99.0), 1);
        assert_eq!(LatencyHistogram::new(4).percentile(50.0), 0);
    }

    #[tokio::test]
    async fn test_prometheus_output() {
        let metrics = Metrics::new();
        metrics.record_request(Outcome::Proxied, 1200, 10, 3).await;
        metrics.record_request(Outcome::GatewayTimeout, 5000, 0, 0).await;
        metrics.tunnel_opened();

        let text = metrics.to_prometheus(true, 2).await;
        assert!(text.contains(r#"burrow_requests_total{outcome="proxied"} 1"#));
        assert!(text.contains(r#"burrow_requests_total{outcome="gateway_timeout"} 1"#));
        assert!(text.contains(r#"burrow_requests_total{outcome="no_agent"} 0"#));
        assert!(text.contains("burrow_agent_connected 1"));
        assert!(text.contains("burrow_pending_requests 2"));
        assert!(text.contains(r#"burrow_bytes_total{direction="in"} 10"#));
    }

    #[tokio::test]
    async fn test_abandoned_request_counted_without_latency() {
        let metrics = Metrics::new();
        metrics.record_outcome(Outcome::ClientClosed, 7, 0);

        assert_eq!(metrics.outcome_count(Outcome::ClientClosed), 1);
        let text = metrics.to_prometheus(false, 0).await;
        assert!(text.contains(r#"burrow_requests_total{outcome="client_closed"} 1"#));
        assert!(text.contains(r#"burrow_bytes_total{direction="in"} 7"#));
        assert!(text.contains("burrow_latency_us_avg 0"));
    }
}
