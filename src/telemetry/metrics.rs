//! Metrics sinks
//!
//! Counters and gauges are pushed from every component through a
//! [`MetricsSink`]. Two real backends exist:
//!
//! - [`MetricsRegistry`]: in-memory series rendered in Prometheus text
//!   format (version 0.0.4) by the status server's `/metrics` endpoint
//! - [`StatsdSink`]: fire-and-forget DogStatsD lines over UDP
//!
//! Emission never fails from the caller's point of view.

use std::collections::BTreeMap;
use std::io;
use std::net::UdpSocket;
use std::sync::{Arc, Mutex};

/// Metric tags, kept sorted so a tag set identifies a series.
pub type Tags = BTreeMap<String, String>;

/// Build a tag set from string pairs.
pub fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// Destination for counter increments and gauge values.
pub trait MetricsSink: Send + Sync {
    fn incr(&self, name: &str, count: i64, tags: &Tags);

    fn gauge(&self, name: &str, value: i64, tags: &Tags);
}

pub type SharedMetrics = Arc<dyn MetricsSink>;

// ============================================================================
// Noop / Fanout
// ============================================================================

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr(&self, _name: &str, _count: i64, _tags: &Tags) {}

    fn gauge(&self, _name: &str, _value: i64, _tags: &Tags) {}
}

/// Sends every call to each inner sink in turn.
#[derive(Clone, Default)]
pub struct FanoutMetrics {
    sinks: Vec<SharedMetrics>,
}

impl FanoutMetrics {
    pub fn new(sinks: Vec<SharedMetrics>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: SharedMetrics) {
        self.sinks.push(sink);
    }
}

impl MetricsSink for FanoutMetrics {
    fn incr(&self, name: &str, count: i64, tags: &Tags) {
        for sink in &self.sinks {
            sink.incr(name, count, tags);
        }
    }

    fn gauge(&self, name: &str, value: i64, tags: &Tags) {
        for sink in &self.sinks {
            sink.gauge(name, value, tags);
        }
    }
}

// ============================================================================
// In-Memory Registry (Prometheus)
// ============================================================================

type SeriesKey = (String, Tags);

/// In-memory counters and gauges.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: Mutex<BTreeMap<SeriesKey, i64>>,
    gauges: Mutex<BTreeMap<SeriesKey, i64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter series (0 when never incremented).
    pub fn counter(&self, name: &str, tags: &Tags) -> i64 {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(name.to_string(), tags.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of a counter over every tag set.
    pub fn counter_total(&self, name: &str) -> i64 {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, v)| *v)
            .sum()
    }

    pub fn gauge_value(&self, name: &str, tags: &Tags) -> Option<i64> {
        self.gauges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(name.to_string(), tags.clone()))
            .copied()
    }

    /// Render every series in Prometheus text format.
    ///
    /// Counters get a `_total` suffix. Series are grouped per metric name
    /// with one `# TYPE` line each.
    pub fn render_prometheus(&self, namespace: &str) -> String {
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let gauges = self.gauges.lock().unwrap_or_else(|e| e.into_inner()).clone();

        let mut body = String::with_capacity(1024);
        render_family(&mut body, namespace, "_total", "counter", &counters);
        render_family(&mut body, namespace, "", "gauge", &gauges);
        body
    }
}

fn render_family(
    body: &mut String,
    namespace: &str,
    suffix: &str,
    kind: &str,
    series: &BTreeMap<SeriesKey, i64>,
) {
    let mut current: Option<&str> = None;
    for ((name, tags), value) in series {
        let metric = format!("{}_{}{}", sanitize(namespace), sanitize(name), suffix);
        if current != Some(name.as_str()) {
            body.push_str(&format!("# TYPE {metric} {kind}\n"));
            current = Some(name.as_str());
        }
        if tags.is_empty() {
            body.push_str(&format!("{metric} {value}\n"));
        } else {
            let labels = tags
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", sanitize(k), escape_label(v)))
                .collect::<Vec<_>>()
                .join(",");
            body.push_str(&format!("{metric}{{{labels}}} {value}\n"));
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

impl MetricsSink for MetricsRegistry {
    fn incr(&self, name: &str, count: i64, tags: &Tags) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        *counters.entry((name.to_string(), tags.clone())).or_insert(0) += count;
    }

    fn gauge(&self, name: &str, value: i64, tags: &Tags) {
        self.gauges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((name.to_string(), tags.clone()), value);
    }
}

// ============================================================================
// StatsD (DogStatsD tag format)
// ============================================================================

/// UDP StatsD client.
///
/// Lines look like `asg_healthcheck_probe_run:1|c|#name:nginx,successful:true`.
/// The socket is non-blocking; a datagram that cannot be sent is dropped.
#[derive(Debug)]
pub struct StatsdSink {
    socket: UdpSocket,
    prefix: String,
    default_tags: Tags,
}

impl StatsdSink {
    /// Bind an ephemeral local socket and connect it to `addr` (`host:port`).
    ///
    /// A prefix that does not already end with `_` gets one appended.
    pub fn connect(addr: &str, prefix: &str, default_tags: Tags) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(addr)?;
        socket.set_nonblocking(true)?;

        let mut prefix = prefix.to_string();
        if !prefix.is_empty() && !prefix.ends_with('_') {
            prefix.push('_');
        }

        Ok(Self {
            socket,
            prefix,
            default_tags,
        })
    }

    pub(crate) fn format_line(&self, name: &str, value: i64, kind: &str, tags: &Tags) -> String {
        let mut merged = self.default_tags.clone();
        merged.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut line = format!("{}{}:{}|{}", self.prefix, name, value, kind);
        if !merged.is_empty() {
            let rendered = merged
                .iter()
                .map(|(k, v)| format!("{k}:{v}"))
                .collect::<Vec<_>>()
                .join(",");
            line.push_str("|#");
            line.push_str(&rendered);
        }
        line
    }

    fn send(&self, line: &str) {
        if let Err(e) = self.socket.send(line.as_bytes()) {
            tracing::debug!(error = %e, metric = %line, "Dropped statsd datagram");
        }
    }
}

impl MetricsSink for StatsdSink {
    fn incr(&self, name: &str, count: i64, tags: &Tags) {
        self.send(&self.format_line(name, count, "c", tags));
    }

    /// StatsD treats a leading sign as a delta, so gauges are expected to
    /// be non-negative.
    fn gauge(&self, name: &str, value: i64, tags: &Tags) {
        self.send(&self.format_line(name, value, "g", tags));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_registry_counts_per_tag_set() {
        let registry = MetricsRegistry::new();
        let ok = tags(&[("name", "disk"), ("successful", "true")]);
        let bad = tags(&[("name", "disk"), ("successful", "false")]);

        registry.incr("probe_run", 1, &ok);
        registry.incr("probe_run", 1, &ok);
        registry.incr("probe_run", 1, &bad);

        assert_eq!(registry.counter("probe_run", &ok), 2);
        assert_eq!(registry.counter("probe_run", &bad), 1);
        assert_eq!(registry.counter_total("probe_run"), 3);
        assert_eq!(registry.counter_total("remediation_run"), 0);
    }

    #[test]
    fn test_registry_gauge_overwrites() {
        let registry = MetricsRegistry::new();
        let t = tags(&[("healthy", "true")]);
        registry.gauge("heartbeat", 10, &t);
        registry.gauge("heartbeat", 42, &t);
        assert_eq!(registry.gauge_value("heartbeat", &t), Some(42));
    }

    #[test]
    fn test_prometheus_rendering() {
        let registry = MetricsRegistry::new();
        registry.incr("starting", 1, &Tags::new());
        registry.incr("probe_run", 3, &tags(&[("name", "web \"check\"")]));
        registry.gauge("heartbeat", 7, &tags(&[("healthy", "true")]));

        let body = registry.render_prometheus("asg_agent");
        assert!(body.contains("# TYPE asg_agent_starting_total counter\n"));
        assert!(body.contains("asg_agent_starting_total 1\n"));
        assert!(body.contains("asg_agent_probe_run_total{name=\"web \\\"check\\\"\"} 3\n"));
        assert!(body.contains("# TYPE asg_agent_heartbeat gauge\n"));
        assert!(body.contains("asg_agent_heartbeat{healthy=\"true\"} 7\n"));
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(MetricsRegistry::new());
        let b = Arc::new(MetricsRegistry::new());
        let fanout = FanoutMetrics::new(vec![a.clone(), b.clone()]);
        fanout.incr("stopping", 1, &Tags::new());
        assert_eq!(a.counter_total("stopping"), 1);
        assert_eq!(b.counter_total("stopping"), 1);
    }

    #[test]
    fn test_statsd_line_format() {
        let sink = StatsdSink::connect(
            "127.0.0.1:8125",
            "asg_healthcheck",
            tags(&[("source", "host-a")]),
        )
        .unwrap();
        let line = sink.format_line("probe_run", 1, "c", &tags(&[("name", "disk")]));
        assert_eq!(line, "asg_healthcheck_probe_run:1|c|#name:disk,source:host-a");
    }

    #[test]
    fn test_statsd_sends_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let addr = receiver.local_addr().unwrap().to_string();

        let sink = StatsdSink::connect(&addr, "agent_", Tags::new()).unwrap();
        sink.gauge("heartbeat", 5, &Tags::new());

        let mut buf = [0u8; 256];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(std::str::from_utf8(&buf[..n]).unwrap(), "agent_heartbeat:5|g");
    }
}
