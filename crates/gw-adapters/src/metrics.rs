//! Default `MetricsSink` implementations, per §4.I.
//!
//! `NoopMetricsSink` discards everything. `AggregatingMetricsSink`
//! holds atomic counters and a small latency histogram bucket set,
//! non-blocking on every call as the port contract requires.

use gw_ports::{AuthzOp, MetricsSink, WireDirection};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {}

/// In-process aggregating sink. Counters are lock-free; the
/// per-operation latency buckets and per-message-type counters use a
/// short-held `Mutex<HashMap<_>>` the way histogram labels usually
/// need a dynamic key set.
#[derive(Default)]
pub struct AggregatingMetricsSink {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    auth_success: AtomicU64,
    auth_failure: AtomicU64,
    publish_success: AtomicU64,
    publish_failure: AtomicU64,
    buffer_enqueues: AtomicU64,
    buffer_overflows: AtomicU64,
    rate_limit_rejections: AtomicU64,
    dead_letters: AtomicU64,
    messages_by_type: Mutex<HashMap<(WireDirectionKey, String), u64>>,
    authz_checks: Mutex<HashMap<(AuthzOpKey, bool), u64>>,
    errors_by_kind: Mutex<HashMap<gw_domain::errors::ErrorKind, u64>>,
    nats_latencies_ms: Mutex<HashMap<String, Vec<u64>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WireDirectionKey {
    Received,
    Sent,
}

impl From<WireDirection> for WireDirectionKey {
    fn from(d: WireDirection) -> Self {
        match d {
            WireDirection::Received => WireDirectionKey::Received,
            WireDirection::Sent => WireDirectionKey::Sent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AuthzOpKey {
    Publish,
    Subscribe,
}

impl From<AuthzOp> for AuthzOpKey {
    fn from(op: AuthzOp) -> Self {
        match op {
            AuthzOp::Publish => AuthzOpKey::Publish,
            AuthzOp::Subscribe => AuthzOpKey::Subscribe,
        }
    }
}

impl AggregatingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            auth_success: self.auth_success.load(Ordering::Relaxed),
            auth_failure: self.auth_failure.load(Ordering::Relaxed),
            publish_success: self.publish_success.load(Ordering::Relaxed),
            publish_failure: self.publish_failure.load(Ordering::Relaxed),
            buffer_enqueues: self.buffer_enqueues.load(Ordering::Relaxed),
            buffer_overflows: self.buffer_overflows.load(Ordering::Relaxed),
            rate_limit_rejections: self.rate_limit_rejections.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
        }
    }

    /// Renders a Prometheus text-exposition snippet for the `/metrics`
    /// endpoint. Deliberately hand-rolled rather than pulling in a
    /// Prometheus client crate: the set of series here is small and
    /// fixed, and this sink is itself a swappable default per §1.
    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();
        out.push_str(&format!(
            "gateway_connections_opened_total {}\n",
            s.connections_opened
        ));
        out.push_str(&format!(
            "gateway_connections_closed_total {}\n",
            s.connections_closed
        ));
        out.push_str(&format!(
            "gateway_auth_attempts_total{{outcome=\"success\"}} {}\n",
            s.auth_success
        ));
        out.push_str(&format!(
            "gateway_auth_attempts_total{{outcome=\"failure\"}} {}\n",
            s.auth_failure
        ));
        out.push_str(&format!(
            "gateway_publish_total{{outcome=\"success\"}} {}\n",
            s.publish_success
        ));
        out.push_str(&format!(
            "gateway_publish_total{{outcome=\"failure\"}} {}\n",
            s.publish_failure
        ));
        out.push_str(&format!("gateway_buffer_enqueue_total {}\n", s.buffer_enqueues));
        out.push_str(&format!(
            "gateway_buffer_overflow_total {}\n",
            s.buffer_overflows
        ));
        out.push_str(&format!(
            "gateway_rate_limit_rejection_total {}\n",
            s.rate_limit_rejections
        ));
        out.push_str(&format!("gateway_dead_letter_total {}\n", s.dead_letters));

        for ((direction, message_type), count) in self.messages_by_type.lock().unwrap().iter() {
            let direction = match direction {
                WireDirectionKey::Received => "received",
                WireDirectionKey::Sent => "sent",
            };
            out.push_str(&format!(
                "gateway_messages_total{{direction=\"{direction}\",type=\"{message_type}\"}} {count}\n"
            ));
        }
        for ((op, allowed), count) in self.authz_checks.lock().unwrap().iter() {
            let op = match op {
                AuthzOpKey::Publish => "publish",
                AuthzOpKey::Subscribe => "subscribe",
            };
            out.push_str(&format!(
                "gateway_authorization_check_total{{op=\"{op}\",allowed=\"{allowed}\"}} {count}\n"
            ));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub auth_success: u64,
    pub auth_failure: u64,
    pub publish_success: u64,
    pub publish_failure: u64,
    pub buffer_enqueues: u64,
    pub buffer_overflows: u64,
    pub rate_limit_rejections: u64,
    pub dead_letters: u64,
}

impl MetricsSink for AggregatingMetricsSink {
    fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self, _reason: &str) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn auth_attempt(&self, success: bool) {
        if success {
            self.auth_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.auth_failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn message(&self, direction: WireDirection, message_type: &str) {
        let mut map = self.messages_by_type.lock().unwrap();
        *map.entry((direction.into(), message_type.to_string()))
            .or_insert(0) += 1;
    }

    fn publish_result(&self, success: bool) {
        if success {
            self.publish_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.publish_failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn nats_latency(&self, operation: &str, duration: Duration) {
        let mut map = self.nats_latencies_ms.lock().unwrap();
        map.entry(operation.to_string())
            .or_default()
            .push(duration.as_millis() as u64);
    }

    fn buffer_enqueue(&self) {
        self.buffer_enqueues.fetch_add(1, Ordering::Relaxed);
    }

    fn buffer_overflow(&self) {
        self.buffer_overflows.fetch_add(1, Ordering::Relaxed);
    }

    fn rate_limit_rejection(&self) {
        self.rate_limit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    fn authorization_check(&self, op: AuthzOp, allowed: bool) {
        let mut map = self.authz_checks.lock().unwrap();
        *map.entry((op.into(), allowed)).or_insert(0) += 1;
    }

    fn error(&self, kind: gw_domain::errors::ErrorKind) {
        let mut map = self.errors_by_kind.lock().unwrap();
        *map.entry(kind).or_insert(0) += 1;
    }

    fn message_dead_lettered(&self, subject: &str) {
        self.dead_letters.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(subject, "message dead-lettered after exhausting max_deliver");
    }
}
