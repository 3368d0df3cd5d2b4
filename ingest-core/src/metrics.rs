// ingest-core/src/metrics.rs
// Runtime counters for the ingest control plane

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters, shared across gateway, rules engine, router and
/// sink. Every drop or failure path increments a counter in addition to
/// its log line, so "no silent drops" is checkable from the outside.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    // Gateway
    pub auth_success: AtomicU64,
    pub auth_failures: AtomicU64,
    pub events_received: AtomicU64,
    pub events_rejected: AtomicU64,
    pub events_published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub heartbeats_seen: AtomicU64,

    // Sessions
    pub sessions_opened: AtomicU64,
    pub sessions_supplanted: AtomicU64,
    pub sessions_closed: AtomicU64,

    // Rules engine
    pub rule_matches: AtomicU64,
    pub alerts_emitted: AtomicU64,
    pub mitigations_enqueued: AtomicU64,
    pub mitigations_dropped: AtomicU64,

    // Command router
    pub commands_forwarded: AtomicU64,
    pub command_send_failures: AtomicU64,
    pub responses_audited: AtomicU64,

    // Columnar sink
    pub rows_inserted: AtomicU64,
    pub insert_failures: AtomicU64,

    // Shared
    pub decode_failures: AtomicU64,
}

/// Point-in-time snapshot for logging or health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub auth_success: u64,
    pub auth_failures: u64,
    pub events_received: u64,
    pub events_rejected: u64,
    pub events_published: u64,
    pub publish_failures: u64,
    pub sessions_open_total: u64,
    pub alerts_emitted: u64,
    pub mitigations_enqueued: u64,
    pub mitigations_dropped: u64,
    pub commands_forwarded: u64,
    pub responses_audited: u64,
    pub rows_inserted: u64,
    pub insert_failures: u64,
    pub decode_failures: u64,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            auth_success: self.auth_success.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            sessions_open_total: self.sessions_opened.load(Ordering::Relaxed),
            alerts_emitted: self.alerts_emitted.load(Ordering::Relaxed),
            mitigations_enqueued: self.mitigations_enqueued.load(Ordering::Relaxed),
            mitigations_dropped: self.mitigations_dropped.load(Ordering::Relaxed),
            commands_forwarded: self.commands_forwarded.load(Ordering::Relaxed),
            responses_audited: self.responses_audited.load(Ordering::Relaxed),
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            insert_failures: self.insert_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}
