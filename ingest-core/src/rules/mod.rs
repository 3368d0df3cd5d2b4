// ingest-core/src/rules/mod.rs
// Stateful stream processor: consumes every log event, matches the rule
// set, keeps sliding counters per (rule, tenant, host) and emits alerts
// and mitigation requests when thresholds are crossed.

pub mod mitigation;
pub mod rule;

use parking_lot::{Mutex, RwLock};
use prost::Message;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::Bus;
use crate::error::{IngestError, Result};
use crate::metrics::IngestMetrics;
use crate::proto::LogEvent;
use mitigation::{extract_action, MitigationRequest};
use rule::{DetectionRule, RuleAction};

/// Pull batch shape for the `logs.>` consumer.
const FETCH_BATCH: usize = 50;
const FETCH_WAIT: Duration = Duration::from_secs(1);
/// Bounded mitigation queue; overload degrades detection to alert-only.
const MITIGATION_QUEUE: usize = 100;
/// Cadence of the stale-counter sweep.
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

const DURABLE_NAME: &str = "rules-engine";

/// Counter scope: threshold accumulation never crosses hosts or tenants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub rule_id: String,
    pub tenant_id: String,
    pub host_id: String,
}

#[derive(Debug, Clone)]
struct CounterState {
    count: u32,
    last_hit: Instant,
}

/// Snapshot of engine state for logging and tests.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub total_rules: usize,
    pub enabled_rules: usize,
    pub live_counters: usize,
    pub queued_mitigations: usize,
}

struct FiredRule {
    id: String,
    name: String,
    description: String,
    severity: rule::Severity,
    action: RuleAction,
    count: u32,
}

pub struct RulesEngine {
    bus: Arc<dyn Bus>,
    rules: RwLock<Vec<DetectionRule>>,
    counters: RwLock<HashMap<CounterKey, CounterState>>,
    mitigation_tx: mpsc::Sender<MitigationRequest>,
    mitigation_rx: Mutex<Option<mpsc::Receiver<MitigationRequest>>>,
    metrics: Arc<IngestMetrics>,
    shutdown: CancellationToken,
}

impl RulesEngine {
    pub fn new(
        bus: Arc<dyn Bus>,
        rules: Vec<DetectionRule>,
        metrics: Arc<IngestMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        let (mitigation_tx, mitigation_rx) = mpsc::channel(MITIGATION_QUEUE);
        Self {
            bus,
            rules: RwLock::new(rules),
            counters: RwLock::new(HashMap::new()),
            mitigation_tx,
            mitigation_rx: Mutex::new(Some(mitigation_rx)),
            metrics,
            shutdown,
        }
    }

    /// Run the engine until shutdown: the pull-consume loop plus the
    /// mitigation worker as a sibling task, joined on teardown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            "🔍 starting rules engine with {} rules",
            self.rules.read().len()
        );

        let rx = self
            .mitigation_rx
            .lock()
            .take()
            .ok_or_else(|| IngestError::Overload("rules engine already running".to_string()))?;
        let worker = tokio::spawn(Arc::clone(&self).mitigation_worker(rx));

        let result = self.consume_loop().await;
        if self.shutdown.is_cancelled() {
            // worker observes the same token; join its drain
            let _ = worker.await;
        } else {
            // loop died on its own (e.g. subscribe failure): reap the worker
            worker.abort();
        }
        result
    }

    async fn consume_loop(&self) -> Result<()> {
        let mut sub = self.bus.pull_subscribe("logs.>", DURABLE_NAME).await?;
        let mut eviction = tokio::time::interval(EVICTION_INTERVAL);
        eviction.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("rules engine draining on shutdown");
                    return Ok(());
                }
                _ = eviction.tick() => self.evict_stale_counters(),
                fetched = sub.fetch(FETCH_BATCH, FETCH_WAIT) => {
                    let batch = match fetched {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!("rules engine fetch failed: {e}");
                            continue;
                        }
                    };
                    for msg in batch {
                        match LogEvent::decode(msg.payload.as_slice()) {
                            Ok(event) => {
                                self.handle_event(&event).await;
                                if let Err(e) = msg.ack().await {
                                    warn!("rules engine ack failed: {e}");
                                }
                            }
                            Err(e) => {
                                IngestMetrics::incr(&self.metrics.decode_failures);
                                warn!("undecodable event on bus: {e}");
                                if let Err(e) = msg.nak().await {
                                    warn!("rules engine nak failed: {e}");
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Evaluate one event against every enabled rule, in declaration
    /// order; no rule short-circuits another.
    pub async fn handle_event(&self, event: &LogEvent) {
        let mut fired = Vec::new();
        {
            let rules = self.rules.read();
            for rule in rules.iter() {
                if !rule.enabled || !rule.applies_to(&event.stream) {
                    continue;
                }
                if !rule.pattern.is_match(&event.message) {
                    continue;
                }
                IngestMetrics::incr(&self.metrics.rule_matches);
                if let Some(count) = self.bump_counter(rule, event) {
                    fired.push(FiredRule {
                        id: rule.id.clone(),
                        name: rule.name.clone(),
                        description: rule.description.clone(),
                        severity: rule.severity,
                        action: rule.action,
                        count,
                    });
                }
            }
        }

        for rule in fired {
            warn!(
                "🚨 ALERT: rule {} triggered for {}/{} (count: {})",
                rule.name, event.tenant_id, event.host_id, rule.count
            );
            self.publish_alert(&rule, event).await;
            if rule.action != RuleAction::None {
                self.queue_mitigation(&rule, event);
            }
        }
    }

    /// Increment the counter for the event's key; on reaching the
    /// threshold return the hit count and reset the counter to zero.
    fn bump_counter(&self, rule: &DetectionRule, event: &LogEvent) -> Option<u32> {
        let key = CounterKey {
            rule_id: rule.id.clone(),
            tenant_id: event.tenant_id.clone(),
            host_id: event.host_id.clone(),
        };
        let mut counters = self.counters.write();
        let state = counters.entry(key.clone()).or_insert(CounterState {
            count: 0,
            last_hit: Instant::now(),
        });
        state.count += 1;
        state.last_hit = Instant::now();
        if state.count >= rule.threshold {
            let count = state.count;
            counters.remove(&key);
            Some(count)
        } else {
            None
        }
    }

    async fn publish_alert(&self, fired: &FiredRule, event: &LogEvent) {
        let alert = serde_json::json!({
            "rule_id": fired.id,
            "rule_name": fired.name,
            "severity": fired.severity.as_str(),
            "tenant_id": event.tenant_id,
            "host_id": event.host_id,
            "timestamp": chrono::DateTime::from_timestamp_nanos(event.ts_unix_ns).to_rfc3339(),
            "message": event.message,
            "stream": event.stream,
            "count": fired.count,
            "description": fired.description,
        });
        let subject = format!("alerts.{}.{}", event.tenant_id, fired.severity);
        match self.bus.publish(&subject, alert.to_string().into_bytes()).await {
            Ok(()) => {
                IngestMetrics::incr(&self.metrics.alerts_emitted);
                info!("📢 alert sent: {} - {}", fired.name, event.message);
            }
            Err(e) => error!("alert publish failed: {e}"),
        }
    }

    fn queue_mitigation(&self, fired: &FiredRule, event: &LogEvent) {
        let Some(action) = extract_action(fired.action, &event.message) else {
            warn!(
                "rule {} fired but no target found in message, alert only",
                fired.id
            );
            return;
        };
        let request =
            MitigationRequest::new(&event.tenant_id, &event.host_id, &fired.id, action);
        match self.mitigation_tx.try_send(request) {
            Ok(()) => IngestMetrics::incr(&self.metrics.mitigations_enqueued),
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                IngestMetrics::incr(&self.metrics.mitigations_dropped);
                warn!(
                    "⚠️ mitigation queue full, dropping request {} for {}/{}",
                    dropped.request_id, dropped.tenant_id, dropped.host_id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("mitigation worker gone, request dropped");
            }
        }
    }

    async fn mitigation_worker(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<MitigationRequest>,
    ) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                request = rx.recv() => {
                    let Some(request) = request else { return };
                    let subject =
                        format!("commands.{}.{}", request.tenant_id, request.host_id);
                    let request_id = request.request_id.clone();
                    let payload = request.into_proto().encode_to_vec();
                    match self.bus.publish(&subject, payload).await {
                        Ok(()) => info!("📤 mitigation command sent: {request_id}"),
                        Err(e) => error!("mitigation publish failed for {request_id}: {e}"),
                    }
                }
            }
        }
    }

    /// Drop counters that have sat idle longer than their rule's window.
    fn evict_stale_counters(&self) {
        let windows: HashMap<String, Duration> = self
            .rules
            .read()
            .iter()
            .map(|r| (r.id.clone(), r.window))
            .collect();
        let now = Instant::now();
        let mut counters = self.counters.write();
        let before = counters.len();
        counters.retain(|key, state| match windows.get(&key.rule_id) {
            Some(window) => now.duration_since(state.last_hit) <= *window,
            None => false,
        });
        let evicted = before - counters.len();
        if evicted > 0 {
            debug!("evicted {evicted} stale alert counters");
        }
    }

    /// Current value of one counter; zero when absent.
    pub fn counter_value(&self, rule_id: &str, tenant_id: &str, host_id: &str) -> u32 {
        self.counters
            .read()
            .get(&CounterKey {
                rule_id: rule_id.to_string(),
                tenant_id: tenant_id.to_string(),
                host_id: host_id.to_string(),
            })
            .map(|s| s.count)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> EngineStats {
        let rules = self.rules.read();
        EngineStats {
            total_rules: rules.len(),
            enabled_rules: rules.iter().filter(|r| r.enabled).count(),
            live_counters: self.counters.read().len(),
            queued_mitigations: MITIGATION_QUEUE - self.mitigation_tx.capacity(),
        }
    }

    pub fn add_rule(&self, rule: DetectionRule) -> Result<()> {
        let mut rules = self.rules.write();
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(IngestError::Config {
                field: format!("rule.{}", rule.id),
                message: "duplicate rule id".to_string(),
            });
        }
        info!("✅ added detection rule: {}", rule.name);
        rules.push(rule);
        Ok(())
    }

    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.id == rule_id) {
            Some(rule) => {
                rule.enabled = enabled;
                info!(
                    "{} rule: {}",
                    if enabled { "enabled" } else { "disabled" },
                    rule.name
                );
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use rule::{default_rules, Severity};

    fn event(stream: &str, message: &str) -> LogEvent {
        event_for("demo", "h1", stream, message)
    }

    fn event_for(tenant: &str, host: &str, stream: &str, message: &str) -> LogEvent {
        LogEvent {
            tenant_id: tenant.to_string(),
            host_id: host.to_string(),
            ts_unix_ns: 1_700_000_000_000_000_000,
            stream: stream.to_string(),
            message: message.to_string(),
            labels: Default::default(),
        }
    }

    fn engine_with_defaults(bus: &MemoryBus) -> Arc<RulesEngine> {
        Arc::new(RulesEngine::new(
            Arc::new(bus.clone()),
            default_rules().unwrap(),
            Arc::new(IngestMetrics::new()),
            CancellationToken::new(),
        ))
    }

    const SSH_FAIL: &str = "Failed password for root from 203.0.113.9 port 22 ssh2";

    #[tokio::test]
    async fn threshold_fires_exactly_once_and_resets() {
        let bus = MemoryBus::new();
        let engine = engine_with_defaults(&bus);

        for _ in 0..5 {
            engine.handle_event(&event("auth", SSH_FAIL)).await;
        }

        let alerts = bus.published("alerts.demo.critical");
        assert_eq!(alerts.len(), 1, "exactly one alert");
        let alert: serde_json::Value = serde_json::from_slice(&alerts[0]).unwrap();
        assert_eq!(alert["rule_id"], "ssh_brute_force");
        assert_eq!(alert["count"], 5);
        assert_eq!(engine.counter_value("ssh_brute_force", "demo", "h1"), 0);
    }

    #[tokio::test]
    async fn sub_threshold_does_not_fire() {
        let bus = MemoryBus::new();
        let engine = engine_with_defaults(&bus);

        for _ in 0..4 {
            engine.handle_event(&event("auth", SSH_FAIL)).await;
        }

        assert!(bus.published("alerts.>").is_empty());
        assert!(bus.published("commands.>").is_empty());
        assert_eq!(engine.counter_value("ssh_brute_force", "demo", "h1"), 4);
    }

    #[tokio::test]
    async fn counters_are_isolated_per_host() {
        let bus = MemoryBus::new();
        let engine = engine_with_defaults(&bus);

        for _ in 0..3 {
            engine
                .handle_event(&event_for("demo", "h1", "auth", SSH_FAIL))
                .await;
        }
        for _ in 0..4 {
            engine
                .handle_event(&event_for("demo", "h2", "auth", SSH_FAIL))
                .await;
        }

        assert!(bus.published("alerts.>").is_empty());
        assert_eq!(engine.counter_value("ssh_brute_force", "demo", "h1"), 3);
        assert_eq!(engine.counter_value("ssh_brute_force", "demo", "h2"), 4);
    }

    #[tokio::test]
    async fn disk_full_fires_immediately_without_mitigation() {
        let bus = MemoryBus::new();
        let engine = engine_with_defaults(&bus);

        engine
            .handle_event(&event("system", "High disk usage: 91.3%"))
            .await;

        let alerts = bus.published("alerts.demo.critical");
        assert_eq!(alerts.len(), 1);
        let alert: serde_json::Value = serde_json::from_slice(&alerts[0]).unwrap();
        assert_eq!(alert["rule_id"], "disk_full");
        assert!(bus.published("commands.>").is_empty());
    }

    #[tokio::test]
    async fn stream_filter_gates_matching() {
        let bus = MemoryBus::new();
        let engine = engine_with_defaults(&bus);

        // right message, wrong stream: never counts
        engine
            .handle_event(&event("process", "High disk usage: 91.3%"))
            .await;
        assert!(bus.published("alerts.>").is_empty());
        assert_eq!(engine.counter_value("disk_full", "demo", "h1"), 0);
    }

    #[tokio::test]
    async fn rules_evaluate_independently_on_one_event() {
        let bus = MemoryBus::new();
        let mut rules = default_rules().unwrap();
        // second rule matching the same auth line, firing immediately
        rules.push(
            DetectionRule::new(
                "any_ssh_failure",
                "Any SSH Failure",
                "",
                Severity::Info,
                r"Failed password",
                "auth",
                1,
                Duration::from_secs(60),
                RuleAction::None,
            )
            .unwrap(),
        );
        let engine = Arc::new(RulesEngine::new(
            Arc::new(bus.clone()),
            rules,
            Arc::new(IngestMetrics::new()),
            CancellationToken::new(),
        ));

        engine.handle_event(&event("auth", SSH_FAIL)).await;

        assert_eq!(bus.published("alerts.demo.info").len(), 1);
        assert_eq!(engine.counter_value("ssh_brute_force", "demo", "h1"), 1);
    }

    #[tokio::test]
    async fn disabled_rules_are_skipped() {
        let bus = MemoryBus::new();
        let engine = engine_with_defaults(&bus);
        assert!(engine.set_rule_enabled("disk_full", false));

        engine
            .handle_event(&event("system", "High disk usage: 91.3%"))
            .await;
        assert!(bus.published("alerts.>").is_empty());
    }

    #[tokio::test]
    async fn firing_block_rule_queues_a_mitigation() {
        let bus = MemoryBus::new();
        let engine = engine_with_defaults(&bus);

        for _ in 0..5 {
            engine.handle_event(&event("auth", SSH_FAIL)).await;
        }
        assert_eq!(engine.stats().queued_mitigations, 1);
    }

    #[tokio::test]
    async fn stale_counters_are_evicted_after_their_window() {
        let bus = MemoryBus::new();
        let engine = engine_with_defaults(&bus);

        engine.handle_event(&event("auth", SSH_FAIL)).await;
        assert_eq!(engine.stats().live_counters, 1);

        // nothing is stale yet
        engine.evict_stale_counters();
        assert_eq!(engine.stats().live_counters, 1);
    }

    #[test]
    fn duplicate_rule_ids_are_rejected() {
        let bus = MemoryBus::new();
        let engine = engine_with_defaults(&bus);
        let dup = DetectionRule::new(
            "disk_full",
            "Copy",
            "",
            Severity::Info,
            r"x",
            "",
            1,
            Duration::from_secs(60),
            RuleAction::None,
        )
        .unwrap();
        assert!(engine.add_rule(dup).is_err());
    }
}
