// ingest-core/src/lib.rs
// Control plane for the telemetry ingest-and-detect service.
//
// Agents stream observational events to the gateway, which fans them out
// onto a durable bus. The rules engine consumes every event, keeps
// sliding counters per (rule, tenant, host) and emits alerts plus
// mitigation commands; the command router delivers those back to the
// originating agent over its live reverse stream, and the columnar sink
// drains the event firehose into the analytics store.
//
// External collaborators (bus, columnar store, registry) sit behind the
// ports in `bus`, `store` and `registry`; each ships an in-memory
// implementation so the whole plane runs in-process under test.

pub mod auth;
pub mod bus;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod nats;
pub mod proto;
pub mod registry;
pub mod router;
pub mod rules;
pub mod session;
pub mod sink;
pub mod store;
pub mod wire;


pub use config::Config;
pub use error::{IngestError, Result};
pub use gateway::Gateway;
pub use metrics::{IngestMetrics, MetricsSummary};
pub use rules::rule::{default_rules, DetectionRule, RuleAction, Severity};
pub use rules::RulesEngine;
pub use sink::ColumnarSink;
