// ingest-core/src/store.rs
// Columnar store port: batched event inserts and the mitigation audit
// trail. Backed by ClickHouse over its HTTP interface in production and
// by `MemoryStore` in tests.

use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use tracing::info;

use crate::error::{IngestError, Result};
use crate::proto::LogEvent;

/// One row of the `events` table.
#[derive(Debug, Clone, Serialize)]
pub struct EventRow {
    pub tenant_id: String,
    pub host_id: String,
    #[serde(rename = "ts")]
    pub ts_text: String,
    pub stream: String,
    pub message: String,
    pub labels: HashMap<String, String>,
}

/// One row of the `mitigations` audit table.
#[derive(Debug, Clone, Serialize)]
pub struct MitigationRow {
    pub request_id: String,
    pub tenant_id: String,
    pub host_id: String,
    #[serde(rename = "ts")]
    pub ts_text: String,
    pub action: String,
    pub target: String,
    pub duration_minutes: u32,
    pub success: bool,
    pub error_message: String,
    pub rule_id: String,
}

/// DateTime64(9) literal ClickHouse parses without settings fiddling.
pub fn ts_text(ts_unix_ns: i64) -> String {
    DateTime::from_timestamp_nanos(ts_unix_ns)
        .format("%Y-%m-%d %H:%M:%S%.9f")
        .to_string()
}

impl EventRow {
    pub fn from_event(event: &LogEvent) -> Self {
        Self {
            tenant_id: event.tenant_id.clone(),
            host_id: event.host_id.clone(),
            ts_text: ts_text(event.ts_unix_ns),
            stream: event.stream.clone(),
            message: event.message.clone(),
            labels: event.labels.clone(),
        }
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_events(&self, rows: Vec<EventRow>) -> Result<()>;
    async fn insert_mitigation(&self, row: MitigationRow) -> Result<()>;
}

// ---------------------------------------------------------------------
// ClickHouse over HTTP
// ---------------------------------------------------------------------

pub struct ClickHouseStore {
    url: String,
    client: reqwest::Client,
}

impl ClickHouseStore {
    pub async fn connect(addr: &str) -> Result<Self> {
        let url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{addr}")
        };
        let store = Self {
            url,
            client: reqwest::Client::new(),
        };
        store.exec("SELECT 1").await?;
        info!("✅ connected to columnar store at {}", store.url);
        Ok(store)
    }

    /// Create the analytics tables if they do not exist.
    pub async fn ensure_tables(&self) -> Result<()> {
        for ddl in TABLE_DDL {
            self.exec(ddl).await?;
        }
        info!("columnar tables created/verified");
        Ok(())
    }

    async fn exec(&self, query: &str) -> Result<()> {
        self.post(query, String::new()).await
    }

    async fn post(&self, query: &str, body: String) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .query(&[("query", query)])
            .body(body)
            .send()
            .await
            .map_err(|e| IngestError::store("request", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(IngestError::store(
                "query",
                format!("{status}: {}", detail.trim()),
            ));
        }
        Ok(())
    }

    async fn insert_json_each_row<T: Serialize>(&self, table: &str, rows: &[T]) -> Result<()> {
        let mut body = String::new();
        for row in rows {
            let line = serde_json::to_string(row)?;
            let _ = writeln!(body, "{line}");
        }
        self.post(&format!("INSERT INTO {table} FORMAT JSONEachRow"), body)
            .await
    }
}

#[async_trait]
impl EventStore for ClickHouseStore {
    async fn insert_events(&self, rows: Vec<EventRow>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.insert_json_each_row("events", &rows).await
    }

    async fn insert_mitigation(&self, row: MitigationRow) -> Result<()> {
        self.insert_json_each_row("mitigations", std::slice::from_ref(&row))
            .await
    }
}

const TABLE_DDL: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS events (
        tenant_id String,
        host_id String,
        ts DateTime64(9),
        stream String,
        message String,
        labels Map(String, String),
        severity String DEFAULT 'info'
    ) ENGINE = MergeTree()
    PARTITION BY toYYYYMM(ts)
    ORDER BY (tenant_id, host_id, ts)"#,
    r#"CREATE TABLE IF NOT EXISTS agent_heartbeats (
        tenant_id String,
        host_id String,
        ts DateTime64(9),
        agent_version String,
        status String
    ) ENGINE = MergeTree()
    PARTITION BY toYYYYMM(ts)
    ORDER BY (tenant_id, host_id, ts)"#,
    r#"CREATE TABLE IF NOT EXISTS alerts (
        alert_id String,
        rule_id String,
        rule_name String,
        tenant_id String,
        host_id String,
        ts DateTime64(9),
        severity String,
        message String,
        count UInt32,
        status String DEFAULT 'active'
    ) ENGINE = MergeTree()
    PARTITION BY toYYYYMM(ts)
    ORDER BY (tenant_id, severity, ts)"#,
    r#"CREATE TABLE IF NOT EXISTS mitigations (
        request_id String,
        tenant_id String,
        host_id String,
        ts DateTime64(9),
        action String,
        target String,
        duration_minutes UInt32,
        success Bool,
        error_message String,
        rule_id String
    ) ENGINE = MergeTree()
    PARTITION BY toYYYYMM(ts)
    ORDER BY (tenant_id, host_id, ts)"#,
    r#"CREATE TABLE IF NOT EXISTS system_metrics (
        tenant_id String,
        host_id String,
        ts DateTime64(9),
        cpu_usage Float64,
        memory_usage Float64,
        disk_usage Float64,
        network_in UInt64,
        network_out UInt64
    ) ENGINE = MergeTree()
    PARTITION BY toYYYYMM(ts)
    ORDER BY (tenant_id, host_id, ts)"#,
];

// ---------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------

/// Test fixture: collects rows, optionally failing inserts to exercise
/// the sink's nak-on-failure path.
#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<Vec<EventRow>>,
    mitigations: Mutex<Vec<MitigationRow>>,
    fail_inserts: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventRow> {
        self.events.lock().clone()
    }

    pub fn mitigations(&self) -> Vec<MitigationRow> {
        self.mitigations.lock().clone()
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_failure(&self, operation: &str) -> Result<()> {
        if self.fail_inserts.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(IngestError::store(operation, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_events(&self, rows: Vec<EventRow>) -> Result<()> {
        self.check_failure("insert events")?;
        self.events.lock().extend(rows);
        Ok(())
    }

    async fn insert_mitigation(&self, row: MitigationRow) -> Result<()> {
        self.check_failure("insert mitigation")?;
        self.mitigations.lock().push(row);
        Ok(())
    }
}
