// ingest-core/src/registry.rs
// Agent registry port: tenant/agent identity and liveness status in the
// relational store. The gateway only needs upsert and status updates;
// everything else about the registry is owned elsewhere.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio_postgres::NoTls;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{IngestError, Result};

/// Fields the gateway supplies on agent auto-registration.
#[derive(Debug, Clone, Default)]
pub struct AgentUpsert {
    pub tenant_id: String,
    pub host_id: String,
    pub hostname: String,
    pub ip_address: String,
    pub os_type: String,
    pub os_version: String,
    pub agent_version: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AgentRow {
    pub id: String,
    pub tenant_id: String,
    pub host_id: String,
    pub name: String,
    pub status: String,
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Idempotent on `(tenant_id, host_id)`; marks the agent ONLINE.
    async fn upsert_agent(&self, upsert: &AgentUpsert) -> Result<AgentRow>;

    /// Returns false when the agent is unknown; callers treat that as a
    /// warning, not an error.
    async fn update_status(&self, tenant_id: &str, host_id: &str, status: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------

pub struct PostgresRegistry {
    client: tokio_postgres::Client,
}

impl PostgresRegistry {
    pub async fn connect(url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .map_err(|e| IngestError::registry("connect", e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("registry connection error: {e}");
            }
        });
        info!("✅ connected to agent registry");
        Ok(Self { client })
    }
}

#[async_trait]
impl Registry for PostgresRegistry {
    async fn upsert_agent(&self, upsert: &AgentUpsert) -> Result<AgentRow> {
        let name = if upsert.hostname.is_empty() {
            upsert.host_id.clone()
        } else {
            upsert.hostname.clone()
        };
        let os_info = if upsert.os_version.is_empty() {
            upsert.os_type.clone()
        } else {
            format!("{} ({})", upsert.os_type, upsert.os_version)
        };
        let capabilities = serde_json::to_string(&upsert.capabilities)?;

        let row = self
            .client
            .query_one(
                r#"INSERT INTO "Agent"
                    (id, "hostId", "organizationId", name, version, status,
                     "lastSeen", "ipAddress", "osInfo", capabilities,
                     "createdAt", "updatedAt")
                VALUES (gen_random_uuid(), $1, $2, $3, $4, 'ONLINE', NOW(), $5, $6, $7, NOW(), NOW())
                ON CONFLICT ("organizationId", "hostId")
                DO UPDATE SET
                    name = EXCLUDED.name,
                    version = EXCLUDED.version,
                    status = 'ONLINE',
                    "lastSeen" = NOW(),
                    "ipAddress" = EXCLUDED."ipAddress",
                    "osInfo" = EXCLUDED."osInfo",
                    capabilities = EXCLUDED.capabilities,
                    "updatedAt" = NOW()
                RETURNING id, "hostId", "organizationId", name, status"#,
                &[
                    &upsert.host_id,
                    &upsert.tenant_id,
                    &name,
                    &upsert.agent_version,
                    &upsert.ip_address,
                    &os_info,
                    &capabilities,
                ],
            )
            .await
            .map_err(|e| IngestError::registry("upsert agent", e))?;

        Ok(AgentRow {
            id: row.get(0),
            host_id: row.get(1),
            tenant_id: row.get(2),
            name: row.get(3),
            status: row.get(4),
        })
    }

    async fn update_status(&self, tenant_id: &str, host_id: &str, status: &str) -> Result<bool> {
        let rows = self
            .client
            .execute(
                r#"UPDATE "Agent"
                SET status = $1, "lastSeen" = NOW(), "updatedAt" = NOW()
                WHERE "organizationId" = $2 AND "hostId" = $3"#,
                &[&status.to_uppercase(), &tenant_id, &host_id],
            )
            .await
            .map_err(|e| IngestError::registry("update status", e))?;
        Ok(rows > 0)
    }
}

// ---------------------------------------------------------------------
// In-memory registry
// ---------------------------------------------------------------------

/// Test fixture keyed like the real table.
#[derive(Default)]
pub struct MemoryRegistry {
    agents: Mutex<HashMap<(String, String), AgentRow>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant_id: &str, host_id: &str) -> Option<AgentRow> {
        self.agents
            .lock()
            .get(&(tenant_id.to_string(), host_id.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.agents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.lock().is_empty()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn upsert_agent(&self, upsert: &AgentUpsert) -> Result<AgentRow> {
        let key = (upsert.tenant_id.clone(), upsert.host_id.clone());
        let mut agents = self.agents.lock();
        let row = agents.entry(key).or_insert_with(|| AgentRow {
            id: Uuid::new_v4().to_string(),
            tenant_id: upsert.tenant_id.clone(),
            host_id: upsert.host_id.clone(),
            name: String::new(),
            status: String::new(),
        });
        row.name = if upsert.hostname.is_empty() {
            upsert.host_id.clone()
        } else {
            upsert.hostname.clone()
        };
        row.status = "ONLINE".to_string();
        Ok(row.clone())
    }

    async fn update_status(&self, tenant_id: &str, host_id: &str, status: &str) -> Result<bool> {
        let mut agents = self.agents.lock();
        match agents.get_mut(&(tenant_id.to_string(), host_id.to_string())) {
            Some(row) => {
                row.status = status.to_uppercase();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_is_idempotent_on_tenant_and_host() {
        let registry = MemoryRegistry::new();
        let upsert = AgentUpsert {
            tenant_id: "demo".to_string(),
            host_id: "h1".to_string(),
            hostname: "web-01".to_string(),
            agent_version: "0.3.0".to_string(),
            ..Default::default()
        };
        let first = registry.upsert_agent(&upsert).await.unwrap();
        let second = registry.upsert_agent(&upsert).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(registry.len(), 1);
        assert_eq!(second.status, "ONLINE");
    }

    #[tokio::test]
    async fn status_update_distinguishes_missing_agents() {
        let registry = MemoryRegistry::new();
        assert!(!registry.update_status("demo", "ghost", "online").await.unwrap());

        registry
            .upsert_agent(&AgentUpsert {
                tenant_id: "demo".to_string(),
                host_id: "h1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(registry.update_status("demo", "h1", "offline").await.unwrap());
        assert_eq!(registry.get("demo", "h1").unwrap().status, "OFFLINE");
    }
}
