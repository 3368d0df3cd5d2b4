// ingest-core/src/gateway.rs
// Agent-facing ingest endpoint: authenticates agents, publishes their
// event streams to the bus and holds the reverse command streams.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth;
use crate::bus::Bus;
use crate::error::{IngestError, Result};
use crate::metrics::IngestMetrics;
use crate::proto::{client_frame, AuthRequest, AuthResponse, ClientFrame, LogEvent, ServerFrame};
use crate::registry::{AgentUpsert, Registry};
use crate::router;
use crate::session::SessionTable;
use crate::store::EventStore;
use crate::wire;

/// Registry calls never gate the streaming path for long.
const REGISTRY_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Gateway {
    bus: Arc<dyn Bus>,
    store: Arc<dyn EventStore>,
    registry: Option<Arc<dyn Registry>>,
    pub sessions: Arc<SessionTable>,
    metrics: Arc<IngestMetrics>,
    shutdown: CancellationToken,
    heartbeat_interval_secs: i64,
}

impl Gateway {
    pub fn new(
        bus: Arc<dyn Bus>,
        store: Arc<dyn EventStore>,
        registry: Option<Arc<dyn Registry>>,
        metrics: Arc<IngestMetrics>,
        shutdown: CancellationToken,
        heartbeat_interval_secs: i64,
    ) -> Self {
        Self {
            bus,
            store,
            registry,
            sessions: Arc::new(SessionTable::new()),
            metrics,
            shutdown,
            heartbeat_interval_secs,
        }
    }

    /// Drive one agent connection. The first frame selects the method;
    /// the connection then belongs to that call until either side closes.
    pub async fn serve_connection<S>(&self, io: S, peer_addr: String) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut framed = wire::framed(io);
        let first: ClientFrame = match wire::recv_frame(&mut framed).await? {
            Some(frame) => frame,
            None => return Ok(()), // connected and left
        };

        match first.payload {
            Some(client_frame::Payload::Auth(request)) => {
                let response = self.authenticate(&request).await;
                wire::send_frame(&mut framed, &ServerFrame::auth(response)).await
            }
            Some(client_frame::Payload::OpenEvents(open)) => {
                let Some(identity) = auth::parse_token(&open.token) else {
                    warn!("event stream from {peer_addr} rejected: bad token");
                    return Ok(());
                };
                self.handle_stream_events(&mut framed, &identity).await
            }
            Some(client_frame::Payload::OpenCommands(open)) => {
                let Some(identity) = auth::parse_token(&open.token) else {
                    warn!("command stream from {peer_addr} rejected: bad token");
                    return Ok(());
                };
                self.handle_receive_commands(framed, identity, open.agent_version, peer_addr)
                    .await
            }
            _ => Err(IngestError::Protocol(
                "connection must open with Auth, OpenEvents or OpenCommands".to_string(),
            )),
        }
    }

    /// Unary authenticate. Token validation decides the outcome; the
    /// registry upsert is best-effort and can only add registration info.
    pub async fn authenticate(&self, request: &AuthRequest) -> AuthResponse {
        let identity = match auth::authenticate(&request.tenant_id, &request.token) {
            Ok(identity) => identity,
            Err(message) => {
                IngestMetrics::incr(&self.metrics.auth_failures);
                warn!(
                    "authentication rejected for tenant {:?}: {message}",
                    request.tenant_id
                );
                return AuthResponse {
                    authenticated: false,
                    error_message: message.to_string(),
                    ..Default::default()
                };
            }
        };

        IngestMetrics::incr(&self.metrics.auth_success);
        info!(
            "agent authenticated: tenant={}, host={}, version={}",
            identity.tenant_id, identity.host_id, request.agent_version
        );

        let mut registered = false;
        let mut agent_id = String::new();
        if let Some(registry) = &self.registry {
            if !request.hostname.is_empty() {
                let upsert = AgentUpsert {
                    tenant_id: identity.tenant_id.clone(),
                    host_id: identity.host_id.clone(),
                    hostname: request.hostname.clone(),
                    ip_address: request.ip_address.clone(),
                    os_type: request.os_type.clone(),
                    os_version: request.os_version.clone(),
                    agent_version: request.agent_version.clone(),
                    capabilities: request.capabilities.clone(),
                };
                match tokio::time::timeout(REGISTRY_TIMEOUT, registry.upsert_agent(&upsert)).await
                {
                    Ok(Ok(row)) => {
                        registered = true;
                        agent_id = row.id;
                    }
                    Ok(Err(e)) => warn!("agent upsert failed, auth unaffected: {e}"),
                    Err(_) => warn!("agent upsert timed out, auth unaffected"),
                }
            }
        }

        AuthResponse {
            authenticated: true,
            heartbeat_interval_seconds: self.heartbeat_interval_secs,
            registered,
            agent_id,
            error_message: String::new(),
        }
    }

    async fn handle_stream_events<S>(
        &self,
        framed: &mut Framed<S, LengthDelimitedCodec>,
        identity: &auth::AuthToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!(
            "⇢ event stream open for {}/{}",
            identity.tenant_id, identity.host_id
        );
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = wire::recv_frame::<_, ClientFrame>(framed) => received?,
            };
            match frame {
                None => break, // client closed cleanly
                Some(ClientFrame {
                    payload: Some(client_frame::Payload::Event(event)),
                }) => self.ingest_event(event).await,
                Some(_) => warn!("unexpected frame on event stream, ignoring"),
            }
        }
        // best-effort: the peer may already be gone
        let _ = wire::send_frame(framed, &ServerFrame::ack()).await;
        Ok(())
    }

    /// Validate and publish one event. Failures are logged and counted;
    /// the stream itself only dies on transport errors.
    async fn ingest_event(&self, event: LogEvent) {
        IngestMetrics::incr(&self.metrics.events_received);
        if let Err(reason) = validate_event(&event) {
            IngestMetrics::incr(&self.metrics.events_rejected);
            warn!(
                "rejecting event from {}/{}: {reason}",
                event.tenant_id, event.host_id
            );
            return;
        }

        let heartbeat = event.stream == "heartbeat";
        let subject = format!("logs.{}.{}", event.tenant_id, event.host_id);
        match self
            .bus
            .publish(&subject, prost::Message::encode_to_vec(&event))
            .await
        {
            Ok(()) => IngestMetrics::incr(&self.metrics.events_published),
            Err(e) => {
                IngestMetrics::incr(&self.metrics.publish_failures);
                error!("bus publish to {subject} failed, event dropped: {e}");
            }
        }

        if heartbeat {
            IngestMetrics::incr(&self.metrics.heartbeats_seen);
            self.mark_online(&event.tenant_id, &event.host_id).await;
        }
    }

    async fn mark_online(&self, tenant_id: &str, host_id: &str) {
        let Some(registry) = &self.registry else {
            return;
        };
        match tokio::time::timeout(
            REGISTRY_TIMEOUT,
            registry.update_status(tenant_id, host_id, "ONLINE"),
        )
        .await
        {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => warn!("heartbeat from unregistered agent {tenant_id}/{host_id}"),
            Ok(Err(e)) => warn!("agent status update failed: {e}"),
            Err(_) => warn!("agent status update timed out"),
        }
    }

    async fn handle_receive_commands<S>(
        &self,
        framed: Framed<S, LengthDelimitedCodec>,
        identity: auth::AuthToken,
        agent_version: String,
        peer_addr: String,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let tenant_id = &identity.tenant_id;
        let host_id = &identity.host_id;
        info!("🔗 command stream established for {tenant_id}/{host_id}");

        let session_cancel = self.shutdown.child_token();
        let session_id = self.sessions.register(
            tenant_id,
            host_id,
            agent_version,
            peer_addr,
            session_cancel.clone(),
        );
        IngestMetrics::incr(&self.metrics.sessions_opened);

        let result = async {
            let sub = self
                .bus
                .pull_subscribe(
                    &router::command_subject(tenant_id, host_id),
                    &router::durable_name(tenant_id, host_id),
                )
                .await?;

            let (mut sink, mut stream) = framed.split();
            let forward = router::forward_commands(
                sub,
                &mut sink,
                session_cancel.clone(),
                Arc::clone(&self.metrics),
            );
            let audit = router::audit_responses(
                &mut stream,
                Arc::clone(&self.store),
                tenant_id,
                host_id,
                session_cancel.clone(),
                Arc::clone(&self.metrics),
            );

            // whichever half ends first tears the session down; un-ack'd
            // commands return to the bus for redelivery
            tokio::select! {
                r = forward => r,
                r = audit => r,
            }
        }
        .await;

        session_cancel.cancel();
        if self.sessions.remove(tenant_id, host_id, session_id) {
            IngestMetrics::incr(&self.metrics.sessions_closed);
        }
        info!("command stream closed for {tenant_id}/{host_id}");
        result
    }
}

/// Gateway-side event validation; rejected events are never published.
fn validate_event(event: &LogEvent) -> std::result::Result<(), &'static str> {
    if event.tenant_id.is_empty() {
        return Err("empty tenant_id");
    }
    if event.host_id.is_empty() {
        return Err("empty host_id");
    }
    if event.ts_unix_ns <= 0 {
        return Err("non-positive timestamp");
    }
    if event.message.is_empty() && event.stream != "heartbeat" {
        return Err("empty message on non-heartbeat stream");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::proto::StreamOpen;
    use crate::registry::{AgentRow, MemoryRegistry};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use prost::Message as _;

    fn gateway(
        bus: &MemoryBus,
        registry: Option<Arc<dyn Registry>>,
    ) -> (Arc<Gateway>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(Gateway::new(
            Arc::new(bus.clone()),
            store.clone(),
            registry,
            Arc::new(IngestMetrics::new()),
            CancellationToken::new(),
            30,
        ));
        (gateway, store)
    }

    fn spawn_server(
        gateway: &Arc<Gateway>,
        io: tokio::io::DuplexStream,
    ) -> tokio::task::JoinHandle<Result<()>> {
        let gateway = Arc::clone(gateway);
        tokio::spawn(async move { gateway.serve_connection(io, "test-peer".to_string()).await })
    }

    async fn roundtrip_auth(gateway: &Arc<Gateway>, request: AuthRequest) -> AuthResponse {
        let (client, server) = tokio::io::duplex(8192);
        let handle = spawn_server(gateway, server);
        let mut framed = wire::framed(client);
        wire::send_frame(&mut framed, &ClientFrame::auth(request))
            .await
            .unwrap();
        let response: ServerFrame = wire::recv_frame(&mut framed).await.unwrap().unwrap();
        drop(framed);
        handle.await.unwrap().unwrap();
        match response.payload {
            Some(crate::proto::server_frame::Payload::Auth(auth)) => auth,
            other => panic!("expected auth response, got {other:?}"),
        }
    }

    fn auth_request(tenant: &str, token: &str, hostname: &str) -> AuthRequest {
        AuthRequest {
            tenant_id: tenant.to_string(),
            token: token.to_string(),
            agent_version: "0.3.0".to_string(),
            hostname: hostname.to_string(),
            ip_address: "10.0.0.5".to_string(),
            os_type: "linux".to_string(),
            os_version: "6.8".to_string(),
            capabilities: vec!["block_ip".to_string()],
        }
    }

    #[tokio::test]
    async fn authenticate_accepts_matching_token_and_registers() {
        let bus = MemoryBus::new();
        let registry = Arc::new(MemoryRegistry::new());
        let (gateway, _) = gateway(&bus, Some(registry.clone()));

        let response = roundtrip_auth(
            &gateway,
            auth_request("demo", "sm_demo_1700000000_h1", "web-01"),
        )
        .await;

        assert!(response.authenticated);
        assert_eq!(response.heartbeat_interval_seconds, 30);
        assert!(response.registered);
        assert!(!response.agent_id.is_empty());
        // registration key is the token's host segment, not the hostname
        assert!(registry.get("demo", "h1").is_some());
        assert!(registry.get("demo", "web-01").is_none());
    }

    #[tokio::test]
    async fn authenticate_rejects_tenant_mismatch_without_registry_write() {
        let bus = MemoryBus::new();
        let registry = Arc::new(MemoryRegistry::new());
        let (gateway, _) = gateway(&bus, Some(registry.clone()));

        let response = roundtrip_auth(
            &gateway,
            auth_request("demo", "sm_acme_1700000000_h1", "web-01"),
        )
        .await;

        assert!(!response.authenticated);
        assert_eq!(response.error_message, "Invalid org_id or token");
        assert!(registry.is_empty());
        assert!(gateway.sessions.is_empty());
    }

    struct FailingRegistry;

    #[async_trait]
    impl Registry for FailingRegistry {
        async fn upsert_agent(&self, _: &AgentUpsert) -> Result<AgentRow> {
            Err(IngestError::registry("upsert agent", "registry down"))
        }
        async fn update_status(&self, _: &str, _: &str, _: &str) -> Result<bool> {
            Err(IngestError::registry("update status", "registry down"))
        }
    }

    #[tokio::test]
    async fn registry_failure_never_fails_authentication() {
        let bus = MemoryBus::new();
        let (gateway, _) = gateway(&bus, Some(Arc::new(FailingRegistry)));

        let response = roundtrip_auth(
            &gateway,
            auth_request("demo", "sm_demo_1700000000_h1", "web-01"),
        )
        .await;

        assert!(response.authenticated);
        assert!(!response.registered);
        assert!(response.agent_id.is_empty());
    }

    fn log_event(tenant: &str, host: &str, stream: &str, message: &str) -> LogEvent {
        LogEvent {
            tenant_id: tenant.to_string(),
            host_id: host.to_string(),
            ts_unix_ns: 1_700_000_000_000_000_000,
            stream: stream.to_string(),
            message: message.to_string(),
            labels: [("source".to_string(), "test".to_string())].into(),
        }
    }

    #[tokio::test]
    async fn event_stream_publishes_in_arrival_order() {
        let bus = MemoryBus::new();
        let (gateway, _) = gateway(&bus, None);

        let (client, server) = tokio::io::duplex(8192);
        let handle = spawn_server(&gateway, server);
        let mut framed = wire::framed(client);
        wire::send_frame(
            &mut framed,
            &ClientFrame::open_events(StreamOpen {
                token: "sm_demo_1700000000_h1".to_string(),
                agent_version: "0.3.0".to_string(),
            }),
        )
        .await
        .unwrap();

        let first = log_event("demo", "h1", "auth", "Failed password for root from 1.2.3.4");
        let second = log_event("demo", "h1", "system", "High disk usage: 91.3%");
        wire::send_frame(&mut framed, &ClientFrame::event(first.clone()))
            .await
            .unwrap();
        wire::send_frame(&mut framed, &ClientFrame::event(second.clone()))
            .await
            .unwrap();
        drop(framed); // EOF ends the stream
        handle.await.unwrap().unwrap();

        let published = bus.published("logs.demo.h1");
        assert_eq!(published.len(), 2);
        // round-trip law: unmarshalled events equal what was sent
        assert_eq!(LogEvent::decode(published[0].as_slice()).unwrap(), first);
        assert_eq!(LogEvent::decode(published[1].as_slice()).unwrap(), second);
    }

    #[tokio::test]
    async fn invalid_events_are_dropped_not_published() {
        let bus = MemoryBus::new();
        let (gateway, _) = gateway(&bus, None);

        let no_tenant = log_event("", "h1", "auth", "x");
        let no_host = log_event("demo", "", "auth", "x");
        let bad_ts = LogEvent {
            ts_unix_ns: 0,
            ..log_event("demo", "h1", "auth", "x")
        };
        let empty_message = log_event("demo", "h1", "auth", "");

        for event in [no_tenant, no_host, bad_ts, empty_message] {
            gateway.ingest_event(event).await;
        }
        assert!(bus.published("logs.>").is_empty());

        // heartbeats are the one stream allowed an empty message
        gateway
            .ingest_event(log_event("demo", "h1", "heartbeat", ""))
            .await;
        assert_eq!(bus.published("logs.demo.h1").len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_marks_agent_online() {
        let bus = MemoryBus::new();
        let registry = Arc::new(MemoryRegistry::new());
        let (gateway, _) = gateway(&bus, Some(registry.clone()));

        registry
            .upsert_agent(&AgentUpsert {
                tenant_id: "demo".to_string(),
                host_id: "h1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        registry.update_status("demo", "h1", "offline").await.unwrap();

        gateway
            .ingest_event(log_event("demo", "h1", "heartbeat", ""))
            .await;
        assert_eq!(registry.get("demo", "h1").unwrap().status, "ONLINE");
    }
}
