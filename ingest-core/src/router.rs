// ingest-core/src/router.rs
// Bridges commands.<tenant>.<host> on the bus to the live agent stream,
// and audits every mitigation response the agent sends back. One router
// runs per open ReceiveCommands session.

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use prost::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::PullSub;
use crate::error::{IngestError, Result};
use crate::metrics::IngestMetrics;
use crate::proto::{client_frame, ClientFrame, MitigateRequest, MitigateResponse, ServerFrame};
use crate::store::{ts_text, EventStore, MitigationRow};

/// Small batches keep command latency low; the bus buffers the backlog.
const COMMAND_BATCH: usize = 10;
const COMMAND_WAIT: Duration = Duration::from_secs(1);

/// Durable consumer name for one agent's command subject. A reconnecting
/// session re-attaches to the same cursor, and dual sessions for one key
/// split the stream instead of duplicating it.
pub fn durable_name(tenant_id: &str, host_id: &str) -> String {
    format!("agent-{tenant_id}-{host_id}")
}

pub fn command_subject(tenant_id: &str, host_id: &str) -> String {
    format!("commands.{tenant_id}.{host_id}")
}

/// Fetch commands from the bus and forward them to the agent stream.
/// Ack only after a successful send; a failed send naks so a reconnected
/// session can pick the command up.
pub async fn forward_commands<S>(
    mut sub: Box<dyn PullSub>,
    sink: &mut SplitSink<Framed<S, LengthDelimitedCodec>, Bytes>,
    cancel: CancellationToken,
    metrics: Arc<IngestMetrics>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let batch = tokio::select! {
            // a supplanted session must stop fetching before the new one
            // attaches to the shared durable cursor
            biased;
            _ = cancel.cancelled() => return Ok(()),
            fetched = sub.fetch(COMMAND_BATCH, COMMAND_WAIT) => match fetched {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("command fetch failed: {e}");
                    continue;
                }
            },
        };

        for msg in batch {
            let command = match MitigateRequest::decode(msg.payload.as_slice()) {
                Ok(command) => command,
                Err(e) => {
                    IngestMetrics::incr(&metrics.decode_failures);
                    warn!("undecodable command on bus: {e}");
                    if let Err(e) = msg.nak().await {
                        warn!("command nak failed: {e}");
                    }
                    continue;
                }
            };

            let request_id = command.request_id.clone();
            let frame = Bytes::from(ServerFrame::command(command).encode_to_vec());
            match sink.send(frame).await {
                Ok(()) => {
                    IngestMetrics::incr(&metrics.commands_forwarded);
                    info!("📤 command sent to agent: {request_id}");
                    if let Err(e) = msg.ack().await {
                        warn!("command ack failed: {e}");
                    }
                }
                Err(e) => {
                    IngestMetrics::incr(&metrics.command_send_failures);
                    if let Err(e) = msg.nak().await {
                        warn!("command nak failed: {e}");
                    }
                    return Err(IngestError::transport("send command", e));
                }
            }
        }
    }
}

/// Read mitigation responses from the agent and persist each one to the
/// audit table. Responses for unknown request ids are still recorded.
pub async fn audit_responses<S>(
    stream: &mut SplitStream<Framed<S, LengthDelimitedCodec>>,
    store: Arc<dyn EventStore>,
    tenant_id: &str,
    host_id: &str,
    cancel: CancellationToken,
    metrics: Arc<IngestMetrics>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            item = stream.next() => item,
        };
        match item {
            None => return Ok(()),
            Some(Err(e)) => return Err(IngestError::transport("recv response", e)),
            Some(Ok(buf)) => {
                let frame = match ClientFrame::decode(buf.freeze()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        IngestMetrics::incr(&metrics.decode_failures);
                        warn!("undecodable frame on command stream: {e}");
                        continue;
                    }
                };
                if let Some(client_frame::Payload::MitigateResponse(response)) = frame.payload {
                    record_response(&*store, tenant_id, host_id, &response).await;
                    IngestMetrics::incr(&metrics.responses_audited);
                } else {
                    warn!("unexpected frame on command stream, ignoring");
                }
            }
        }
    }
}

async fn record_response(
    store: &dyn EventStore,
    tenant_id: &str,
    host_id: &str,
    response: &MitigateResponse,
) {
    let status = if response.success { "SUCCESS" } else { "FAILED" };
    info!(
        "📥 mitigation response {}: {status} - {}",
        response.request_id, response.error_message
    );
    let row = MitigationRow {
        request_id: response.request_id.clone(),
        tenant_id: tenant_id.to_string(),
        host_id: host_id.to_string(),
        ts_text: ts_text(chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)),
        action: String::new(),
        target: String::new(),
        duration_minutes: 0,
        success: response.success,
        error_message: response.error_message.clone(),
        rule_id: String::new(),
    };
    if let Err(e) = store.insert_mitigation(row).await {
        error!("mitigation audit write failed: {e}");
    }
}
