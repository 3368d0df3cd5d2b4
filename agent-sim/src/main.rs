// agent-sim/src/main.rs
// Synthetic agent: authenticates against a running ingestd, streams a
// canned event scenario and answers every mitigation command it gets.
// Smoke-tests the full loop without touching a real host.

use anyhow::{bail, Context, Result};
use clap::{Arg, Command};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{info, warn, Level};

use ingest_core::auth;
use ingest_core::proto::{
    mitigate_request, server_frame, AuthRequest, ClientFrame, LogEvent, MitigateResponse,
    ServerFrame, StreamOpen,
};
use ingest_core::wire;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let matches = Command::new("agent-sim")
        .version(VERSION)
        .about("Synthetic agent for the ingest endpoint")
        .arg(
            Arg::new("server")
                .short('s')
                .long("server")
                .help("ingestd address")
                .default_value("127.0.0.1:9002"),
        )
        .arg(
            Arg::new("token")
                .short('t')
                .long("token")
                .help("agent token (sm_<tenant>_<epoch>_<host>)")
                .required(true),
        )
        .arg(
            Arg::new("scenario")
                .long("scenario")
                .help("event scenario to stream")
                .value_parser(["ssh-brute", "disk-full", "heartbeat"])
                .default_value("heartbeat"),
        )
        .arg(
            Arg::new("count")
                .short('n')
                .long("count")
                .help("number of events to send")
                .value_parser(clap::value_parser!(u32))
                .default_value("5"),
        )
        .arg(
            Arg::new("interval-ms")
                .long("interval-ms")
                .help("delay between events")
                .value_parser(clap::value_parser!(u64))
                .default_value("200"),
        )
        .get_matches();

    let server = matches.get_one::<String>("server").expect("has default");
    let token = matches.get_one::<String>("token").expect("required");
    let scenario = matches.get_one::<String>("scenario").expect("has default");
    let count = *matches.get_one::<u32>("count").expect("has default");
    let interval = Duration::from_millis(*matches.get_one::<u64>("interval-ms").expect("default"));

    let identity = auth::parse_token(token)
        .context("token does not match sm_<tenant>_<epoch>_<host>")?;
    info!(
        "🔧 extracted from token: tenant={}, host={}",
        identity.tenant_id, identity.host_id
    );

    // 1. authenticate
    let mut framed = wire::framed(
        TcpStream::connect(server)
            .await
            .with_context(|| format!("connect {server}"))?,
    );
    wire::send_frame(
        &mut framed,
        &ClientFrame::auth(AuthRequest {
            tenant_id: identity.tenant_id.clone(),
            token: token.clone(),
            agent_version: VERSION.to_string(),
            hostname: identity.host_id.clone(),
            ip_address: "127.0.0.1".to_string(),
            os_type: std::env::consts::OS.to_string(),
            os_version: String::new(),
            capabilities: vec!["block_ip".to_string(), "kill_process".to_string()],
        }),
    )
    .await?;
    let response: ServerFrame = wire::recv_frame(&mut framed)
        .await?
        .context("server closed before auth response")?;
    let auth_response = match response.payload {
        Some(server_frame::Payload::Auth(auth)) => auth,
        other => bail!("unexpected auth reply: {other:?}"),
    };
    if !auth_response.authenticated {
        bail!("authentication rejected: {}", auth_response.error_message);
    }
    info!(
        "✅ authenticated as {}/{} (heartbeat every {}s{})",
        identity.tenant_id,
        identity.host_id,
        auth_response.heartbeat_interval_seconds,
        if auth_response.registered {
            format!(", registered as {}", auth_response.agent_id)
        } else {
            String::new()
        }
    );
    drop(framed);

    // 2. reverse command stream, answered from a sibling task
    let command_conn = TcpStream::connect(server).await?;
    let token_clone = token.clone();
    let commands = tokio::spawn(async move {
        if let Err(e) = run_command_stream(command_conn, &token_clone).await {
            warn!("command stream ended: {e}");
        }
    });

    // 3. event stream
    let mut events = wire::framed(TcpStream::connect(server).await?);
    wire::send_frame(
        &mut events,
        &ClientFrame::open_events(StreamOpen {
            token: token.clone(),
            agent_version: VERSION.to_string(),
        }),
    )
    .await?;

    info!("⇢ streaming {count} {scenario} events to {server}");
    for sequence in 0..count {
        let event = scenario_event(scenario, &identity, sequence);
        wire::send_frame(&mut events, &ClientFrame::event(event)).await?;
        tokio::time::sleep(interval).await;
    }
    drop(events);
    info!("event stream closed, waiting for commands (ctrl-c to exit)");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("🛑 shutting down"),
        _ = commands => {}
    }
    Ok(())
}

async fn run_command_stream(conn: TcpStream, token: &str) -> Result<()> {
    let mut framed = wire::framed(conn);
    wire::send_frame(
        &mut framed,
        &ClientFrame::open_commands(StreamOpen {
            token: token.to_string(),
            agent_version: VERSION.to_string(),
        }),
    )
    .await?;
    info!("🛡️ command stream open");

    while let Some(frame) = wire::recv_frame::<_, ServerFrame>(&mut framed).await? {
        let Some(server_frame::Payload::Command(command)) = frame.payload else {
            continue;
        };
        match &command.action {
            Some(mitigate_request::Action::BlockIp(block)) => info!(
                "🚫 would block {} for {} minutes (request {})",
                block.ip_address, block.duration_minutes, command.request_id
            ),
            Some(mitigate_request::Action::KillProcess(kill)) => info!(
                "⚡ would kill pid {} ({}) (request {})",
                kill.pid, kill.process_name, command.request_id
            ),
            None => warn!("command {} carries no action", command.request_id),
        }
        wire::send_frame(
            &mut framed,
            &ClientFrame::mitigate_response(MitigateResponse {
                request_id: command.request_id,
                success: true,
                error_message: String::new(),
            }),
        )
        .await?;
    }
    Ok(())
}

fn scenario_event(scenario: &str, identity: &auth::AuthToken, sequence: u32) -> LogEvent {
    let (stream, message) = match scenario {
        "ssh-brute" => (
            "auth",
            format!("Failed password for root from 203.0.113.9 port {} ssh2", 40000 + sequence),
        ),
        "disk-full" => ("system", "High disk usage: 91.3%".to_string()),
        _ => ("heartbeat", String::new()),
    };
    let mut labels = HashMap::new();
    labels.insert("source".to_string(), "agent-sim".to_string());
    labels.insert("seq".to_string(), sequence.to_string());
    LogEvent {
        tenant_id: identity.tenant_id.clone(),
        host_id: identity.host_id.clone(),
        ts_unix_ns: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        stream: stream.to_string(),
        message,
        labels,
    }
}
