// ingest-core/src/proto.rs
// Protobuf wire model shared with agents and carried on the bus.
//
// Messages are hand-derived `prost::Message` structs so the wire format
// stays proto3-compatible without a build-time codegen step. Field tags
// are part of the protocol; do not renumber.

use std::collections::HashMap;

/// One observational event from an agent.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEvent {
    #[prost(string, tag = "1")]
    pub tenant_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub host_id: ::prost::alloc::string::String,
    /// Producer-supplied nanosecond timestamp
    #[prost(int64, tag = "3")]
    pub ts_unix_ns: i64,
    /// Open set: heartbeat, auth, process, network, system, filesystem, ...
    #[prost(string, tag = "4")]
    pub stream: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub message: ::prost::alloc::string::String,
    #[prost(map = "string, string", tag = "6")]
    pub labels: HashMap<::prost::alloc::string::String, ::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthRequest {
    #[prost(string, tag = "1")]
    pub tenant_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub token: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub agent_version: ::prost::alloc::string::String,
    // Auto-registration fields, all optional (empty = absent)
    #[prost(string, tag = "4")]
    pub hostname: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub ip_address: ::prost::alloc::string::String,
    #[prost(string, tag = "6")]
    pub os_type: ::prost::alloc::string::String,
    #[prost(string, tag = "7")]
    pub os_version: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "8")]
    pub capabilities: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthResponse {
    #[prost(bool, tag = "1")]
    pub authenticated: bool,
    #[prost(int64, tag = "2")]
    pub heartbeat_interval_seconds: i64,
    #[prost(bool, tag = "3")]
    pub registered: bool,
    #[prost(string, tag = "4")]
    pub agent_id: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub error_message: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {}

/// Opens a named stream on a fresh connection. The bearer token carries
/// the session identity; the gateway re-validates it per stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamOpen {
    #[prost(string, tag = "1")]
    pub token: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub agent_version: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlockIpAction {
    #[prost(string, tag = "1")]
    pub ip_address: ::prost::alloc::string::String,
    #[prost(int32, tag = "2")]
    pub duration_minutes: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KillProcessAction {
    #[prost(int32, tag = "1")]
    pub pid: i32,
    #[prost(string, tag = "2")]
    pub process_name: ::prost::alloc::string::String,
}

/// Mitigation command routed from the rules engine to one agent.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MitigateRequest {
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub tenant_id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub host_id: ::prost::alloc::string::String,
    #[prost(oneof = "mitigate_request::Action", tags = "4, 5")]
    pub action: ::core::option::Option<mitigate_request::Action>,
}

pub mod mitigate_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Action {
        #[prost(message, tag = "4")]
        BlockIp(super::BlockIpAction),
        #[prost(message, tag = "5")]
        KillProcess(super::KillProcessAction),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MitigateResponse {
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(string, tag = "3")]
    pub error_message: ::prost::alloc::string::String,
}

/// Envelope for every frame an agent sends. The first frame of a
/// connection selects the method: `Auth` for the unary authenticate call,
/// `OpenEvents` / `OpenCommands` for the streaming calls.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientFrame {
    #[prost(oneof = "client_frame::Payload", tags = "1, 2, 3, 4, 5")]
    pub payload: ::core::option::Option<client_frame::Payload>,
}

pub mod client_frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Auth(super::AuthRequest),
        #[prost(message, tag = "2")]
        OpenEvents(super::StreamOpen),
        #[prost(message, tag = "3")]
        Event(super::LogEvent),
        #[prost(message, tag = "4")]
        OpenCommands(super::StreamOpen),
        #[prost(message, tag = "5")]
        MitigateResponse(super::MitigateResponse),
    }
}

/// Envelope for every frame the server sends.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerFrame {
    #[prost(oneof = "server_frame::Payload", tags = "1, 2, 3")]
    pub payload: ::core::option::Option<server_frame::Payload>,
}

pub mod server_frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Auth(super::AuthResponse),
        #[prost(message, tag = "2")]
        Command(super::MitigateRequest),
        #[prost(message, tag = "3")]
        Ack(super::Ack),
    }
}

impl ClientFrame {
    pub fn auth(req: AuthRequest) -> Self {
        Self {
            payload: Some(client_frame::Payload::Auth(req)),
        }
    }

    pub fn open_events(open: StreamOpen) -> Self {
        Self {
            payload: Some(client_frame::Payload::OpenEvents(open)),
        }
    }

    pub fn event(event: LogEvent) -> Self {
        Self {
            payload: Some(client_frame::Payload::Event(event)),
        }
    }

    pub fn open_commands(open: StreamOpen) -> Self {
        Self {
            payload: Some(client_frame::Payload::OpenCommands(open)),
        }
    }

    pub fn mitigate_response(resp: MitigateResponse) -> Self {
        Self {
            payload: Some(client_frame::Payload::MitigateResponse(resp)),
        }
    }
}

impl ServerFrame {
    pub fn auth(resp: AuthResponse) -> Self {
        Self {
            payload: Some(server_frame::Payload::Auth(resp)),
        }
    }

    pub fn command(req: MitigateRequest) -> Self {
        Self {
            payload: Some(server_frame::Payload::Command(req)),
        }
    }

    pub fn ack() -> Self {
        Self {
            payload: Some(server_frame::Payload::Ack(Ack {})),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn log_event_roundtrips_through_bytes() {
        let mut labels = HashMap::new();
        labels.insert("unit".to_string(), "sshd".to_string());
        labels.insert("facility".to_string(), "authpriv".to_string());
        let event = LogEvent {
            tenant_id: "demo".to_string(),
            host_id: "h1".to_string(),
            ts_unix_ns: 1_700_000_000_000_000_123,
            stream: "auth".to_string(),
            message: "Failed password for root from 203.0.113.9 port 22 ssh2".to_string(),
            labels,
        };

        let decoded = LogEvent::decode(event.encode_to_vec().as_slice()).unwrap();
        // equality is modulo label-map ordering: HashMap PartialEq covers it
        assert_eq!(decoded, event);
    }

    #[test]
    fn mitigate_request_preserves_request_id_and_action() {
        let req = MitigateRequest {
            request_id: "r1".to_string(),
            tenant_id: "demo".to_string(),
            host_id: "h1".to_string(),
            action: Some(mitigate_request::Action::BlockIp(BlockIpAction {
                ip_address: "1.2.3.4".to_string(),
                duration_minutes: 10,
            })),
        };

        let decoded = MitigateRequest::decode(req.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.request_id, "r1");
        match decoded.action {
            Some(mitigate_request::Action::BlockIp(block)) => {
                assert_eq!(block.ip_address, "1.2.3.4");
                assert_eq!(block.duration_minutes, 10);
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn client_frame_dispatches_on_first_payload() {
        let frame = ClientFrame::open_events(StreamOpen {
            token: "sm_demo_1700000000_h1".to_string(),
            agent_version: "0.3.0".to_string(),
        });
        let decoded = ClientFrame::decode(frame.encode_to_vec().as_slice()).unwrap();
        assert!(matches!(
            decoded.payload,
            Some(client_frame::Payload::OpenEvents(_))
        ));
    }
}
