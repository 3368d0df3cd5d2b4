// ingest-core/src/rules/mitigation.rs
// Mitigation work items and target extraction.

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::proto::{mitigate_request, BlockIpAction, KillProcessAction, MitigateRequest};
use crate::rules::rule::RuleAction;

/// Minutes an address stays blocked when a rule does not say otherwise.
pub const DEFAULT_BLOCK_MINUTES: i32 = 30;

static IP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+\.\d+\.\d+\.\d+)").expect("ip pattern compiles"));
static PID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:PID|pid)[:=\s]+(\d+)").expect("pid pattern compiles"));

/// The action payload, as a tagged variant; handlers match exhaustively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MitigationAction {
    BlockIp { ip_address: String, duration_minutes: i32 },
    KillProcess { pid: i32, process_name: String },
}

/// Work item queued from the rules engine to the mitigation worker.
#[derive(Debug, Clone)]
pub struct MitigationRequest {
    pub request_id: String,
    pub tenant_id: String,
    pub host_id: String,
    pub rule_id: String,
    pub action: MitigationAction,
}

impl MitigationRequest {
    pub fn new(tenant_id: &str, host_id: &str, rule_id: &str, action: MitigationAction) -> Self {
        Self {
            request_id: format!("mit_{}", Uuid::new_v4().simple()),
            tenant_id: tenant_id.to_string(),
            host_id: host_id.to_string(),
            rule_id: rule_id.to_string(),
            action,
        }
    }

    pub fn into_proto(self) -> MitigateRequest {
        let action = match self.action {
            MitigationAction::BlockIp {
                ip_address,
                duration_minutes,
            } => mitigate_request::Action::BlockIp(BlockIpAction {
                ip_address,
                duration_minutes,
            }),
            MitigationAction::KillProcess { pid, process_name } => {
                mitigate_request::Action::KillProcess(KillProcessAction { pid, process_name })
            }
        };
        MitigateRequest {
            request_id: self.request_id,
            tenant_id: self.tenant_id,
            host_id: self.host_id,
            action: Some(action),
        }
    }
}

/// Pull the action target out of the triggering message. `None` means the
/// mitigation is skipped; the alert still goes out.
pub fn extract_action(action: RuleAction, message: &str) -> Option<MitigationAction> {
    match action {
        RuleAction::None => None,
        RuleAction::BlockIp => {
            let ip = IP_RE.captures(message)?[1].to_string();
            Some(MitigationAction::BlockIp {
                ip_address: ip,
                duration_minutes: DEFAULT_BLOCK_MINUTES,
            })
        }
        RuleAction::KillProcess => {
            let pid = PID_RE.captures(message)?[1].parse().ok()?;
            Some(MitigationAction::KillProcess {
                pid,
                // resolved by the agent before it signals anything
                process_name: "unknown".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_ip_takes_the_first_ipv4_in_the_message() {
        let action = extract_action(
            RuleAction::BlockIp,
            "Failed password for root from 203.0.113.9 port 22, forwarded via 10.0.0.1",
        )
        .unwrap();
        assert_eq!(
            action,
            MitigationAction::BlockIp {
                ip_address: "203.0.113.9".to_string(),
                duration_minutes: DEFAULT_BLOCK_MINUTES,
            }
        );
    }

    #[test]
    fn kill_process_accepts_the_usual_pid_spellings() {
        for message in [
            "suspicious worker PID: 4242 spawned",
            "suspicious worker pid=4242 spawned",
            "suspicious worker PID 4242 spawned",
        ] {
            match extract_action(RuleAction::KillProcess, message) {
                Some(MitigationAction::KillProcess { pid, .. }) => assert_eq!(pid, 4242),
                other => panic!("no pid extracted from {message:?}: {other:?}"),
            }
        }
    }

    #[test]
    fn missing_target_skips_the_mitigation() {
        assert!(extract_action(RuleAction::BlockIp, "no address here").is_none());
        assert!(extract_action(RuleAction::KillProcess, "no pid here").is_none());
        assert!(extract_action(RuleAction::None, "anything").is_none());
    }

    #[test]
    fn request_ids_are_unique() {
        let a = MitigationRequest::new(
            "demo",
            "h1",
            "ssh_brute_force",
            MitigationAction::BlockIp {
                ip_address: "1.2.3.4".to_string(),
                duration_minutes: 30,
            },
        );
        let b = MitigationRequest::new(
            "demo",
            "h1",
            "ssh_brute_force",
            MitigationAction::BlockIp {
                ip_address: "1.2.3.4".to_string(),
                duration_minutes: 30,
            },
        );
        assert_ne!(a.request_id, b.request_id);
        assert!(a.request_id.starts_with("mit_"));
    }
}
