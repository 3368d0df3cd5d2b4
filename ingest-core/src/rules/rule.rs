// ingest-core/src/rules/rule.rs
// Detection rule definitions and the default rule set.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mitigation dispatched when a rule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    None,
    BlockIp,
    KillProcess,
}

/// A single detection rule. Patterns compile at load; a failure there is
/// fatal at startup, runtime never adds patterns.
#[derive(Debug, Clone)]
pub struct DetectionRule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub severity: Severity,
    pub pattern: Regex,
    /// Empty means the rule applies to any stream.
    pub stream_filter: String,
    pub threshold: u32,
    pub window: Duration,
    pub action: RuleAction,
    pub enabled: bool,
}

impl DetectionRule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: &str,
        name: &str,
        description: &str,
        severity: Severity,
        pattern: &str,
        stream_filter: &str,
        threshold: u32,
        window: Duration,
        action: RuleAction,
    ) -> Result<Self> {
        if threshold == 0 {
            return Err(IngestError::Config {
                field: format!("rule.{id}.threshold"),
                message: "threshold must be at least 1".to_string(),
            });
        }
        let pattern = Regex::new(pattern).map_err(|e| IngestError::Config {
            field: format!("rule.{id}.pattern"),
            message: e.to_string(),
        })?;
        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            severity,
            pattern,
            stream_filter: stream_filter.to_string(),
            threshold,
            window,
            action,
            enabled: true,
        })
    }

    pub fn applies_to(&self, stream: &str) -> bool {
        self.stream_filter.is_empty() || self.stream_filter == stream
    }
}

const MINUTE: Duration = Duration::from_secs(60);

/// The stock detection rules every deployment starts with.
pub fn default_rules() -> Result<Vec<DetectionRule>> {
    Ok(vec![
        DetectionRule::new(
            "ssh_brute_force",
            "SSH Brute Force Attack",
            "Multiple failed SSH login attempts detected",
            Severity::Critical,
            r"Failed password for .* from (\d+\.\d+\.\d+\.\d+)",
            "auth",
            5,
            5 * MINUTE,
            RuleAction::BlockIp,
        )?,
        DetectionRule::new(
            "high_cpu_usage",
            "High CPU Usage",
            "CPU usage exceeds 90%",
            Severity::Warning,
            r"High CPU usage: (\d+\.\d+)%",
            "system",
            3,
            10 * MINUTE,
            RuleAction::None,
        )?,
        DetectionRule::new(
            "disk_full",
            "Disk Space Critical",
            "Disk usage exceeds 85%",
            Severity::Critical,
            r"High disk usage: (\d+\.\d+)%",
            "system",
            1,
            MINUTE,
            RuleAction::None,
        )?,
        DetectionRule::new(
            "memory_oom",
            "Out of Memory",
            "System is running out of memory",
            Severity::Critical,
            r"Out of memory: Kill process (\d+)",
            "system",
            1,
            MINUTE,
            RuleAction::None,
        )?,
        DetectionRule::new(
            "sudo_abuse",
            "Suspicious Sudo Usage",
            "Unusual sudo command patterns detected",
            Severity::Warning,
            r"sudo:.*COMMAND=(/bin/bash|/bin/sh|rm -rf)",
            "auth",
            3,
            5 * MINUTE,
            RuleAction::None,
        )?,
        DetectionRule::new(
            "file_modification",
            "Critical File Modified",
            "Critical system file was modified",
            Severity::Warning,
            r"File modified: (/etc/passwd|/etc/shadow|/etc/sudoers)",
            "filesystem",
            1,
            MINUTE,
            RuleAction::None,
        )?,
        DetectionRule::new(
            "network_scan",
            "Network Port Scan",
            "Potential network scanning activity",
            Severity::Warning,
            r"Suspicious connection:.*(:22|:3389|:1433|:3306)",
            "network",
            10,
            2 * MINUTE,
            RuleAction::BlockIp,
        )?,
        DetectionRule::new(
            "process_anomaly",
            "Suspicious Process",
            "Suspicious process execution detected",
            Severity::Warning,
            r"Process started:.*(nc|ncat|socat|python.*-c|perl.*-e)",
            "process",
            1,
            MINUTE,
            RuleAction::None,
        )?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rules_are_unique_and_enabled() {
        let rules = default_rules().unwrap();
        assert_eq!(rules.len(), 8);
        let mut ids: Vec<_> = rules.iter().map(|r| r.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8, "rule ids must be unique");
        assert!(rules.iter().all(|r| r.enabled && r.threshold >= 1));
    }

    #[test]
    fn ssh_rule_matches_the_canonical_line() {
        let rules = default_rules().unwrap();
        let ssh = rules.iter().find(|r| r.id == "ssh_brute_force").unwrap();
        assert!(ssh
            .pattern
            .is_match("Failed password for root from 203.0.113.9 port 22 ssh2"));
        assert!(!ssh.pattern.is_match("Accepted password for root"));
        assert!(ssh.applies_to("auth"));
        assert!(!ssh.applies_to("system"));
    }

    #[test]
    fn bad_pattern_is_a_config_error() {
        let err = DetectionRule::new(
            "broken",
            "Broken",
            "",
            Severity::Info,
            r"(unclosed",
            "",
            1,
            MINUTE,
            RuleAction::None,
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::Config { .. }));
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let err = DetectionRule::new(
            "zero",
            "Zero",
            "",
            Severity::Info,
            r"x",
            "",
            0,
            MINUTE,
            RuleAction::None,
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::Config { .. }));
    }
}
