use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task statuses as reported by gvmd. Stored and served verbatim.
pub mod gvm_status {
    pub const NEW: &str = "New";
    pub const REQUESTED: &str = "Requested";
    pub const QUEUED: &str = "Queued";
    pub const RUNNING: &str = "Running";
    pub const STOP_REQUESTED: &str = "Stop Requested";
    pub const STOPPED: &str = "Stopped";
    pub const DONE: &str = "Done";
    pub const INTERRUPTED: &str = "Interrupted";

    pub fn is_terminal(status: &str) -> bool {
        matches!(status, DONE | STOPPED | INTERRUPTED)
    }

    pub fn is_failure(status: &str) -> bool {
        matches!(status, STOPPED | INTERRUPTED)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    #[default]
    Full,
    Directed,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::Full => "full",
            ScanType::Directed => "directed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "directed" => ScanType::Directed,
            _ => ScanType::Full,
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Criticality {
    pub fn weight(&self) -> i64 {
        match self {
            Criticality::Critical => 4,
            Criticality::High => 3,
            Criticality::Medium => 2,
            Criticality::Low => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Criticality::Critical => "critical",
            Criticality::High => "high",
            Criticality::Medium => "medium",
            Criticality::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "critical" => Criticality::Critical,
            "high" => Criticality::High,
            "low" => Criticality::Low,
            _ => Criticality::Medium,
        }
    }
}

/// Severity counts extracted from a finished report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub hosts_scanned: u64,
    pub vulns_high: u64,
    pub vulns_medium: u64,
    pub vulns_low: u64,
    pub vulns_log: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanRecord {
    pub scan_id: String,
    pub probe_name: String,
    pub target: String,
    pub scan_type: ScanType,
    pub ports: Option<Vec<u16>>,
    pub engine_target_id: Option<String>,
    pub engine_task_id: Option<String>,
    pub engine_report_id: Option<String>,
    pub gvm_status: String,
    pub gvm_progress: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub report_xml: Option<String>,
    pub summary: Option<ScanSummary>,
    pub error: Option<String>,
    pub external_target_id: Option<String>,
}

impl ScanRecord {
    pub fn new(
        target: String,
        scan_type: ScanType,
        ports: Option<Vec<u16>>,
        probe_name: String,
        external_target_id: Option<String>,
    ) -> Self {
        Self {
            scan_id: Uuid::new_v4().to_string(),
            probe_name,
            target,
            scan_type,
            ports,
            engine_target_id: None,
            engine_task_id: None,
            engine_report_id: None,
            gvm_status: gvm_status::NEW.to_string(),
            gvm_progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            report_xml: None,
            summary: None,
            error: None,
            external_target_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetRecord {
    pub external_id: String,
    pub host: String,
    pub ports: Option<Vec<u16>>,
    pub scan_type: ScanType,
    pub criticality: Criticality,
    pub criticality_weight: i64,
    pub scan_frequency_hours: i64,
    pub enabled: bool,
    pub tags: Option<BTreeMap<String, serde_json::Value>>,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub next_scan_at: Option<DateTime<Utc>>,
    pub last_scan_id: Option<String>,
    pub synced_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// One target object as delivered by the upstream inventory.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncTarget {
    pub id: String,
    pub host: String,
    #[serde(default)]
    pub ports: Option<Vec<u16>>,
    #[serde(default)]
    pub scan_type: ScanType,
    #[serde(default)]
    pub criticality: Criticality,
    #[serde(default = "default_scan_frequency_hours")]
    pub scan_frequency_hours: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Option<BTreeMap<String, serde_json::Value>>,
}

fn default_scan_frequency_hours() -> i64 {
    168
}

fn default_enabled() -> bool {
    true
}

pub fn validate_target(target: &str) -> Result<(), String> {
    if target.is_empty() {
        return Err("target cannot be empty".to_string());
    }
    if IpAddr::from_str(target).is_ok() {
        return Ok(());
    }
    if let Ok(net) = IpNet::from_str(target) {
        if net.prefix_len() == 0 {
            return Err("/0 networks are not allowed".to_string());
        }
        return Ok(());
    }
    if is_hostname(target) {
        return Ok(());
    }
    Err(format!(
        "invalid target '{target}': must be an IP address, CIDR range, or hostname"
    ))
}

pub fn validate_ports(scan_type: ScanType, ports: Option<&[u16]>) -> Result<(), String> {
    match (scan_type, ports) {
        (ScanType::Directed, None) => Err("directed scan requires 'ports'".to_string()),
        (ScanType::Directed, Some([])) => Err("ports list cannot be empty".to_string()),
        (ScanType::Directed, Some(ports)) => {
            if ports.contains(&0) {
                return Err("port 0 is out of range (1-65535)".to_string());
            }
            Ok(())
        }
        (ScanType::Full, Some(_)) => Err("'ports' is only valid for directed scans".to_string()),
        (ScanType::Full, None) => Ok(()),
    }
}

fn is_hostname(s: &str) -> bool {
    if s.is_empty() || s.len() > 253 {
        return false;
    }
    s.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ip_cidr_and_hostname_targets() {
        assert!(validate_target("192.168.15.20").is_ok());
        assert!(validate_target("10.0.0.0/24").is_ok());
        assert!(validate_target("2001:db8::1").is_ok());
        assert!(validate_target("scanner.internal.example.com").is_ok());
    }

    #[test]
    fn rejects_empty_zero_prefix_and_garbage_targets() {
        assert!(validate_target("").is_err());
        assert!(validate_target("0.0.0.0/0").is_err());
        assert!(validate_target("not a host").is_err());
        assert!(validate_target("-leading.example").is_err());
        assert!(validate_target("trailing-.example").is_err());
    }

    #[test]
    fn directed_scans_require_ports_in_range() {
        assert!(validate_ports(ScanType::Directed, None).is_err());
        assert!(validate_ports(ScanType::Directed, Some(&[])).is_err());
        assert!(validate_ports(ScanType::Directed, Some(&[0, 80])).is_err());
        assert!(validate_ports(ScanType::Directed, Some(&[22, 80, 443])).is_ok());
    }

    #[test]
    fn full_scans_reject_ports() {
        assert!(validate_ports(ScanType::Full, Some(&[80])).is_err());
        assert!(validate_ports(ScanType::Full, None).is_ok());
    }

    #[test]
    fn criticality_weights_are_ordered() {
        assert_eq!(Criticality::Critical.weight(), 4);
        assert_eq!(Criticality::High.weight(), 3);
        assert_eq!(Criticality::Medium.weight(), 2);
        assert_eq!(Criticality::Low.weight(), 1);
        assert_eq!(Criticality::parse("unknown"), Criticality::Medium);
    }

    #[test]
    fn terminal_statuses() {
        assert!(gvm_status::is_terminal(gvm_status::DONE));
        assert!(gvm_status::is_terminal(gvm_status::STOPPED));
        assert!(gvm_status::is_terminal(gvm_status::INTERRUPTED));
        assert!(!gvm_status::is_terminal(gvm_status::NEW));
        assert!(!gvm_status::is_terminal(gvm_status::REQUESTED));
        assert!(!gvm_status::is_terminal(gvm_status::QUEUED));
        assert!(!gvm_status::is_terminal(gvm_status::RUNNING));
        assert!(!gvm_status::is_terminal(gvm_status::STOP_REQUESTED));
        assert!(gvm_status::is_failure(gvm_status::STOPPED));
        assert!(gvm_status::is_failure(gvm_status::INTERRUPTED));
        assert!(!gvm_status::is_failure(gvm_status::DONE));
    }
}
