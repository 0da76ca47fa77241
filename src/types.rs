use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::ports::{ScanMode, SPECIAL_TCP_PORTS, SPECIAL_UDP_PORTS};

/// Upper bound on bytes kept from any banner or UDP response.
pub const MAX_BANNER_LEN: usize = 1024;

/// Observed state of a port that produced a result. Closed ports are simply absent.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortState {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "open|filtered")]
    OpenOrFiltered,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Open => "open",
            PortState::OpenOrFiltered => "open|filtered",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Result of one successful probe.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortOutcome {
    pub state: PortState,
    pub banner: String,
}

impl PortOutcome {
    /// Open port with whatever the peer sent, truncated to [`MAX_BANNER_LEN`].
    pub fn open(banner: &[u8]) -> Self {
        Self {
            state: PortState::Open,
            banner: banner_text(banner),
        }
    }

    pub fn open_or_filtered() -> Self {
        Self {
            state: PortState::OpenOrFiltered,
            banner: String::new(),
        }
    }
}

/// Lossy UTF-8, then cut on a char boundary: replacement chars take three bytes each.
fn banner_text(bytes: &[u8]) -> String {
    let n = bytes.len().min(MAX_BANNER_LEN);
    let mut text = String::from_utf8_lossy(&bytes[..n]).into_owned();
    if text.len() > MAX_BANNER_LEN {
        let mut end = MAX_BANNER_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

/// port -> outcome, ordered by port so merged results never depend on completion order.
pub type PortMap = BTreeMap<u16, PortOutcome>;

/// Port scan results for one host, TCP and UDP kept apart.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HostScanResult {
    pub ip: IpAddr,
    pub tcp_ports: PortMap,
    /// Key-filtered view of `tcp_ports` over the curated service list.
    pub special_tcp_ports: PortMap,
    pub udp_ports: PortMap,
    pub special_udp_ports: PortMap,
    pub scanned_tcp_count: usize,
    pub scanned_udp_count: usize,
}

impl HostScanResult {
    /// A host for which no port set was resolved.
    pub fn not_scanned(ip: IpAddr) -> Self {
        Self::from_scans(ip, PortMap::new(), 0, PortMap::new(), 0)
    }

    pub fn from_scans(
        ip: IpAddr,
        tcp_ports: PortMap,
        scanned_tcp_count: usize,
        udp_ports: PortMap,
        scanned_udp_count: usize,
    ) -> Self {
        let special_tcp_ports = filter_keys(&tcp_ports, SPECIAL_TCP_PORTS);
        let special_udp_ports = filter_keys(&udp_ports, SPECIAL_UDP_PORTS);
        Self {
            ip,
            tcp_ports,
            special_tcp_ports,
            udp_ports,
            special_udp_ports,
            scanned_tcp_count,
            scanned_udp_count,
        }
    }

    pub fn is_tcp_scanned(&self) -> bool {
        self.scanned_tcp_count > 0
    }

    pub fn tcp_open(&self, port: u16) -> bool {
        self.tcp_ports.contains_key(&port)
    }

    /// UDP ports that actually answered (never `open|filtered`).
    pub fn udp_responding(&self) -> usize {
        self.udp_ports
            .values()
            .filter(|o| o.state == PortState::Open)
            .count()
    }

    /// Drop all UDP evidence, including the count of probed ports.
    pub fn clear_udp(&mut self) {
        self.udp_ports.clear();
        self.special_udp_ports.clear();
        self.scanned_udp_count = 0;
    }
}

fn filter_keys(ports: &PortMap, keys: &[u16]) -> PortMap {
    ports
        .iter()
        .filter(|(p, _)| keys.contains(p))
        .map(|(p, o)| (*p, o.clone()))
        .collect()
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[serde(alias = "low")]
    Low,
    #[serde(alias = "medium")]
    Medium,
    #[serde(alias = "high")]
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A signature hit against the SNMP device description.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CveMatch {
    pub cve_id: String,
    pub description: String,
    pub severity: Severity,
    pub match_pattern: String,
}

/// Detection predicates a MITRE mapping entry can reference.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    SshOpen,
    HttpOpen,
    TelnetOpen,
    SnmpSysdescr,
    /// UDP 161 answered a probe.
    SnmpUdpOpen,
    /// Keyword match (`eltex|firmware|version`) in any TCP banner.
    HttpFw,
    KnownCve,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::SshOpen => "ssh_open",
            RuleKind::HttpOpen => "http_open",
            RuleKind::TelnetOpen => "telnet_open",
            RuleKind::SnmpSysdescr => "snmp_sysdescr",
            RuleKind::SnmpUdpOpen => "snmp_udp_open",
            RuleKind::HttpFw => "http_fw",
            RuleKind::KnownCve => "known_cve",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MitreFinding {
    pub technique_id: String,
    pub technique_name: String,
    pub rule: RuleKind,
    pub confidence: Confidence,
}

/// Normalized certificate fields, whichever retrieval path produced them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    pub subject: String,
    pub issuer: String,
    /// RFC 3339
    pub not_before: String,
    pub not_after: String,
    /// Produced by a handshake that validated the chain.
    pub verified: bool,
    pub expired: bool,
}

/// Outcome of one best-effort enrichment step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum StepOutcome<T> {
    Found(T),
    /// Ran, but the device had nothing to offer.
    Absent,
    Failed(String),
}

impl<T> StepOutcome<T> {
    pub fn found(&self) -> Option<&T> {
        match self {
            StepOutcome::Found(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_found(self) -> Option<T> {
        match self {
            StepOutcome::Found(v) => Some(v),
            _ => None,
        }
    }
}

/// Evidence gathered beyond port state. `None` means the module did not run.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snmp: Option<StepOutcome<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cve_matches: Option<Vec<CveMatch>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mitre_findings: Option<Vec<MitreFinding>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<StepOutcome<CertInfo>>,
}

impl EnrichmentRecord {
    pub fn snmp_description(&self) -> Option<&str> {
        self.snmp
            .as_ref()
            .and_then(StepOutcome::found)
            .map(String::as_str)
    }

    pub fn cves(&self) -> &[CveMatch] {
        self.cve_matches.as_deref().unwrap_or(&[])
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub id: String,
    pub title: String,
    pub severity: Severity,
    pub description: String,
    pub recommendation: String,
}

/// Everything learned about one host in one run.
#[derive(Serialize, Debug, Clone)]
pub struct DeviceScanReport {
    pub ip: IpAddr,
    pub alive: bool,
    pub mode: ScanMode,
    pub scan: HostScanResult,
    pub enrichment: EnrichmentRecord,
    pub risk: u8,
    pub issues: Vec<Issue>,
    pub advice: String,
    pub duration_ms: u64,
}

#[derive(Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum FleetEntry {
    Device(Box<DeviceScanReport>),
    Failed { ip: IpAddr, error: String },
}

impl FleetEntry {
    pub fn ip(&self) -> IpAddr {
        match self {
            FleetEntry::Device(r) => r.ip,
            FleetEntry::Failed { ip, .. } => *ip,
        }
    }
}

/// One batch run over a host list, in input order.
#[derive(Serialize, Debug, Clone)]
pub struct FleetReport {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub cancelled: bool,
    pub hosts_requested: usize,
    pub entries: Vec<FleetEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_banner_stays_within_cap() {
        let out = PortOutcome::open(&[0xff; 4 * MAX_BANNER_LEN]);
        assert!(!out.banner.is_empty());
        assert!(out.banner.len() <= MAX_BANNER_LEN);
        assert!(out.banner.chars().all(|c| c == char::REPLACEMENT_CHARACTER));
    }

    #[test]
    fn multibyte_banner_is_cut_on_char_boundary() {
        let text = "Привет".repeat(200);
        let out = PortOutcome::open(text.as_bytes());
        assert!(out.banner.len() <= MAX_BANNER_LEN);
        assert!(text.starts_with(out.banner.trim_end_matches(char::REPLACEMENT_CHARACTER)));
    }

    #[test]
    fn short_banner_is_kept() {
        assert_eq!(PortOutcome::open(b"SSH-2.0-dropbear").banner, "SSH-2.0-dropbear");
    }
}
