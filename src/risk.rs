//! Heuristic risk score and declarative issue list.

use std::net::IpAddr;

use serde::Serialize;

use crate::types::{EnrichmentRecord, HostScanResult, Issue, Severity};

pub const TELNET_PORT: u16 = 23;
pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;
pub const MANY_PORTS_THRESHOLD: usize = 20;

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiskFeatures {
    /// Open TCP ports plus UDP ports that actually answered.
    pub open_port_count: usize,
    pub snmp_public_exposed: bool,
    pub telnet_open: bool,
    pub has_high_cve: bool,
    /// No detection exists for this; it stays false.
    pub default_creds: bool,
}

impl RiskFeatures {
    pub fn from_evidence(scan: &HostScanResult, enrichment: &EnrichmentRecord) -> Self {
        Self {
            open_port_count: scan.tcp_ports.len() + scan.udp_responding(),
            snmp_public_exposed: enrichment.snmp_description().is_some_and(mentions_public),
            telnet_open: scan.tcp_open(TELNET_PORT),
            has_high_cve: enrichment.cves().iter().any(|c| c.severity == Severity::High),
            default_creds: false,
        }
    }
}

fn mentions_public(description: &str) -> bool {
    description.to_ascii_lowercase().contains("public")
}

/// `min(ports*3, 30) + 25 snmp + 25 telnet + 30 cve + 15 creds`, capped at 100.
pub fn risk_score(f: &RiskFeatures) -> u8 {
    let mut score = f.open_port_count.saturating_mul(3).min(30);
    if f.snmp_public_exposed {
        score += 25;
    }
    if f.telnet_open {
        score += 25;
    }
    if f.has_high_cve {
        score += 30;
    }
    if f.default_creds {
        score += 15;
    }
    score.min(100) as u8
}

/// Every rule is evaluated on its own; several may fire for one host.
pub fn derive_issues(
    scan: &HostScanResult,
    enrichment: &EnrichmentRecord,
    features: &RiskFeatures,
) -> Vec<Issue> {
    let mut issues = Vec::new();

    if scan.tcp_open(TELNET_PORT) {
        issues.push(issue(
            "TELNET_OPEN",
            "Telnet is open (23/tcp)",
            Severity::High,
            "The device accepts Telnet, which sends credentials in cleartext.",
            "Disable Telnet and use SSH (22/tcp). If it cannot be disabled, restrict it with ACLs or behind a VPN.",
        ));
    }

    if enrichment.snmp_description().is_some_and(mentions_public) {
        issues.push(issue(
            "SNMP_PUBLIC",
            "SNMP community 'public'",
            Severity::High,
            "SNMP answers with the default 'public' community, which is trivially guessed.",
            "Set a unique community string, restrict SNMP to management addresses, or disable SNMP if unused.",
        ));
    }

    if scan.tcp_open(HTTP_PORT) && !scan.tcp_open(HTTPS_PORT) {
        issues.push(issue(
            "HTTP_NO_HTTPS",
            "Web interface over HTTP only",
            Severity::Medium,
            "The web interface is reachable over HTTP without HTTPS, so logins travel unencrypted.",
            "Enable HTTPS on the device, turn off HTTP, or limit the web interface to the management network.",
        ));
    }

    for cve in enrichment
        .cves()
        .iter()
        .filter(|c| c.severity == Severity::High)
    {
        let description = if cve.description.is_empty() {
            "Critical vulnerability in the device firmware.".to_string()
        } else {
            cve.description.clone()
        };
        issues.push(Issue {
            id: format!("CVE_{}", cve.cve_id),
            title: format!("HIGH CVE: {}", cve.cve_id),
            severity: Severity::High,
            description,
            recommendation: "Check for a vendor firmware update and apply it. Until then, restrict \
                             access to the affected services with ACLs or segmentation."
                .to_string(),
        });
    }

    if features.open_port_count > MANY_PORTS_THRESHOLD {
        issues.push(Issue {
            id: "MANY_PORTS".to_string(),
            title: "Large number of open ports".to_string(),
            severity: Severity::Medium,
            description: format!(
                "{} ports are open. Every exposed service widens the attack surface.",
                features.open_port_count
            ),
            recommendation: "Disable unused services and filter traffic at the perimeter \
                             (firewalls, ACLs)."
                .to_string(),
        });
    }

    issues
}

fn issue(id: &str, title: &str, severity: Severity, description: &str, recommendation: &str) -> Issue {
    Issue {
        id: id.to_string(),
        title: title.to_string(),
        severity,
        description: description.to_string(),
        recommendation: recommendation.to_string(),
    }
}

/// Remediation class an issue belongs to, as named in advice text.
fn remediation_class(issue_id: &str) -> &'static str {
    match issue_id {
        "TELNET_OPEN" => "replace Telnet with SSH",
        "SNMP_PUBLIC" => "change or disable the SNMP 'public' community",
        "HTTP_NO_HTTPS" => "serve the web interface over HTTPS only",
        "MANY_PORTS" => "close unused services",
        id if id.starts_with("CVE_") => "update firmware to fix HIGH CVEs",
        _ => "review the reported findings",
    }
}

/// Summary sentence picked by score band, naming the remediation classes present.
pub fn advice_text(ip: IpAddr, risk: u8, issues: &[Issue]) -> String {
    let mut classes: Vec<&str> = Vec::new();
    for issue in issues {
        let class = remediation_class(&issue.id);
        if !classes.contains(&class) {
            classes.push(class);
        }
    }

    let band = match risk {
        80.. => "CRITICAL",
        50..=79 => "ELEVATED",
        _ => "MODERATE",
    };
    let head = format!("Overall risk for {ip}: {risk}/100 ({band}).");

    if classes.is_empty() {
        return format!(
            "{head} No specific exposures found; keep management interfaces reachable only \
             from the admin network and firmware up to date."
        );
    }
    let lead = match band {
        "CRITICAL" => "Act first on",
        "ELEVATED" => "Recommended",
        _ => "Still worth doing",
    };
    format!("{head} {lead}: {}.", classes.join("; "))
}

/// Score, issues and advice for one host.
#[derive(Debug, Clone)]
pub struct Assessment {
    pub features: RiskFeatures,
    pub risk: u8,
    pub issues: Vec<Issue>,
    pub advice: String,
}

pub fn assess(scan: &HostScanResult, enrichment: &EnrichmentRecord) -> Assessment {
    let features = RiskFeatures::from_evidence(scan, enrichment);
    let risk = risk_score(&features);
    let issues = derive_issues(scan, enrichment, &features);
    let advice = advice_text(scan.ip, risk, &issues);
    Assessment {
        features,
        risk,
        issues,
        advice,
    }
}
