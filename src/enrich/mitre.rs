//! ATT&CK technique mapping over the aggregated device record.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Confidence, CveMatch, MitreFinding, PortMap, PortState, RuleKind};

const BANNER_KEYWORDS: &[&str] = &["eltex", "firmware", "version"];
const SNMP_PORT: u16 = 161;

/// Everything the rules may look at.
#[derive(Debug, Clone, Copy)]
pub struct AggregatedRecord<'a> {
    pub tcp_ports: &'a PortMap,
    pub udp_ports: &'a PortMap,
    pub snmp_description: Option<&'a str>,
    pub cve_matches: &'a [CveMatch],
}

impl RuleKind {
    pub fn evaluate(&self, rec: &AggregatedRecord<'_>) -> bool {
        match self {
            RuleKind::SshOpen => rec.tcp_ports.contains_key(&22),
            RuleKind::HttpOpen => rec.tcp_ports.contains_key(&80) || rec.tcp_ports.contains_key(&443),
            RuleKind::TelnetOpen => rec.tcp_ports.contains_key(&23),
            RuleKind::SnmpSysdescr => rec.snmp_description.is_some_and(|d| !d.is_empty()),
            // open|filtered is silence, not an agent
            RuleKind::SnmpUdpOpen => rec
                .udp_ports
                .get(&SNMP_PORT)
                .is_some_and(|o| o.state == PortState::Open),
            RuleKind::HttpFw => rec.tcp_ports.values().any(|o| {
                let banner = o.banner.to_ascii_lowercase();
                BANNER_KEYWORDS.iter().any(|k| banner.contains(k))
            }),
            RuleKind::KnownCve => !rec.cve_matches.is_empty(),
        }
    }
}

/// A technique and the rules that indicate it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TechniqueMapping {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub detection_rules: Vec<RuleKind>,
}

impl TechniqueMapping {
    fn new(id: &str, name: &str, rules: &[RuleKind]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            detection_rules: rules.to_vec(),
        }
    }
}

pub fn builtin_mappings() -> Vec<TechniqueMapping> {
    use RuleKind::*;
    vec![
        TechniqueMapping::new(
            "T1190",
            "Exploit Public-Facing Application",
            &[HttpOpen, HttpFw, KnownCve],
        ),
        TechniqueMapping::new("T1021.004", "Remote Services: SSH", &[SshOpen]),
        TechniqueMapping::new("T1021", "Remote Services", &[TelnetOpen]),
        TechniqueMapping::new("T1040", "Network Sniffing", &[TelnetOpen]),
        TechniqueMapping::new(
            "T1602.001",
            "Data from Configuration Repository: SNMP (MIB Dump)",
            &[SnmpSysdescr, SnmpUdpOpen],
        ),
        TechniqueMapping::new(
            "T1082",
            "System Information Discovery",
            &[SnmpSysdescr, HttpFw],
        ),
    ]
}

#[derive(Debug, Clone)]
pub struct MitreMatcher {
    mappings: Vec<TechniqueMapping>,
}

impl MitreMatcher {
    pub fn new(mappings: Vec<TechniqueMapping>) -> Self {
        Self { mappings }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_mappings())
    }

    /// Load a JSON array of `{id, name, detection_rules}`. Unknown rule names fail the load.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Signatures(format!("failed to read {}: {e}", path.display()))
        })?;
        let mappings = serde_json::from_str(&content).map_err(|e| {
            Error::Signatures(format!("failed to parse {}: {e}", path.display()))
        })?;
        Ok(Self::new(mappings))
    }

    pub fn mappings(&self) -> &[TechniqueMapping] {
        &self.mappings
    }

    /// One finding per `(technique, rule)` pair that holds, in table order.
    pub fn evaluate(&self, rec: &AggregatedRecord<'_>) -> Vec<MitreFinding> {
        self.mappings
            .iter()
            .flat_map(|m| {
                m.detection_rules
                    .iter()
                    .filter(|rule| rule.evaluate(rec))
                    .map(move |rule| MitreFinding {
                        technique_id: m.id.clone(),
                        technique_name: m.name.clone(),
                        rule: *rule,
                        confidence: Confidence::Medium,
                    })
            })
            .collect()
    }
}

impl Default for MitreMatcher {
    fn default() -> Self {
        Self::builtin()
    }
}
