//! Local CVE signature matching against the SNMP device description.

use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::types::{CveMatch, Severity};

/// One entry of the signature table, in the on-disk JSON shape.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CveSignature {
    #[serde(rename = "cve")]
    pub cve_id: String,
    #[serde(rename = "desc", default)]
    pub description: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(rename = "match_regex")]
    pub pattern: String,
}

fn default_severity() -> Severity {
    Severity::Medium
}

impl CveSignature {
    fn new(cve_id: &str, description: &str, severity: Severity, pattern: &str) -> Self {
        Self {
            cve_id: cve_id.to_string(),
            description: description.to_string(),
            severity,
            pattern: pattern.to_string(),
        }
    }
}

/// Built-in signatures for firmware strings commonly reported in `sysDescr`.
pub fn builtin_signatures() -> Vec<CveSignature> {
    vec![
        CveSignature::new(
            "CVE-2017-6736",
            "Cisco IOS SNMP subsystem remote code execution via crafted SNMP packets",
            Severity::High,
            r"Cisco IOS Software",
        ),
        CveSignature::new(
            "CVE-2014-9222",
            "RomPager 4.07 cookie handling memory corruption (Misfortune Cookie)",
            Severity::High,
            r"RomPager/4\.07",
        ),
        CveSignature::new(
            "CVE-2019-12255",
            "VxWorks IPnet TCP urgent pointer stack overflow (URGENT/11)",
            Severity::High,
            r"VxWorks\s*6\.(5|6|7|8|9)",
        ),
        CveSignature::new(
            "CVE-2015-7755",
            "Juniper ScreenOS unauthorized administrative access",
            Severity::High,
            r"ScreenOS\s*6\.(2|3)\.0r",
        ),
        CveSignature::new(
            "CVE-2008-0960",
            "Net-SNMP SNMPv3 HMAC authentication bypass",
            Severity::High,
            r"net-snmp\s*5\.(3|4\.[01])",
        ),
        CveSignature::new(
            "CVE-2018-10933",
            "libssh server authentication bypass",
            Severity::High,
            r"libssh[-_ ]?0\.(6|7\.[0-5]|8\.[0-3])",
        ),
        CveSignature::new(
            "CVE-2016-6415",
            "Cisco IOS IKEv1 packet processing memory disclosure",
            Severity::Medium,
            r"Cisco IOS.*Version 12\.",
        ),
    ]
}

/// Compiled signature table. Patterns are matched case-insensitively, in table order.
#[derive(Debug, Clone)]
pub struct CveMatcher {
    entries: Vec<(CveSignature, Regex)>,
}

impl CveMatcher {
    /// Compile `signatures`; entries with empty or malformed patterns are skipped.
    pub fn new(signatures: Vec<CveSignature>) -> Self {
        let entries = signatures
            .into_iter()
            .filter(|sig| !sig.pattern.is_empty())
            .filter_map(|sig| {
                match RegexBuilder::new(&sig.pattern).case_insensitive(true).build() {
                    Ok(re) => Some((sig, re)),
                    Err(e) => {
                        warn!(cve = %sig.cve_id, error = %e, "skipping malformed CVE signature");
                        None
                    }
                }
            })
            .collect();
        Self { entries }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_signatures())
    }

    /// Load a JSON array of `{cve, desc, severity, match_regex}` objects.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Signatures(format!("failed to read {}: {e}", path.display()))
        })?;
        let signatures: Vec<CveSignature> = serde_json::from_str(&content).map_err(|e| {
            Error::Signatures(format!("failed to parse {}: {e}", path.display()))
        })?;
        Ok(Self::new(signatures))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn match_description(&self, description: &str) -> Vec<CveMatch> {
        if description.is_empty() {
            return Vec::new();
        }
        self.entries
            .iter()
            .filter(|(_, re)| re.is_match(description))
            .map(|(sig, _)| CveMatch {
                cve_id: sig.cve_id.clone(),
                description: sig.description.clone(),
                severity: sig.severity,
                match_pattern: sig.pattern.clone(),
            })
            .collect()
    }
}

impl Default for CveMatcher {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_case_insensitively_in_table_order() {
        let matcher = CveMatcher::new(vec![
            CveSignature::new("CVE-A", "a", Severity::Low, "mes23"),
            CveSignature::new("CVE-B", "b", Severity::High, "ELTEX"),
            CveSignature::new("CVE-C", "c", Severity::High, "huawei"),
        ]);
        let hits = matcher.match_description("Eltex MES2324 public");
        let ids: Vec<&str> = hits.iter().map(|m| m.cve_id.as_str()).collect();
        assert_eq!(ids, vec!["CVE-A", "CVE-B"]);
        assert_eq!(hits[1].severity, Severity::High);
        assert_eq!(hits[1].match_pattern, "ELTEX");
    }

    #[test]
    fn malformed_pattern_is_skipped() {
        let matcher = CveMatcher::new(vec![
            CveSignature::new("CVE-BAD", "", Severity::High, "([unclosed"),
            CveSignature::new("CVE-EMPTY", "", Severity::High, ""),
            CveSignature::new("CVE-OK", "", Severity::Medium, "routeros"),
        ]);
        assert_eq!(matcher.len(), 1);
        let hits = matcher.match_description("MikroTik RouterOS RB4011");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].cve_id, "CVE-OK");
    }

    #[test]
    fn builtin_table_compiles_and_matches() {
        let matcher = CveMatcher::builtin();
        assert_eq!(matcher.len(), builtin_signatures().len());
        let hits = matcher.match_description(
            "Cisco IOS Software, C2960 Software (C2960-LANBASEK9-M), Version 12.2(55)SE",
        );
        assert!(hits.iter().any(|m| m.cve_id == "CVE-2017-6736"));
        assert!(matcher.match_description("").is_empty());
    }

    #[test]
    fn signature_json_shape() {
        let json = r#"[{"cve":"CVE-1","desc":"d","severity":"HIGH","match_regex":"x"},
                       {"cve":"CVE-2","match_regex":"y"}]"#;
        let sigs: Vec<CveSignature> = serde_json::from_str(json).unwrap();
        assert_eq!(sigs[0].severity, Severity::High);
        assert_eq!(sigs[1].severity, Severity::Medium);
        assert!(sigs[1].description.is_empty());
    }
}
