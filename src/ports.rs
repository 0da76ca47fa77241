use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Curated TCP services probed in `special` mode.
pub const SPECIAL_TCP_PORTS: &[u16] = &[
    21, 22, 23, 25, 80, 110, 143, 443, 993, 995, 3306, 3389, 8080, 8443,
];

/// Curated UDP services probed in `special` mode:
/// DNS, DHCP, TFTP, NTP, SNMP, IKE, SSDP, IPsec NAT-T.
pub const SPECIAL_UDP_PORTS: &[u16] = &[53, 67, 69, 123, 161, 500, 1900, 4500];

pub const QUICK_TIMEOUT_FLOOR: Duration = Duration::from_millis(600);
pub const SPECIAL_TIMEOUT_FLOOR: Duration = Duration::from_millis(600);
pub const FULL_TIMEOUT_FLOOR: Duration = Duration::from_millis(200);
/// Full mode never runs with fewer TCP workers than this.
pub const FULL_MODE_CONCURRENCY: usize = 300;
pub const MAX_CONCURRENCY: usize = 5_000;

/// Parse a port spec like `22,80,1000-1010` into a sorted, deduplicated list (1..=65535).
///
/// Supported tokens, separated by commas or newlines:
/// - single port number: `80`
/// - inclusive range: `8000-8010` (reversed bounds are swapped)
/// - comments: everything after `#` on a line is ignored
///
/// Malformed tokens and out-of-range values are dropped; the parse itself never fails.
pub fn parse_ports_str(s: &str) -> Vec<u16> {
    let mut out = BTreeSet::new();

    for raw_line in s.lines() {
        let line = raw_line.split('#').next().unwrap_or("");
        for token in line.split(',').map(str::trim) {
            if token.is_empty() {
                continue;
            }

            // Range `start-end`
            if let Some((a, b)) = token.split_once('-') {
                let (Some(start), Some(end)) = (parse_number(a), parse_number(b)) else {
                    continue;
                };
                let (start, end) = if start > end { (end, start) } else { (start, end) };
                out.extend((start.max(1)..=end.min(65535)).filter_map(in_port_range));
                continue;
            }

            if let Some(p) = parse_number(token).and_then(in_port_range) {
                out.insert(p);
            }
        }
    }

    out.into_iter().collect()
}

fn parse_number(s: &str) -> Option<u32> {
    s.trim().parse::<u32>().ok()
}

fn in_port_range(v: u32) -> Option<u16> {
    if (1..=65535).contains(&v) {
        Some(v as u16)
    } else {
        None
    }
}

/// Named port-selection policy.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Explicit TCP ports only, no UDP.
    #[default]
    Quick,
    /// Curated TCP and UDP service sets.
    Special,
    /// Every TCP and UDP port. Slow and intrusive.
    Full,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Quick => "quick",
            ScanMode::Special => "special",
            ScanMode::Full => "full",
        }
    }

    pub fn probes_udp(&self) -> bool {
        !matches!(self, ScanMode::Quick)
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(ScanMode::Quick),
            "special" => Ok(ScanMode::Special),
            "full" => Ok(ScanMode::Full),
            _ => Err(Error::InvalidMode(s.to_string())),
        }
    }
}

/// Optional enrichment step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Module {
    Snmp,
    Cve,
    Mitre,
    Tls,
}

impl Module {
    pub fn as_str(&self) -> &'static str {
        match self {
            Module::Snmp => "snmp",
            Module::Cve => "cve",
            Module::Mitre => "mitre",
            Module::Tls => "tls",
        }
    }
}

impl FromStr for Module {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snmp" => Ok(Module::Snmp),
            "cve" => Ok(Module::Cve),
            "mitre" => Ok(Module::Mitre),
            "tls" => Ok(Module::Tls),
            _ => Err(Error::InvalidModule(s.to_string())),
        }
    }
}

/// The caller-selected subset of enrichment modules.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct ModuleSet(BTreeSet<Module>);

impl ModuleSet {
    pub fn all() -> Self {
        [Module::Snmp, Module::Cve, Module::Mitre, Module::Tls]
            .into_iter()
            .collect()
    }

    /// Parse a comma list such as `snmp,cve`. Empty input selects nothing.
    pub fn parse(s: &str) -> Result<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(Module::from_str)
            .collect()
    }

    pub fn contains(&self, module: Module) -> bool {
        self.0.contains(&module)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Module> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Module> for ModuleSet {
    fn from_iter<I: IntoIterator<Item = Module>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ModuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|m| m.as_str()).collect();
        f.write_str(&names.join(","))
    }
}

/// Caller-requested timing before mode floors and caps are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanTuning {
    pub concurrency: usize,
    pub tcp_timeout: Duration,
    pub udp_concurrency: usize,
    pub udp_timeout: Duration,
}

impl Default for ScanTuning {
    fn default() -> Self {
        Self {
            concurrency: 100,
            tcp_timeout: Duration::from_secs(1),
            udp_concurrency: 50,
            udp_timeout: Duration::from_secs(1),
        }
    }
}

/// Concrete port sets and pool parameters for one host scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPlan {
    pub mode: ScanMode,
    pub tcp_ports: Vec<u16>,
    pub udp_ports: Vec<u16>,
    pub tcp_timeout: Duration,
    pub concurrency: usize,
    pub udp_timeout: Duration,
    pub udp_concurrency: usize,
}

/// Derive the port sets and timing for `mode`.
///
/// `explicit_ports` is only honoured in quick mode; quick mode without it resolves to an
/// empty plan, which the scanner reports as "not scanned".
pub fn resolve(mode: ScanMode, explicit_ports: Option<&str>, tuning: &ScanTuning) -> ScanPlan {
    let concurrency = tuning.concurrency.clamp(1, MAX_CONCURRENCY);
    let udp_concurrency = tuning.udp_concurrency.clamp(1, MAX_CONCURRENCY);

    match mode {
        ScanMode::Quick => ScanPlan {
            mode,
            tcp_ports: explicit_ports.map(parse_ports_str).unwrap_or_default(),
            udp_ports: Vec::new(),
            tcp_timeout: tuning.tcp_timeout.max(QUICK_TIMEOUT_FLOOR),
            concurrency,
            udp_timeout: tuning.udp_timeout,
            udp_concurrency,
        },
        ScanMode::Special => ScanPlan {
            mode,
            tcp_ports: sorted(SPECIAL_TCP_PORTS),
            udp_ports: sorted(SPECIAL_UDP_PORTS),
            tcp_timeout: tuning.tcp_timeout.max(SPECIAL_TIMEOUT_FLOOR),
            concurrency,
            udp_timeout: tuning.udp_timeout,
            udp_concurrency,
        },
        ScanMode::Full => ScanPlan {
            mode,
            tcp_ports: all_ports(),
            udp_ports: all_ports(),
            tcp_timeout: tuning.tcp_timeout.max(FULL_TIMEOUT_FLOOR),
            concurrency: concurrency.max(FULL_MODE_CONCURRENCY),
            udp_timeout: tuning.udp_timeout,
            udp_concurrency,
        },
    }
}

/// String-typed entry point: validates `mode` before resolving.
pub fn resolve_mode(
    mode: &str,
    explicit_ports: Option<&str>,
    tuning: &ScanTuning,
) -> Result<ScanPlan> {
    Ok(resolve(mode.parse()?, explicit_ports, tuning))
}

fn sorted(ports: &[u16]) -> Vec<u16> {
    let set: BTreeSet<u16> = ports.iter().copied().collect();
    set.into_iter().collect()
}

/// All ports (1-65535)
pub fn all_ports() -> Vec<u16> {
    (1..=65535).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_ports() {
        let ports = parse_ports_str("80,22,   443  ");
        assert_eq!(ports, vec![22, 80, 443]);
    }

    #[test]
    fn parse_ranges_and_dedup() {
        let ports = parse_ports_str("8000-8002,80,8001");
        assert_eq!(ports, vec![80, 8000, 8001, 8002]);
    }

    #[test]
    fn reversed_range_is_swapped() {
        assert_eq!(parse_ports_str("12-10"), vec![10, 11, 12]);
    }

    #[test]
    fn parse_with_comments_and_newlines() {
        let input = r#"
            # common web ports
            80  # http
            443,8443
        "#;
        assert_eq!(parse_ports_str(input), vec![80, 443, 8443]);
    }

    #[test]
    fn malformed_tokens_are_dropped() {
        assert_eq!(
            parse_ports_str("22,80,1000-1002,999999"),
            vec![22, 80, 1000, 1001, 1002]
        );
        assert_eq!(parse_ports_str("abc,0,-5,7-x,65535"), vec![65535]);
        assert!(parse_ports_str("").is_empty());
    }

    #[test]
    fn range_is_clamped_to_valid_ports() {
        assert_eq!(parse_ports_str("65533-70000"), vec![65533, 65534, 65535]);
    }

    #[test]
    fn quick_without_ports_is_empty() {
        let plan = resolve(ScanMode::Quick, None, &ScanTuning::default());
        assert!(plan.tcp_ports.is_empty());
        assert!(plan.udp_ports.is_empty());
    }

    #[test]
    fn quick_never_probes_udp() {
        let plan = resolve(ScanMode::Quick, Some("53,161"), &ScanTuning::default());
        assert_eq!(plan.tcp_ports, vec![53, 161]);
        assert!(plan.udp_ports.is_empty());
    }

    #[test]
    fn timeout_floors_apply() {
        let tuning = ScanTuning {
            tcp_timeout: Duration::from_millis(50),
            ..ScanTuning::default()
        };
        assert_eq!(
            resolve(ScanMode::Quick, None, &tuning).tcp_timeout,
            Duration::from_millis(600)
        );
        assert_eq!(
            resolve(ScanMode::Special, None, &tuning).tcp_timeout,
            Duration::from_millis(600)
        );
        assert_eq!(
            resolve(ScanMode::Full, None, &tuning).tcp_timeout,
            Duration::from_millis(200)
        );
    }

    #[test]
    fn special_uses_curated_sets() {
        let plan = resolve(ScanMode::Special, Some("9999"), &ScanTuning::default());
        assert!(plan.tcp_ports.contains(&23) && plan.tcp_ports.contains(&3389));
        assert!(!plan.tcp_ports.contains(&9999));
        assert!(plan.udp_ports.contains(&161) && plan.udp_ports.contains(&4500));
    }

    #[test]
    fn full_covers_everything_with_raised_pool() {
        let plan = resolve(ScanMode::Full, None, &ScanTuning::default());
        assert_eq!(plan.tcp_ports.len(), 65535);
        assert_eq!(plan.udp_ports.len(), 65535);
        assert_eq!(plan.concurrency, FULL_MODE_CONCURRENCY);
    }

    #[test]
    fn mode_and_modules_validate() {
        assert!(matches!("turbo".parse::<ScanMode>(), Err(Error::InvalidMode(_))));
        assert_eq!(" Special ".parse::<ScanMode>().unwrap(), ScanMode::Special);
        let set = ModuleSet::parse("snmp, cve").unwrap();
        assert!(set.contains(Module::Snmp) && set.contains(Module::Cve));
        assert!(!set.contains(Module::Tls));
        assert!(matches!(ModuleSet::parse("snmp,ldap"), Err(Error::InvalidModule(_))));
        assert!(ModuleSet::parse("").unwrap().is_empty());
    }
}
