//! Single-host pipeline: scan, enrich, persist, score, decide liveness.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::enrich::{AggregatedRecord, CveMatcher, DeviceQuery, MitreMatcher};
use crate::error::Result;
use crate::ports::{Module, ModuleSet, ScanPlan};
use crate::probe::Prober;
use crate::risk;
use crate::scanner;
use crate::store::{unix_now, DeviceId, DeviceStore, StoreError};
use crate::types::{DeviceScanReport, EnrichmentRecord, HostScanResult, PortMap, Protocol};

pub const RISK_METRIC: &str = "risk";
pub const DEFAULT_TLS_PORT: u16 = 443;

/// How liveness is decided and what is reported for dead hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlivePolicy {
    /// Count a UDP port that actually answered as a sign of life.
    pub alive_from_udp: bool,
    /// Drop UDP results for hosts deemed dead.
    pub hide_udp_when_dead: bool,
}

impl Default for AlivePolicy {
    fn default() -> Self {
        Self {
            alive_from_udp: false,
            hide_udp_when_dead: true,
        }
    }
}

/// Any open TCP port, an SNMP description, or (policy permitting) an answering UDP port.
pub fn is_alive(scan: &HostScanResult, enrichment: &EnrichmentRecord, policy: AlivePolicy) -> bool {
    !scan.tcp_ports.is_empty()
        || enrichment.snmp_description().is_some()
        || (policy.alive_from_udp && scan.udp_responding() > 0)
}

#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub plan: ScanPlan,
    pub modules: ModuleSet,
    pub policy: AlivePolicy,
    pub tls_port: u16,
}

impl DeviceOptions {
    pub fn new(plan: ScanPlan, modules: ModuleSet) -> Self {
        Self {
            plan,
            modules,
            policy: AlivePolicy::default(),
            tls_port: DEFAULT_TLS_PORT,
        }
    }
}

/// Runs the full pipeline for one host at a time. Cheap to share behind an `Arc`.
pub struct DeviceScanner {
    prober: Arc<dyn Prober>,
    query: Arc<dyn DeviceQuery>,
    store: Arc<dyn DeviceStore>,
    cve: CveMatcher,
    mitre: MitreMatcher,
    options: DeviceOptions,
}

impl DeviceScanner {
    pub fn new(
        prober: Arc<dyn Prober>,
        query: Arc<dyn DeviceQuery>,
        store: Arc<dyn DeviceStore>,
        options: DeviceOptions,
    ) -> Self {
        Self {
            prober,
            query,
            store,
            cve: CveMatcher::builtin(),
            mitre: MitreMatcher::builtin(),
            options,
        }
    }

    pub fn with_signatures(mut self, cve: CveMatcher, mitre: MitreMatcher) -> Self {
        self.cve = cve;
        self.mitre = mitre;
        self
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    /// Scan one host. Only a failure to register the device is returned as an error;
    /// enrichment problems are tagged in the record and other storage writes are logged.
    pub async fn scan(&self, ip: IpAddr) -> Result<DeviceScanReport> {
        let started = Instant::now();
        let opts = &self.options;

        let mut scan = scanner::scan_host(self.prober.clone(), ip, &opts.plan).await;
        debug!(
            %ip,
            tcp_open = scan.tcp_ports.len(),
            udp_seen = scan.udp_ports.len(),
            "port scan finished"
        );

        let device_id = self.store.upsert_device(&ip.to_string())?;
        let scan_time = unix_now();

        let enrichment = self.enrich(device_id, &scan).await;

        self.persist_ports(device_id, scan_time, &scan.tcp_ports, Protocol::Tcp);
        self.persist_ports(device_id, scan_time, &scan.udp_ports, Protocol::Udp);

        let assessment = risk::assess(&scan, &enrichment);
        let labels = json!({
            "mode": opts.plan.mode.as_str(),
            "open_ports": assessment.features.open_port_count,
        });
        log_store_failure(
            ip,
            "insert_metric",
            self.store.insert_metric(
                device_id,
                RISK_METRIC,
                f64::from(assessment.risk),
                Some(&labels),
            ),
        );

        let alive = is_alive(&scan, &enrichment, opts.policy);
        if !alive && opts.policy.hide_udp_when_dead {
            scan.clear_udp();
        }

        let history = json!({
            "mode": opts.plan.mode.as_str(),
            "alive": alive,
            "risk": assessment.risk,
            "tcp_open": scan.tcp_ports.keys().collect::<Vec<_>>(),
            "issues": assessment.issues.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
        });
        log_store_failure(
            ip,
            "insert_history",
            self.store.insert_history(device_id, "scan", &history),
        );

        let duration_ms = started.elapsed().as_millis().min(u64::MAX as u128) as u64;
        info!(%ip, alive, risk = assessment.risk, duration_ms, "host scanned");

        Ok(DeviceScanReport {
            ip,
            alive,
            mode: opts.plan.mode,
            scan,
            enrichment,
            risk: assessment.risk,
            issues: assessment.issues,
            advice: assessment.advice,
            duration_ms,
        })
    }

    /// SNMP, then CVE, then MITRE, then TLS. Each step sees only what came before it.
    async fn enrich(&self, device_id: DeviceId, scan: &HostScanResult) -> EnrichmentRecord {
        let ip = scan.ip;
        let modules = &self.options.modules;
        let mut record = EnrichmentRecord::default();

        if modules.contains(Module::Snmp) {
            let outcome = self.query.sys_descr(ip).await;
            debug!(%ip, ?outcome, "snmp step");
            record.snmp = Some(outcome);
        }

        if modules.contains(Module::Cve) {
            if let Some(description) = record.snmp_description() {
                let matches = self.cve.match_description(description);
                for m in &matches {
                    log_store_failure(
                        ip,
                        "insert_vuln",
                        self.store
                            .insert_vuln(device_id, &m.cve_id, &m.description, m.severity),
                    );
                }
                record.cve_matches = Some(matches);
            }
        }

        if modules.contains(Module::Mitre) {
            let aggregated = AggregatedRecord {
                tcp_ports: &scan.tcp_ports,
                udp_ports: &scan.udp_ports,
                snmp_description: record.snmp_description(),
                cve_matches: record.cves(),
            };
            let findings = self.mitre.evaluate(&aggregated);
            for f in &findings {
                let evidence = serde_json::to_value(f).unwrap_or(serde_json::Value::Null);
                log_store_failure(
                    ip,
                    "insert_mitre_finding",
                    self.store.insert_mitre_finding(
                        device_id,
                        &f.technique_id,
                        &f.technique_name,
                        f.rule.as_str(),
                        f.confidence.as_str(),
                        &evidence,
                    ),
                );
            }
            record.mitre_findings = Some(findings);
        }

        if modules.contains(Module::Tls) && scan.tcp_open(self.options.tls_port) {
            record.tls = Some(self.query.certificate(ip, self.options.tls_port).await);
        }

        record
    }

    fn persist_ports(&self, device_id: DeviceId, scan_time: i64, ports: &PortMap, proto: Protocol) {
        for (port, outcome) in ports {
            let raw = serde_json::to_string(outcome).ok();
            if let Err(e) = self.store.insert_scan(
                device_id,
                scan_time,
                *port,
                proto.as_str(),
                outcome.state.as_str(),
                &outcome.banner,
                raw.as_deref(),
            ) {
                warn!(device_id, port, protocol = proto.as_str(), error = %e, "failed to store port observation");
            }
        }
    }
}

fn log_store_failure(ip: IpAddr, op: &str, result: std::result::Result<(), StoreError>) {
    if let Err(e) = result {
        warn!(%ip, op, error = %e, "storage write failed, continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PortOutcome, StepOutcome};
    use std::net::Ipv4Addr;

    fn host(tcp: &[u16], udp: &[(u16, bool)]) -> HostScanResult {
        let tcp: PortMap = tcp.iter().map(|p| (*p, PortOutcome::open(b""))).collect();
        let udp: PortMap = udp
            .iter()
            .map(|(p, answered)| {
                let o = if *answered {
                    PortOutcome::open(b"\x01")
                } else {
                    PortOutcome::open_or_filtered()
                };
                (*p, o)
            })
            .collect();
        HostScanResult::from_scans(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), tcp, 10, udp, 8)
    }

    #[test]
    fn tcp_alone_makes_a_host_alive() {
        let e = EnrichmentRecord::default();
        assert!(is_alive(&host(&[80], &[]), &e, AlivePolicy::default()));
    }

    #[test]
    fn open_or_filtered_udp_never_counts() {
        let e = EnrichmentRecord::default();
        let scan = host(&[], &[(53, false), (161, false)]);
        let permissive = AlivePolicy {
            alive_from_udp: true,
            ..AlivePolicy::default()
        };
        assert!(!is_alive(&scan, &e, AlivePolicy::default()));
        assert!(!is_alive(&scan, &e, permissive));

        let answered = host(&[], &[(53, true)]);
        assert!(!is_alive(&answered, &e, AlivePolicy::default()));
        assert!(is_alive(&answered, &e, permissive));
    }

    #[test]
    fn snmp_description_counts_but_failures_do_not() {
        let scan = host(&[], &[]);
        let found = EnrichmentRecord {
            snmp: Some(StepOutcome::Found("switch".into())),
            ..EnrichmentRecord::default()
        };
        let failed = EnrichmentRecord {
            snmp: Some(StepOutcome::Failed("bad ber".into())),
            ..EnrichmentRecord::default()
        };
        assert!(is_alive(&scan, &found, AlivePolicy::default()));
        assert!(!is_alive(&scan, &failed, AlivePolicy::default()));
    }
}
