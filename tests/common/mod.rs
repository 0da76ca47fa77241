#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lan_audit_rs::device::{DeviceOptions, DeviceScanner};
use lan_audit_rs::enrich::{CveMatcher, CveSignature, DeviceQuery, MitreMatcher};
use lan_audit_rs::ports::{resolve, ModuleSet, ScanMode, ScanTuning};
use lan_audit_rs::probe::Prober;
use lan_audit_rs::store::{DeviceId, DeviceStore, StoreError, StoreResult};
use lan_audit_rs::types::{CertInfo, PortOutcome, Severity, StepOutcome};
use tokio_util::sync::CancellationToken;

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// What one fake host answers.
#[derive(Default, Clone)]
pub struct FakeHost {
    pub tcp: HashMap<u16, &'static str>,
    pub udp: HashMap<u16, Option<&'static [u8]>>,
}

impl FakeHost {
    pub fn tcp(mut self, port: u16, banner: &'static str) -> Self {
        self.tcp.insert(port, banner);
        self
    }

    /// `Some(bytes)` answers, `None` stays silent (open|filtered).
    pub fn udp(mut self, port: u16, reply: Option<&'static [u8]>) -> Self {
        self.udp.insert(port, reply);
        self
    }
}

/// In-process network. Records every host that was probed and can trip a
/// cancellation token the first time a given host is touched.
#[derive(Default)]
pub struct FakeNet {
    pub hosts: HashMap<IpAddr, FakeHost>,
    pub probed: Mutex<BTreeSet<IpAddr>>,
    pub cancel_on: Option<(IpAddr, CancellationToken)>,
}

impl FakeNet {
    pub fn with_host(mut self, addr: IpAddr, host: FakeHost) -> Self {
        self.hosts.insert(addr, host);
        self
    }

    pub fn probed(&self) -> BTreeSet<IpAddr> {
        self.probed.lock().unwrap().clone()
    }

    fn touch(&self, addr: IpAddr) {
        self.probed.lock().unwrap().insert(addr);
        if let Some((trigger, token)) = &self.cancel_on {
            if *trigger == addr {
                token.cancel();
            }
        }
    }
}

#[async_trait]
impl Prober for FakeNet {
    async fn probe_tcp(&self, addr: IpAddr, port: u16, _t: Duration) -> Option<PortOutcome> {
        self.touch(addr);
        let banner = self.hosts.get(&addr)?.tcp.get(&port)?;
        Some(PortOutcome::open(banner.as_bytes()))
    }

    async fn probe_udp(&self, addr: IpAddr, port: u16, _t: Duration) -> Option<PortOutcome> {
        self.touch(addr);
        match self.hosts.get(&addr).and_then(|h| h.udp.get(&port)) {
            Some(Some(reply)) => Some(PortOutcome::open(reply)),
            // Anything not scripted stays silent, like a filtered port.
            _ => Some(PortOutcome::open_or_filtered()),
        }
    }
}

/// SNMP and TLS answers keyed by host.
#[derive(Default)]
pub struct FakeQuery {
    pub sys_descr: HashMap<IpAddr, StepOutcome<String>>,
    pub tls_calls: Mutex<Vec<(IpAddr, u16)>>,
}

impl FakeQuery {
    pub fn describe(mut self, addr: IpAddr, outcome: StepOutcome<String>) -> Self {
        self.sys_descr.insert(addr, outcome);
        self
    }
}

#[async_trait]
impl DeviceQuery for FakeQuery {
    async fn sys_descr(&self, addr: IpAddr) -> StepOutcome<String> {
        self.sys_descr
            .get(&addr)
            .cloned()
            .unwrap_or(StepOutcome::Absent)
    }

    async fn certificate(&self, addr: IpAddr, port: u16) -> StepOutcome<CertInfo> {
        self.tls_calls.lock().unwrap().push((addr, port));
        StepOutcome::Found(CertInfo {
            subject: format!("CN={addr}"),
            issuer: format!("CN={addr}"),
            not_before: "2024-01-01T00:00:00Z".into(),
            not_after: "2034-01-01T00:00:00Z".into(),
            verified: false,
            expired: false,
        })
    }
}

/// Store whose writes all fail; `upsert_device` fails only for `fatal_ips`.
#[derive(Default)]
pub struct BrokenStore {
    pub fatal_ips: Vec<String>,
}

impl DeviceStore for BrokenStore {
    fn upsert_device(&self, addr: &str) -> StoreResult<DeviceId> {
        if self.fatal_ips.iter().any(|f| f == addr) {
            return Err(StoreError::Other("database is locked".into()));
        }
        Ok(1)
    }

    fn insert_scan(
        &self,
        _: DeviceId,
        _: i64,
        _: u16,
        _: &str,
        _: &str,
        _: &str,
        _: Option<&str>,
    ) -> StoreResult<()> {
        Err(StoreError::Other("disk full".into()))
    }

    fn insert_vuln(&self, _: DeviceId, _: &str, _: &str, _: Severity) -> StoreResult<()> {
        Err(StoreError::Other("disk full".into()))
    }

    fn insert_mitre_finding(
        &self,
        _: DeviceId,
        _: &str,
        _: &str,
        _: &str,
        _: &str,
        _: &serde_json::Value,
    ) -> StoreResult<()> {
        Err(StoreError::Other("disk full".into()))
    }

    fn insert_metric(
        &self,
        _: DeviceId,
        _: &str,
        _: f64,
        _: Option<&serde_json::Value>,
    ) -> StoreResult<()> {
        Err(StoreError::Other("disk full".into()))
    }

    fn insert_history(&self, _: DeviceId, _: &str, _: &serde_json::Value) -> StoreResult<()> {
        Err(StoreError::Other("disk full".into()))
    }
}

/// One HIGH signature that fires on Eltex MES switch descriptions.
pub fn test_signatures() -> CveMatcher {
    CveMatcher::new(vec![CveSignature {
        cve_id: "CVE-2099-0001".into(),
        description: "MES23xx management plane takeover".into(),
        severity: Severity::High,
        pattern: r"mes23\d\d".into(),
    }])
}

pub fn options(mode: ScanMode, ports: Option<&str>, modules: &str) -> DeviceOptions {
    let tuning = ScanTuning {
        concurrency: 8,
        tcp_timeout: Duration::from_millis(50),
        udp_concurrency: 4,
        udp_timeout: Duration::from_millis(50),
    };
    DeviceOptions::new(
        resolve(mode, ports, &tuning),
        ModuleSet::parse(modules).unwrap(),
    )
}

pub fn scanner(
    net: Arc<FakeNet>,
    query: Arc<FakeQuery>,
    store: Arc<dyn DeviceStore>,
    options: DeviceOptions,
) -> DeviceScanner {
    DeviceScanner::new(net, query, store, options)
        .with_signatures(test_signatures(), MitreMatcher::builtin())
}
