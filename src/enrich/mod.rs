//! Optional evidence beyond port state: SNMP, CVE, MITRE ATT&CK, TLS.
//!
//! CVE and MITRE matching are pure functions of earlier evidence. SNMP and TLS reach
//! the device and sit behind [`DeviceQuery`] so the orchestrator can be driven without
//! a network.

pub mod cve;
pub mod mitre;
pub mod snmp;
pub mod tls;

use std::net::IpAddr;

use async_trait::async_trait;

use crate::types::{CertInfo, StepOutcome};

pub use cve::{CveMatcher, CveSignature};
pub use mitre::{AggregatedRecord, MitreMatcher, TechniqueMapping};
pub use snmp::SnmpSettings;
pub use tls::TlsSettings;

#[async_trait]
pub trait DeviceQuery: Send + Sync {
    /// SNMP `sysDescr.0`.
    async fn sys_descr(&self, ip: IpAddr) -> StepOutcome<String>;
    /// Certificate served on `port`.
    async fn certificate(&self, ip: IpAddr, port: u16) -> StepOutcome<CertInfo>;
}

/// Queries real devices over UDP/SNMP and TCP/TLS.
#[derive(Debug, Clone, Default)]
pub struct LiveQuery {
    pub snmp: SnmpSettings,
    pub tls: TlsSettings,
}

#[async_trait]
impl DeviceQuery for LiveQuery {
    async fn sys_descr(&self, ip: IpAddr) -> StepOutcome<String> {
        snmp::fetch_sys_descr(ip, &self.snmp).await
    }

    async fn certificate(&self, ip: IpAddr, port: u16) -> StepOutcome<CertInfo> {
        tls::inspect(ip, port, &self.tls).await
    }
}
