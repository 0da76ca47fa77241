//! Unauthenticated LAN audit: port scanning, SNMP/CVE/MITRE/TLS enrichment and risk scoring.
pub mod config;
pub mod device;
pub mod enrich;
pub mod error;
pub mod fleet;
pub mod logging;
pub mod ports;
pub mod probe;
pub mod risk;
pub mod scanner;
pub mod store;
pub mod targets;
pub mod types;

pub use error::{Error, Result};
