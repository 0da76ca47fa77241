//! Run configuration: TOML file, then `LAN_AUDIT_*` environment, then CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::{AlivePolicy, DeviceOptions};
use crate::enrich::{CveMatcher, MitreMatcher, SnmpSettings, TlsSettings};
use crate::error::{Error, Result};
use crate::logging::{LogConfig, LogFormat};
use crate::ports::{self, ModuleSet, ScanPlan, ScanTuning};

pub const ENV_PREFIX: &str = "LAN_AUDIT_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub snmp: SnmpConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub signatures: SignatureConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// quick, special or full
    pub mode: String,
    /// Port spec for quick mode, e.g. `22,80,8000-8100`
    pub ports: Option<String>,
    pub modules: Vec<String>,
    pub concurrency: usize,
    pub tcp_timeout_ms: u64,
    pub udp_concurrency: usize,
    pub udp_timeout_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            mode: String::from("quick"),
            ports: None,
            modules: Vec::new(),
            concurrency: 100,
            tcp_timeout_ms: 1000,
            udp_concurrency: 50,
            udp_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub alive_from_udp: bool,
    pub hide_udp_when_dead: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            alive_from_udp: false,
            hide_udp_when_dead: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnmpConfig {
    pub community: String,
    pub port: u16,
    pub timeout_ms: u64,
    pub retries: u32,
}

impl Default for SnmpConfig {
    fn default() -> Self {
        Self {
            community: String::from("public"),
            port: 161,
            timeout_ms: 2000,
            retries: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub port: u16,
    pub timeout_ms: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            port: 443,
            timeout_ms: 3000,
        }
    }
}

/// JSON files replacing the built-in tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    pub cve_file: Option<PathBuf>,
    pub mitre_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path
    pub database: PathBuf,
    pub report_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("lan_audit.db"),
            report_dir: PathBuf::from("data/reports"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// pretty, compact or json
    pub format: String,
    /// Print source file and line
    pub file: bool,
    /// Print the module path of each event
    pub target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("pretty"),
            file: false,
            target: true,
        }
    }
}

impl AuditConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("failed to parse config: {e}")))
    }

    /// Overlay `LAN_AUDIT_*` variables from the process environment.
    pub fn merge_env(self) -> Self {
        self.merge_vars(|key| std::env::var(key).ok())
    }

    /// Overlay variables from `lookup`. Unparseable numbers and booleans are ignored.
    pub fn merge_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("MODE") {
            self.scan.mode = v;
        }
        if let Some(v) = var("PORTS") {
            self.scan.ports = Some(v);
        }
        if let Some(v) = var("MODULES") {
            self.scan.modules = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(n) = var("CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.scan.concurrency = n;
        }
        if let Some(n) = var("TCP_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.scan.tcp_timeout_ms = n;
        }
        if let Some(n) = var("UDP_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.scan.udp_timeout_ms = n;
        }
        if let Some(b) = var("ALIVE_FROM_UDP").and_then(|v| parse_bool(&v)) {
            self.policy.alive_from_udp = b;
        }
        if let Some(b) = var("HIDE_UDP_WHEN_DEAD").and_then(|v| parse_bool(&v)) {
            self.policy.hide_udp_when_dead = b;
        }
        if let Some(v) = var("SNMP_COMMUNITY") {
            self.snmp.community = v;
        }
        if let Some(v) = var("DB") {
            self.storage.database = PathBuf::from(v);
        }
        if let Some(v) = var("REPORT_DIR") {
            self.storage.report_dir = PathBuf::from(v);
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = var("LOG_FORMAT") {
            self.logging.format = v;
        }
        self
    }

    /// Reject bad mode, module, port-spec or logging values before anything touches the network.
    pub fn validate(&self) -> Result<()> {
        self.scan_plan()?;
        self.modules()?;
        self.log_format()?;
        if self.scan.concurrency == 0 || self.scan.udp_concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.scan.tcp_timeout_ms == 0 || self.scan.udp_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        if let Some(spec) = self.scan.ports.as_deref().filter(|s| !s.trim().is_empty()) {
            if ports::parse_ports_str(spec).is_empty() {
                return Err(Error::Config(format!("port spec {spec:?} selects no ports")));
            }
        }
        Ok(())
    }

    pub fn tuning(&self) -> ScanTuning {
        ScanTuning {
            concurrency: self.scan.concurrency,
            tcp_timeout: Duration::from_millis(self.scan.tcp_timeout_ms),
            udp_concurrency: self.scan.udp_concurrency,
            udp_timeout: Duration::from_millis(self.scan.udp_timeout_ms),
        }
    }

    pub fn scan_plan(&self) -> Result<ScanPlan> {
        ports::resolve_mode(&self.scan.mode, self.scan.ports.as_deref(), &self.tuning())
    }

    pub fn modules(&self) -> Result<ModuleSet> {
        ModuleSet::parse(&self.scan.modules.join(","))
    }

    pub fn policy(&self) -> AlivePolicy {
        AlivePolicy {
            alive_from_udp: self.policy.alive_from_udp,
            hide_udp_when_dead: self.policy.hide_udp_when_dead,
        }
    }

    pub fn device_options(&self) -> Result<DeviceOptions> {
        let mut options = DeviceOptions::new(self.scan_plan()?, self.modules()?);
        options.policy = self.policy();
        options.tls_port = self.tls.port;
        Ok(options)
    }

    pub fn snmp_settings(&self) -> SnmpSettings {
        SnmpSettings {
            community: self.snmp.community.clone(),
            port: self.snmp.port,
            timeout: Duration::from_millis(self.snmp.timeout_ms),
            retries: self.snmp.retries,
        }
    }

    pub fn tls_settings(&self) -> TlsSettings {
        TlsSettings {
            timeout: Duration::from_millis(self.tls.timeout_ms),
        }
    }

    fn log_format(&self) -> Result<LogFormat> {
        self.logging.format.parse()
    }

    pub fn log_config(&self) -> Result<LogConfig> {
        Ok(LogConfig::new()
            .level(self.logging.level.clone())
            .format(self.log_format()?)
            .with_file(self.logging.file)
            .with_target(self.logging.target))
    }

    /// Signature tables from the configured files, built-ins otherwise.
    pub fn load_matchers(&self) -> Result<(CveMatcher, MitreMatcher)> {
        let cve = match &self.signatures.cve_file {
            Some(path) => CveMatcher::from_json_file(path)?,
            None => CveMatcher::builtin(),
        };
        let mitre = match &self.signatures.mitre_file {
            Some(path) => MitreMatcher::from_json_file(path)?,
            None => MitreMatcher::builtin(),
        };
        Ok((cve, mitre))
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
