use std::fs::File;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use lan_audit_rs::config::AuditConfig;
use lan_audit_rs::device::DeviceScanner;
use lan_audit_rs::enrich::LiveQuery;
use lan_audit_rs::fleet::{FleetRunner, RunContext};
use lan_audit_rs::logging::init_logging_with_config;
use lan_audit_rs::ports::ScanMode;
use lan_audit_rs::probe::SocketProber;
use lan_audit_rs::store::{DeviceStore, JsonReportDir, MemoryStore, SqliteStore};
use lan_audit_rs::targets;
use lan_audit_rs::types::{FleetEntry, FleetReport};

/// lan-audit-rs: unauthenticated LAN device audit with SNMP, CVE, MITRE ATT&CK and TLS enrichment.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "lan-audit-rs",
    version,
    about = "Unauthenticated LAN device audit: port scan, SNMP/CVE/MITRE/TLS enrichment, risk score.",
    long_about = None
)]
struct Cli {
    /// Targets: IPs, ranges (10.0.0.3-10 or 10.0.0.3-10.0.0.10) and CIDRs, comma separated.
    /// If omitted, auto-detect local /24 networks.
    #[arg(long)]
    targets: Option<String>,

    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scan mode: quick, special or full.
    #[arg(long)]
    mode: Option<String>,

    /// Quick-mode TCP port spec, e.g. 22,80,8000-8100.
    #[arg(long)]
    ports: Option<String>,

    /// File with one port or range per line (# comments allowed). Overrides --ports.
    #[arg(long = "ports-file")]
    ports_file: Option<PathBuf>,

    /// Enrichment modules, comma separated: snmp,cve,mitre,tls.
    #[arg(long)]
    modules: Option<String>,

    /// Max concurrent TCP probes per host.
    #[arg(long)]
    concurrency: Option<usize>,

    /// TCP probe timeout in milliseconds (mode floors still apply).
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Treat a host as alive when a UDP port actually answers.
    #[arg(long = "alive-from-udp", default_value_t = false)]
    alive_from_udp: bool,

    /// SQLite database path.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Keep device facts in memory only.
    #[arg(long = "no-db", default_value_t = false)]
    no_db: bool,

    /// Directory for scan_*.json fleet reports.
    #[arg(long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Also write the fleet report as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Log filter, e.g. info or lan_audit_rs=debug. RUST_LOG wins when set.
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Log format: pretty, compact or json.
    #[arg(long = "log-format")]
    log_format: Option<String>,
}

impl Cli {
    fn apply(&self, mut config: AuditConfig) -> Result<AuditConfig> {
        if let Some(mode) = &self.mode {
            config.scan.mode = mode.clone();
        }
        if let Some(path) = &self.ports_file {
            let spec = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read ports file {}", path.display()))?;
            config.scan.ports = Some(spec);
        } else if let Some(spec) = &self.ports {
            config.scan.ports = Some(spec.clone());
        }
        if let Some(modules) = &self.modules {
            config.scan.modules = modules
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(n) = self.concurrency {
            config.scan.concurrency = n;
        }
        if let Some(ms) = self.timeout_ms {
            config.scan.tcp_timeout_ms = ms;
        }
        if self.alive_from_udp {
            config.policy.alive_from_udp = true;
        }
        if let Some(db) = &self.db {
            config.storage.database = db.clone();
        }
        if let Some(dir) = &self.report_dir {
            config.storage.report_dir = dir.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = format.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AuditConfig::from_file(path)?,
        None => AuditConfig::default(),
    };
    let config = cli.apply(config.merge_env())?;
    config.validate().context("invalid configuration")?;

    init_logging_with_config(config.log_config()?);

    let options = config.device_options()?;
    println!("lan-audit-rs configuration:");
    println!(
        "  targets      : {}",
        cli.targets
            .as_deref()
            .unwrap_or("<auto-detect local IPv4 /24>")
    );
    println!("  mode         : {}", options.plan.mode);
    println!(
        "  ports        : {} tcp / {} udp",
        options.plan.tcp_ports.len(),
        if options.plan.mode.probes_udp() {
            options.plan.udp_ports.len()
        } else {
            0
        }
    );
    println!("  modules      : {}", options.modules);
    println!("  concurrency  : {}", options.plan.concurrency);
    println!("  timeout_ms   : {}", options.plan.tcp_timeout.as_millis());
    println!(
        "  database     : {}",
        if cli.no_db {
            "<memory>".to_string()
        } else {
            config.storage.database.display().to_string()
        }
    );
    println!("  reports      : {}", config.storage.report_dir.display());

    if options.plan.mode == ScanMode::Full {
        warn!("full mode probes all 65535 TCP and UDP ports per host: slow and noisy on the network");
    }
    if options.plan.tcp_ports.is_empty() {
        warn!("no TCP ports selected; quick mode needs --ports or --ports-file");
    }

    let hosts = resolve_hosts(cli.targets.as_deref())?;
    println!("  hosts        : {}", hosts.len());

    let store: Arc<dyn DeviceStore> = if cli.no_db {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            SqliteStore::open(&config.storage.database).with_context(|| {
                format!("failed to open database {}", config.storage.database.display())
            })?,
        )
    };
    let query = Arc::new(LiveQuery {
        snmp: config.snmp_settings(),
        tls: config.tls_settings(),
    });
    let (cve, mitre) = config.load_matchers()?;
    let scanner = DeviceScanner::new(Arc::new(SocketProber), query, store, options)
        .with_signatures(cve, mitre);
    let runner = FleetRunner::new(
        Arc::new(scanner),
        Arc::new(JsonReportDir::new(&config.storage.report_dir)),
    );

    let ctx = RunContext::new();
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the current host");
            cancel.cancel();
        }
    });

    let run = runner.run(&ctx, &hosts).await?;
    print_results_table(&run.report);
    println!(
        "\nReport saved as {}",
        config.storage.report_dir.join(&run.report_name).display()
    );

    if let Some(path) = cli.output.as_deref() {
        match write_report_json(path, &run.report) {
            Ok(()) => println!("Wrote JSON report to {}", path.display()),
            Err(e) => eprintln!("Failed to write JSON to {}: {e}", path.display()),
        }
    }

    Ok(())
}

fn resolve_hosts(expr: Option<&str>) -> Result<Vec<IpAddr>> {
    let hosts = match expr {
        Some(expr) => targets::parse_targets(expr)?,
        None => {
            let cidrs = targets::detect_local_cidrs().context("failed to detect local networks")?;
            println!("Detected local IPv4 CIDRs:");
            for cidr in &cidrs {
                println!(
                    "  - {} ({} hosts)",
                    cidr,
                    targets::expand_cidr_to_ips(*cidr).len()
                );
            }
            targets::local_targets()?
        }
    };
    if hosts.is_empty() {
        bail!("no targets to scan");
    }
    Ok(hosts)
}

fn print_results_table(report: &FleetReport) {
    const PORTS_W: usize = 40;
    let rows: Vec<(String, String, String, String, String)> = report
        .entries
        .iter()
        .map(|entry| match entry {
            FleetEntry::Device(r) => {
                let mut ports: String = r
                    .scan
                    .tcp_ports
                    .keys()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                if ports.len() > PORTS_W {
                    ports.truncate(PORTS_W - 3);
                    ports.push_str("...");
                }
                let issues = r
                    .issues
                    .iter()
                    .map(|i| i.id.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                (
                    r.ip.to_string(),
                    if r.alive { "yes" } else { "no" }.to_string(),
                    r.risk.to_string(),
                    ports,
                    issues,
                )
            }
            FleetEntry::Failed { ip, error } => (
                ip.to_string(),
                "error".to_string(),
                "-".to_string(),
                String::new(),
                error.clone(),
            ),
        })
        .collect();

    let mut ip_w = "ip".len();
    let mut ports_w = "tcp_open".len();
    for r in &rows {
        ip_w = ip_w.max(r.0.len());
        ports_w = ports_w.max(r.3.len());
    }
    let alive_w = "alive".len();
    let risk_w = "risk".len();

    let alive = report
        .entries
        .iter()
        .filter(|e| matches!(e, FleetEntry::Device(r) if r.alive))
        .count();
    println!(
        "\nHosts: {} scanned of {} requested, {} alive{}",
        report.entries.len(),
        report.hosts_requested,
        alive,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    println!(
        "{:<ip_w$}  {:<alive_w$}  {:>risk_w$}  {:<ports_w$}  issues",
        "ip", "alive", "risk", "tcp_open",
    );
    println!(
        "{:-<ip_w$}  {:-<alive_w$}  {:-<risk_w$}  {:-<ports_w$}  ------",
        "", "", "", "",
    );
    for (ip, alive, risk, ports, issues) in &rows {
        println!("{ip:<ip_w$}  {alive:<alive_w$}  {risk:>risk_w$}  {ports:<ports_w$}  {issues}");
    }
}

fn write_report_json(path: &Path, report: &FleetReport) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
