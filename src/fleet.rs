//! Sequential batch runner over a host list with cooperative cancellation.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use ::time::format_description::well_known::Rfc3339;
use ::time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::device::DeviceScanner;
use crate::error::{Error, Result};
use crate::store::ReportSink;
use crate::types::{FleetEntry, FleetReport, Severity};

/// Per-run state handed to the runner instead of process-wide flags.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub started_at: OffsetDateTime,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            run_id: format!("{:016x}", rand::random::<u64>()),
            started_at: OffsetDateTime::now_utc(),
            cancel,
        }
    }

    /// Stop after the host currently in flight.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The report plus the name the sink stored it under.
#[derive(Debug, Clone)]
pub struct FleetRun {
    pub report: FleetReport,
    pub report_name: String,
}

pub struct FleetRunner {
    scanner: Arc<DeviceScanner>,
    sink: Arc<dyn ReportSink>,
}

impl FleetRunner {
    pub fn new(scanner: Arc<DeviceScanner>, sink: Arc<dyn ReportSink>) -> Self {
        Self { scanner, sink }
    }

    /// Scan `hosts` one after another, in order.
    ///
    /// - Cancellation is checked before each host; an in-flight host always finishes.
    /// - A host that errors or panics becomes an `{ip, error}` entry.
    /// - The report is written once at the end, cancelled or not.
    pub async fn run(&self, ctx: &RunContext, hosts: &[IpAddr]) -> Result<FleetRun> {
        let run_started = Instant::now();
        info!(
            run_id = %ctx.run_id,
            hosts = hosts.len(),
            mode = %self.scanner.options().plan.mode,
            modules = %self.scanner.options().modules,
            "fleet run started"
        );

        let mut entries = Vec::with_capacity(hosts.len());
        let mut cancelled = false;

        for &ip in hosts {
            if ctx.is_cancelled() {
                cancelled = true;
                info!(run_id = %ctx.run_id, skipped = hosts.len() - entries.len(), "run cancelled");
                break;
            }
            entries.push(self.scan_one(&ctx.run_id, ip).await);
        }

        let report = FleetReport {
            run_id: ctx.run_id.clone(),
            started_at: timestamp(ctx.started_at),
            finished_at: timestamp(OffsetDateTime::now_utc()),
            cancelled,
            hosts_requested: hosts.len(),
            entries,
        };

        let report_name = match self.sink.write(&report) {
            Ok(name) => name,
            Err(e) => {
                error!(run_id = %ctx.run_id, error = %e, "failed to write fleet report");
                return Err(Error::Report(e));
            }
        };

        let total_ms = run_started.elapsed().as_millis() as u64;
        info!(
            run_id = %ctx.run_id,
            report = %report_name,
            scanned = report.entries.len(),
            cancelled,
            total_ms,
            "fleet run finished"
        );
        Ok(FleetRun {
            report,
            report_name,
        })
    }

    async fn scan_one(&self, run_id: &str, ip: IpAddr) -> FleetEntry {
        let span = info_span!("host", %ip, run_id);
        let scanner = self.scanner.clone();
        let outcome = tokio::spawn(async move { scanner.scan(ip).await }.instrument(span.clone()))
            .await;

        span.in_scope(|| match outcome {
            Ok(Ok(report)) => {
                let high: Vec<&str> = report
                    .enrichment
                    .cves()
                    .iter()
                    .filter(|c| c.severity == Severity::High)
                    .map(|c| c.cve_id.as_str())
                    .collect();
                let high_cves = if high.is_empty() {
                    "none".to_string()
                } else {
                    high.join(",")
                };
                info!(
                    alive = report.alive,
                    risk = report.risk,
                    high_cves = %high_cves,
                    duration_ms = report.duration_ms,
                    "host done"
                );
                FleetEntry::Device(Box::new(report))
            }
            Ok(Err(e)) => {
                warn!(code = e.code(), error = %e, "host failed");
                FleetEntry::Failed {
                    ip,
                    error: e.to_string(),
                }
            }
            Err(join) => {
                warn!(error = %join, "host task aborted");
                FleetEntry::Failed {
                    ip,
                    error: format!("host task aborted: {join}"),
                }
            }
        })
    }
}

fn timestamp(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_else(|_| t.unix_timestamp().to_string())
}
