//! Persistence collaborators: the per-device fact store and the batch report sink.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use ::time::OffsetDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::types::{FleetReport, Severity};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub type DeviceId = i64;

pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// One port observation row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanRow {
    pub device_id: DeviceId,
    pub scan_time: i64,
    pub port: u16,
    pub protocol: String,
    pub state: String,
    pub banner: String,
    pub raw: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VulnRow {
    pub device_id: DeviceId,
    pub cve: String,
    pub description: String,
    pub severity: Severity,
    pub first_seen: i64,
    pub last_seen: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MitreRow {
    pub device_id: DeviceId,
    pub technique_id: String,
    pub technique_name: String,
    pub rule: String,
    pub confidence: String,
    pub evidence: serde_json::Value,
    pub found_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRow {
    pub device_id: DeviceId,
    pub metric_time: i64,
    pub name: String,
    pub value: f64,
    pub labels: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRow {
    pub device_id: DeviceId,
    pub event_time: i64,
    pub event_type: String,
    pub details: serde_json::Value,
}

/// Device facts written by the orchestrator after fan-in. Implementations must be safe to
/// share between concurrent runs.
pub trait DeviceStore: Send + Sync {
    /// Id for `ip`, creating the row on first sight and bumping `last_seen` otherwise.
    fn upsert_device(&self, ip: &str) -> StoreResult<DeviceId>;

    #[allow(clippy::too_many_arguments)]
    fn insert_scan(
        &self,
        device_id: DeviceId,
        scan_time: i64,
        port: u16,
        protocol: &str,
        state: &str,
        banner: &str,
        raw: Option<&str>,
    ) -> StoreResult<()>;

    /// Upsert keyed by `(device_id, cve)`; `first_seen` survives, `last_seen` moves.
    fn insert_vuln(
        &self,
        device_id: DeviceId,
        cve: &str,
        description: &str,
        severity: Severity,
    ) -> StoreResult<()>;

    fn insert_mitre_finding(
        &self,
        device_id: DeviceId,
        technique_id: &str,
        technique_name: &str,
        rule: &str,
        confidence: &str,
        evidence: &serde_json::Value,
    ) -> StoreResult<()>;

    fn insert_metric(
        &self,
        device_id: DeviceId,
        name: &str,
        value: f64,
        labels: Option<&serde_json::Value>,
    ) -> StoreResult<()>;

    fn insert_history(
        &self,
        device_id: DeviceId,
        event_type: &str,
        details: &serde_json::Value,
    ) -> StoreResult<()>;
}

fn lock<T>(m: &Mutex<T>) -> StoreResult<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| StoreError::Other("store lock poisoned".to_string()))
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryTables {
    devices: Vec<(String, i64, i64)>,
    scans: Vec<ScanRow>,
    vulns: Vec<VulnRow>,
    mitre: Vec<MitreRow>,
    metrics: Vec<MetricRow>,
    history: Vec<HistoryRow>,
}

/// Process-local store, used by tests and `--no-db` runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_count(&self) -> usize {
        self.tables.lock().map(|t| t.devices.len()).unwrap_or(0)
    }

    pub fn scans(&self) -> Vec<ScanRow> {
        self.tables.lock().map(|t| t.scans.clone()).unwrap_or_default()
    }

    pub fn vulns(&self) -> Vec<VulnRow> {
        self.tables.lock().map(|t| t.vulns.clone()).unwrap_or_default()
    }

    pub fn mitre_findings(&self) -> Vec<MitreRow> {
        self.tables.lock().map(|t| t.mitre.clone()).unwrap_or_default()
    }

    pub fn metrics(&self) -> Vec<MetricRow> {
        self.tables.lock().map(|t| t.metrics.clone()).unwrap_or_default()
    }

    pub fn history(&self) -> Vec<HistoryRow> {
        self.tables.lock().map(|t| t.history.clone()).unwrap_or_default()
    }
}

impl DeviceStore for MemoryStore {
    fn upsert_device(&self, ip: &str) -> StoreResult<DeviceId> {
        let now = unix_now();
        let mut t = lock(&self.tables)?;
        if let Some(pos) = t.devices.iter().position(|(d, _, _)| d == ip) {
            t.devices[pos].2 = now;
            return Ok(pos as DeviceId + 1);
        }
        t.devices.push((ip.to_string(), now, now));
        Ok(t.devices.len() as DeviceId)
    }

    fn insert_scan(
        &self,
        device_id: DeviceId,
        scan_time: i64,
        port: u16,
        protocol: &str,
        state: &str,
        banner: &str,
        raw: Option<&str>,
    ) -> StoreResult<()> {
        lock(&self.tables)?.scans.push(ScanRow {
            device_id,
            scan_time,
            port,
            protocol: protocol.to_string(),
            state: state.to_string(),
            banner: banner.to_string(),
            raw: raw.map(str::to_string),
        });
        Ok(())
    }

    fn insert_vuln(
        &self,
        device_id: DeviceId,
        cve: &str,
        description: &str,
        severity: Severity,
    ) -> StoreResult<()> {
        let now = unix_now();
        let mut t = lock(&self.tables)?;
        let existing = t
            .vulns
            .iter()
            .position(|v| v.device_id == device_id && v.cve == cve);
        match existing {
            Some(pos) => {
                let row = &mut t.vulns[pos];
                row.description = description.to_string();
                row.severity = severity;
                row.last_seen = now;
            }
            None => t.vulns.push(VulnRow {
                device_id,
                cve: cve.to_string(),
                description: description.to_string(),
                severity,
                first_seen: now,
                last_seen: now,
            }),
        }
        Ok(())
    }

    fn insert_mitre_finding(
        &self,
        device_id: DeviceId,
        technique_id: &str,
        technique_name: &str,
        rule: &str,
        confidence: &str,
        evidence: &serde_json::Value,
    ) -> StoreResult<()> {
        lock(&self.tables)?.mitre.push(MitreRow {
            device_id,
            technique_id: technique_id.to_string(),
            technique_name: technique_name.to_string(),
            rule: rule.to_string(),
            confidence: confidence.to_string(),
            evidence: evidence.clone(),
            found_at: unix_now(),
        });
        Ok(())
    }

    fn insert_metric(
        &self,
        device_id: DeviceId,
        name: &str,
        value: f64,
        labels: Option<&serde_json::Value>,
    ) -> StoreResult<()> {
        lock(&self.tables)?.metrics.push(MetricRow {
            device_id,
            metric_time: unix_now(),
            name: name.to_string(),
            value,
            labels: labels.cloned(),
        });
        Ok(())
    }

    fn insert_history(
        &self,
        device_id: DeviceId,
        event_type: &str,
        details: &serde_json::Value,
    ) -> StoreResult<()> {
        lock(&self.tables)?.history.push(HistoryRow {
            device_id,
            event_time: unix_now(),
            event_type: event_type.to_string(),
            details: details.clone(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    ip          TEXT NOT NULL UNIQUE,
    hostname    TEXT,
    mac         TEXT,
    model       TEXT,
    fw_version  TEXT,
    first_seen  INTEGER NOT NULL,
    last_seen   INTEGER NOT NULL
);

-- Append-only port observations
CREATE TABLE IF NOT EXISTS scans (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id   INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
    scan_time   INTEGER NOT NULL,
    port        INTEGER NOT NULL,
    protocol    TEXT NOT NULL,
    state       TEXT NOT NULL,
    banner      TEXT,
    raw_json    TEXT
);
CREATE INDEX IF NOT EXISTS idx_scans_device ON scans(device_id, scan_time);

CREATE TABLE IF NOT EXISTS vulnerabilities (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id   INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
    cve         TEXT NOT NULL,
    description TEXT,
    severity    TEXT NOT NULL,
    source      TEXT NOT NULL DEFAULT 'local',
    first_seen  INTEGER NOT NULL,
    last_seen   INTEGER NOT NULL,
    UNIQUE (device_id, cve)
);

CREATE TABLE IF NOT EXISTS mitre_findings (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id      INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
    technique_id   TEXT NOT NULL,
    technique_name TEXT NOT NULL,
    rule           TEXT NOT NULL,
    confidence     TEXT NOT NULL,
    evidence       TEXT,
    found_at       INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS metrics (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id    INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
    metric_time  INTEGER NOT NULL,
    metric_name  TEXT NOT NULL,
    metric_value REAL NOT NULL,
    labels       TEXT
);
CREATE INDEX IF NOT EXISTS idx_metrics_device ON metrics(device_id, metric_name);

CREATE TABLE IF NOT EXISTS history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id   INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
    event_time  INTEGER NOT NULL,
    event_type  TEXT NOT NULL,
    details     TEXT
);
"#;

fn initialize(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// SQLite-backed [`DeviceStore`]. One connection behind a mutex; every call is one statement
/// or one short transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Other(format!(
                    "failed to create db directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        initialize(&conn)?;
        debug!(path = %path.display(), "device database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// `(first_seen, last_seen)` of a vulnerability row.
    pub fn vuln_seen(&self, device_id: DeviceId, cve: &str) -> StoreResult<(i64, i64)> {
        let conn = lock(&self.conn)?;
        conn.query_row(
            "SELECT first_seen, last_seen FROM vulnerabilities WHERE device_id = ?1 AND cve = ?2",
            params![device_id, cve],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("{cve} on device {device_id}")))
    }

    pub fn count(&self, table: &str) -> StoreResult<i64> {
        if !matches!(
            table,
            "devices" | "scans" | "vulnerabilities" | "mitre_findings" | "metrics" | "history"
        ) {
            return Err(StoreError::Other(format!("unknown table {table}")));
        }
        let conn = lock(&self.conn)?;
        let n = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?;
        Ok(n)
    }
}

impl DeviceStore for SqliteStore {
    fn upsert_device(&self, ip: &str) -> StoreResult<DeviceId> {
        let now = unix_now();
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO devices (ip, first_seen, last_seen) VALUES (?1, ?2, ?2) \
             ON CONFLICT(ip) DO UPDATE SET last_seen = ?2",
            params![ip, now],
        )?;
        let id = conn.query_row("SELECT id FROM devices WHERE ip = ?1", params![ip], |row| {
            row.get(0)
        })?;
        Ok(id)
    }

    fn insert_scan(
        &self,
        device_id: DeviceId,
        scan_time: i64,
        port: u16,
        protocol: &str,
        state: &str,
        banner: &str,
        raw: Option<&str>,
    ) -> StoreResult<()> {
        lock(&self.conn)?.execute(
            "INSERT INTO scans (device_id, scan_time, port, protocol, state, banner, raw_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![device_id, scan_time, port, protocol, state, banner, raw],
        )?;
        Ok(())
    }

    fn insert_vuln(
        &self,
        device_id: DeviceId,
        cve: &str,
        description: &str,
        severity: Severity,
    ) -> StoreResult<()> {
        let now = unix_now();
        lock(&self.conn)?.execute(
            "INSERT INTO vulnerabilities (device_id, cve, description, severity, first_seen, last_seen) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
             ON CONFLICT(device_id, cve) DO UPDATE SET \
             description = ?3, severity = ?4, last_seen = ?5",
            params![device_id, cve, description, severity.as_str(), now],
        )?;
        Ok(())
    }

    fn insert_mitre_finding(
        &self,
        device_id: DeviceId,
        technique_id: &str,
        technique_name: &str,
        rule: &str,
        confidence: &str,
        evidence: &serde_json::Value,
    ) -> StoreResult<()> {
        let evidence = serde_json::to_string(evidence)?;
        lock(&self.conn)?.execute(
            "INSERT INTO mitre_findings \
             (device_id, technique_id, technique_name, rule, confidence, evidence, found_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                device_id,
                technique_id,
                technique_name,
                rule,
                confidence,
                evidence,
                unix_now()
            ],
        )?;
        Ok(())
    }

    fn insert_metric(
        &self,
        device_id: DeviceId,
        name: &str,
        value: f64,
        labels: Option<&serde_json::Value>,
    ) -> StoreResult<()> {
        let labels = labels.map(serde_json::to_string).transpose()?;
        lock(&self.conn)?.execute(
            "INSERT INTO metrics (device_id, metric_time, metric_name, metric_value, labels) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![device_id, unix_now(), name, value, labels],
        )?;
        Ok(())
    }

    fn insert_history(
        &self,
        device_id: DeviceId,
        event_type: &str,
        details: &serde_json::Value,
    ) -> StoreResult<()> {
        let details = serde_json::to_string(details)?;
        lock(&self.conn)?.execute(
            "INSERT INTO history (device_id, event_time, event_type, details) \
             VALUES (?1, ?2, ?3, ?4)",
            params![device_id, unix_now(), event_type, details],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Report sink
// ---------------------------------------------------------------------------

/// Destination for one [`FleetReport`] per run.
pub trait ReportSink: Send + Sync {
    /// Persist `report`, returning the name it can be read back under.
    fn write(&self, report: &FleetReport) -> StoreResult<String>;
    /// Stored report names, newest first.
    fn list(&self) -> StoreResult<Vec<String>>;
    fn read(&self, name: &str) -> StoreResult<serde_json::Value>;
}

/// `scan_YYYY-MM-DD_HH-MM-SS.json` files in one directory.
#[derive(Debug, Clone)]
pub struct JsonReportDir {
    dir: PathBuf,
}

impl JsonReportDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn report_name(at: OffsetDateTime) -> StoreResult<String> {
        let format =
            ::time::macros::format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
        let stamp = at
            .format(format)
            .map_err(|e| StoreError::Other(format!("cannot format report name: {e}")))?;
        Ok(format!("scan_{stamp}.json"))
    }
}

impl ReportSink for JsonReportDir {
    fn write(&self, report: &FleetReport) -> StoreResult<String> {
        std::fs::create_dir_all(&self.dir)?;
        let base = Self::report_name(OffsetDateTime::now_utc())?;
        // Two runs in the same second get a numeric suffix instead of overwriting.
        let mut name = base.clone();
        let mut n = 1;
        while self.dir.join(&name).exists() {
            name = format!("{}_{n}.json", base.trim_end_matches(".json"));
            n += 1;
        }
        let body = serde_json::to_vec_pretty(report)?;
        std::fs::write(self.dir.join(&name), body)?;
        debug!(report = %name, "fleet report written");
        Ok(name)
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with("scan_") && name.ends_with(".json"))
            .collect();
        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names)
    }

    fn read(&self, name: &str) -> StoreResult<serde_json::Value> {
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(StoreError::NotFound(name.to_string()));
        }
        let path = self.dir.join(name);
        if !path.is_file() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Keeps reports in memory; `list` returns insertion order reversed.
#[derive(Debug, Default)]
pub struct MemoryReportSink {
    reports: Mutex<Vec<(String, serde_json::Value)>>,
}

impl MemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReportSink for MemoryReportSink {
    fn write(&self, report: &FleetReport) -> StoreResult<String> {
        let value = serde_json::to_value(report)?;
        let mut reports = lock(&self.reports)?;
        let name = format!("report_{}", reports.len() + 1);
        reports.push((name.clone(), value));
        Ok(name)
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        Ok(lock(&self.reports)?
            .iter()
            .rev()
            .map(|(n, _)| n.clone())
            .collect())
    }

    fn read(&self, name: &str) -> StoreResult<serde_json::Value> {
        lock(&self.reports)?
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }
}
