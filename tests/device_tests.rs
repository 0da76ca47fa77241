mod common;

use std::sync::Arc;

use common::{ip, options, scanner, BrokenStore, FakeHost, FakeNet, FakeQuery};
use lan_audit_rs::device::AlivePolicy;
use lan_audit_rs::ports::ScanMode;
use lan_audit_rs::store::MemoryStore;
use lan_audit_rs::types::{RuleKind, Severity, StepOutcome};
use lan_audit_rs::Error;

#[tokio::test]
async fn telnet_public_snmp_and_high_cve() {
    let host = ip("192.168.1.20");
    let net = Arc::new(FakeNet::default().with_host(host, FakeHost::default().tcp(23, "")));
    let query = Arc::new(FakeQuery::default().describe(
        host,
        StepOutcome::Found("Eltex MES2324 community public, firmware 2.5.44".into()),
    ));
    let store = Arc::new(MemoryStore::new());
    let scanner = scanner(
        net,
        query,
        store.clone(),
        options(ScanMode::Quick, Some("22,23,80,443"), "snmp,cve,mitre"),
    );

    let report = scanner.scan(host).await.unwrap();

    assert!(report.alive);
    assert!(report.risk >= 80, "risk was {}", report.risk);
    let ids: Vec<&str> = report.issues.iter().map(|i| i.id.as_str()).collect();
    assert!(ids.contains(&"TELNET_OPEN"));
    assert!(ids.contains(&"SNMP_PUBLIC"));
    assert_eq!(ids.iter().filter(|id| id.starts_with("CVE_")).count(), 1);
    assert!(report.advice.contains("CRITICAL"));

    let cves = report.enrichment.cve_matches.as_ref().unwrap();
    assert_eq!(cves[0].cve_id, "CVE-2099-0001");
    assert_eq!(cves[0].severity, Severity::High);

    let findings = report.enrichment.mitre_findings.as_ref().unwrap();
    assert!(findings.iter().any(|f| f.rule == RuleKind::TelnetOpen));
    assert!(findings.iter().any(|f| f.rule == RuleKind::SnmpSysdescr));
    assert!(findings.iter().any(|f| f.rule == RuleKind::KnownCve));
    assert!(report.enrichment.tls.is_none());

    // quick mode never touches UDP
    assert!(report.scan.udp_ports.is_empty());
    assert_eq!(report.scan.scanned_udp_count, 0);
    assert_eq!(report.scan.scanned_tcp_count, 4);

    assert_eq!(store.device_count(), 1);
    assert_eq!(store.scans().len(), 1);
    assert_eq!(store.vulns().len(), 1);
    assert_eq!(store.mitre_findings().len(), findings.len());
    let metrics = store.metrics();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].name, "risk");
    assert_eq!(metrics[0].value, f64::from(report.risk));
    assert_eq!(store.history().len(), 1);
}

#[tokio::test]
async fn dead_host_drops_ambiguous_udp() {
    let host = ip("10.0.0.50");
    let net = Arc::new(FakeNet::default());
    let scanner = scanner(
        net,
        Arc::new(FakeQuery::default()),
        Arc::new(MemoryStore::new()),
        options(ScanMode::Special, None, ""),
    );

    let report = scanner.scan(host).await.unwrap();

    assert!(!report.alive);
    assert!(report.scan.tcp_ports.is_empty());
    assert!(report.scan.udp_ports.is_empty());
    assert!(report.scan.special_udp_ports.is_empty());
    assert_eq!(report.scan.scanned_udp_count, 0);
    assert_eq!(report.risk, 0);
}

#[tokio::test]
async fn answering_udp_counts_only_when_policy_allows() {
    let host = ip("10.0.0.53");
    let fake = FakeHost::default().udp(53, Some(b"\x81\x80"));

    let strict = scanner(
        Arc::new(FakeNet::default().with_host(host, fake.clone())),
        Arc::new(FakeQuery::default()),
        Arc::new(MemoryStore::new()),
        options(ScanMode::Special, None, ""),
    );
    let report = strict.scan(host).await.unwrap();
    assert!(!report.alive);
    assert!(report.scan.udp_ports.is_empty());

    let mut opts = options(ScanMode::Special, None, "");
    opts.policy = AlivePolicy {
        alive_from_udp: true,
        ..AlivePolicy::default()
    };
    let permissive = scanner(
        Arc::new(FakeNet::default().with_host(host, fake)),
        Arc::new(FakeQuery::default()),
        Arc::new(MemoryStore::new()),
        opts,
    );
    let report = permissive.scan(host).await.unwrap();
    assert!(report.alive);
    assert_eq!(report.scan.udp_responding(), 1);
    assert!(report.scan.special_udp_ports.contains_key(&53));
}

#[tokio::test]
async fn tls_runs_only_when_https_is_open() {
    let with_https = ip("10.0.0.2");
    let without = ip("10.0.0.3");
    let net = Arc::new(
        FakeNet::default()
            .with_host(with_https, FakeHost::default().tcp(443, ""))
            .with_host(without, FakeHost::default().tcp(80, "Server: lighttpd")),
    );
    let query = Arc::new(FakeQuery::default());
    let scanner = scanner(
        net,
        query.clone(),
        Arc::new(MemoryStore::new()),
        options(ScanMode::Quick, Some("80,443"), "tls"),
    );

    let a = scanner.scan(with_https).await.unwrap();
    let b = scanner.scan(without).await.unwrap();

    assert!(matches!(a.enrichment.tls, Some(StepOutcome::Found(_))));
    assert!(b.enrichment.tls.is_none());
    assert_eq!(*query.tls_calls.lock().unwrap(), vec![(with_https, 443)]);
    assert!(b.issues.iter().any(|i| i.id == "HTTP_NO_HTTPS"));
}

#[tokio::test]
async fn quick_mode_without_ports_is_not_scanned() {
    let host = ip("10.0.0.9");
    let net = Arc::new(FakeNet::default().with_host(host, FakeHost::default().tcp(22, "")));
    let scanner = scanner(
        net.clone(),
        Arc::new(FakeQuery::default()),
        Arc::new(MemoryStore::new()),
        options(ScanMode::Quick, None, ""),
    );

    let report = scanner.scan(host).await.unwrap();

    assert!(!report.scan.is_tcp_scanned());
    assert!(report.scan.tcp_ports.is_empty());
    assert!(!report.alive);
    assert!(net.probed().is_empty());
}

#[tokio::test]
async fn failed_snmp_skips_cve_but_not_the_host() {
    let host = ip("10.0.0.4");
    let net = Arc::new(FakeNet::default().with_host(host, FakeHost::default().tcp(22, "")));
    let query = Arc::new(
        FakeQuery::default().describe(host, StepOutcome::Failed("malformed response".into())),
    );
    let scanner = scanner(
        net,
        query,
        Arc::new(MemoryStore::new()),
        options(ScanMode::Quick, Some("22"), "snmp,cve,mitre"),
    );

    let report = scanner.scan(host).await.unwrap();

    assert!(matches!(report.enrichment.snmp, Some(StepOutcome::Failed(_))));
    assert!(report.enrichment.cve_matches.is_none());
    assert!(report.enrichment.mitre_findings.is_some());
    assert!(report.alive);
}

#[tokio::test]
async fn only_device_registration_failure_is_fatal() {
    let ok_host = ip("10.0.0.5");
    let bad_host = ip("10.0.0.6");
    let net = Arc::new(
        FakeNet::default()
            .with_host(ok_host, FakeHost::default().tcp(23, ""))
            .with_host(bad_host, FakeHost::default().tcp(23, "")),
    );
    let store = Arc::new(BrokenStore {
        fatal_ips: vec![bad_host.to_string()],
    });
    let scanner = scanner(
        net,
        Arc::new(FakeQuery::default()),
        store,
        options(ScanMode::Quick, Some("23"), "mitre"),
    );

    let report = scanner.scan(ok_host).await.unwrap();
    assert!(report.alive);
    assert_eq!(report.risk, 3 + 25);

    let err = scanner.scan(bad_host).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
    assert!(!err.is_input_error());
}

#[tokio::test]
async fn report_serializes_with_tagged_enrichment() {
    let host = ip("10.0.0.7");
    let net = Arc::new(FakeNet::default().with_host(host, FakeHost::default().tcp(22, "SSH-2.0")));
    let scanner = scanner(
        net,
        Arc::new(FakeQuery::default()),
        Arc::new(MemoryStore::new()),
        options(ScanMode::Quick, Some("22"), "snmp"),
    );

    let report = scanner.scan(host).await.unwrap();
    let value = serde_json::to_value(&report).unwrap();

    assert_eq!(value["mode"], "quick");
    assert_eq!(value["scan"]["tcp_ports"]["22"]["state"], "open");
    assert_eq!(value["enrichment"]["snmp"]["status"], "absent");
    assert!(value["enrichment"].get("cve_matches").is_none());
}
