use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

use crate::ports::{ScanPlan, MAX_CONCURRENCY};
use crate::probe::Prober;
use crate::types::{HostScanResult, PortMap, PortOutcome, Protocol};

/// Probe every port of one host with a bounded pool and merge the hits.
///
/// - Pool size is `min(len(ports), concurrency)`, enforced with a `Semaphore`.
/// - Each probe bounds itself with its own timeout; there is no scan-wide deadline.
/// - A panicking or failed task is logged and dropped without affecting its siblings.
/// - Results land in a `BTreeMap`, so content never depends on completion order.
pub async fn scan_ports(
    prober: Arc<dyn Prober>,
    ip: IpAddr,
    ports: &[u16],
    protocol: Protocol,
    concurrency: usize,
    timeout: Duration,
) -> PortMap {
    let mut found = PortMap::new();
    if ports.is_empty() {
        return found;
    }

    let workers = ports.len().min(concurrency).clamp(1, MAX_CONCURRENCY);
    let sem = Arc::new(Semaphore::new(workers));
    let mut set = JoinSet::new();

    debug!(%ip, protocol = protocol.as_str(), ports = ports.len(), workers, "port scan started");

    for &port in ports {
        let Ok(permit) = sem.clone().acquire_owned().await else {
            break;
        };
        let prober = prober.clone();
        set.spawn(async move {
            let _permit = permit; // keep permit until the probe completes
            let outcome = match protocol {
                Protocol::Tcp => prober.probe_tcp(ip, port, timeout).await,
                Protocol::Udp => prober.probe_udp(ip, port, timeout).await,
            };
            (port, outcome)
        });

        // Drain finished probes so a full-range scan doesn't hold 65k task results.
        while let Some(res) = set.try_join_next() {
            merge(&mut found, ip, res);
        }
    }

    while let Some(res) = set.join_next().await {
        merge(&mut found, ip, res);
    }

    debug!(%ip, protocol = protocol.as_str(), hits = found.len(), "port scan finished");
    found
}

fn merge(
    found: &mut PortMap,
    ip: IpAddr,
    res: Result<(u16, Option<PortOutcome>), JoinError>,
) {
    match res {
        Ok((port, Some(outcome))) => {
            found.insert(port, outcome);
        }
        Ok((_, None)) => {}
        Err(e) => warn!(%ip, error = %e, "probe task failed"),
    }
}

pub async fn scan_tcp(
    prober: Arc<dyn Prober>,
    ip: IpAddr,
    ports: &[u16],
    concurrency: usize,
    timeout: Duration,
) -> PortMap {
    scan_ports(prober, ip, ports, Protocol::Tcp, concurrency, timeout).await
}

pub async fn scan_udp(
    prober: Arc<dyn Prober>,
    ip: IpAddr,
    ports: &[u16],
    concurrency: usize,
    timeout: Duration,
) -> PortMap {
    scan_ports(prober, ip, ports, Protocol::Udp, concurrency, timeout).await
}

/// Run the TCP pass, then the UDP pass, of a resolved plan.
///
/// An empty TCP port set leaves the host "not scanned" for TCP (empty map, zero count).
pub async fn scan_host(prober: Arc<dyn Prober>, ip: IpAddr, plan: &ScanPlan) -> HostScanResult {
    let tcp = scan_tcp(
        prober.clone(),
        ip,
        &plan.tcp_ports,
        plan.concurrency,
        plan.tcp_timeout,
    )
    .await;

    let udp = if plan.mode.probes_udp() {
        scan_udp(
            prober,
            ip,
            &plan.udp_ports,
            plan.udp_concurrency,
            plan.udp_timeout,
        )
        .await
    } else {
        PortMap::new()
    };
    let scanned_udp = if plan.mode.probes_udp() {
        plan.udp_ports.len()
    } else {
        0
    };

    HostScanResult::from_scans(ip, tcp, plan.tcp_ports.len(), udp, scanned_udp)
}
