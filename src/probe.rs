//! Single-port probes. One socket per call, closed on return, no retries.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time;
use tracing::trace;

use crate::types::{PortOutcome, MAX_BANNER_LEN};

/// Neutral bytes that coax a greeting or an error line out of most line-based services.
const TCP_NUDGE: &[u8] = b"\r\n\r\n";
const UDP_PAYLOAD: &[u8] = &[0x00];

/// Network seam for the scan engine. `None` means closed, unreachable or timed out.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe_tcp(&self, ip: IpAddr, port: u16, timeout: Duration) -> Option<PortOutcome>;
    async fn probe_udp(&self, ip: IpAddr, port: u16, timeout: Duration) -> Option<PortOutcome>;
}

/// Plain OS sockets via tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketProber;

#[async_trait]
impl Prober for SocketProber {
    async fn probe_tcp(&self, ip: IpAddr, port: u16, timeout: Duration) -> Option<PortOutcome> {
        probe_tcp(ip, port, timeout).await
    }

    async fn probe_udp(&self, ip: IpAddr, port: u16, timeout: Duration) -> Option<PortOutcome> {
        probe_udp(ip, port, timeout).await
    }
}

/// Connect, nudge, and read one bounded banner. A failed read still counts as open.
pub async fn probe_tcp(ip: IpAddr, port: u16, timeout: Duration) -> Option<PortOutcome> {
    let addr = SocketAddr::new(ip, port);
    let mut stream = match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            trace!(%addr, error = %e, "tcp connect failed");
            return None;
        }
        Err(_) => return None,
    };
    let banner = read_banner(&mut stream, timeout).await;
    Some(PortOutcome::open(&banner))
}

async fn read_banner(stream: &mut TcpStream, timeout: Duration) -> Vec<u8> {
    let _ = time::timeout(timeout, stream.write_all(TCP_NUDGE)).await;
    let mut buf = vec![0u8; MAX_BANNER_LEN];
    match time::timeout(timeout, stream.read(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            buf
        }
        _ => Vec::new(),
    }
}

/// Send one datagram and wait for any reply.
///
/// Silence is reported as `open|filtered`: without protocol payloads UDP cannot tell an
/// open, quiet service from a filtered port. A socket error (including ICMP port
/// unreachable surfacing on the connected socket) yields no result.
pub async fn probe_udp(ip: IpAddr, port: u16, timeout: Duration) -> Option<PortOutcome> {
    let local: SocketAddr = match ip {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await.ok()?;
    socket.connect(SocketAddr::new(ip, port)).await.ok()?;
    socket.send(UDP_PAYLOAD).await.ok()?;

    let mut buf = vec![0u8; MAX_BANNER_LEN];
    match time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => Some(PortOutcome::open(&buf[..n])),
        Ok(Err(e)) => {
            trace!(%ip, port, error = %e, "udp probe error");
            None
        }
        Err(_) => Some(PortOutcome::open_or_filtered()),
    }
}
