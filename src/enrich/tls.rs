//! TLS certificate introspection.
//!
//! First a verifying handshake; devices with self-signed or expired certificates fail it,
//! so the fallback repeats the handshake with validation off, takes the raw DER and parses
//! it on its own. Both paths produce the same [`CertInfo`].

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ::time::format_description::well_known::Rfc3339;
use ::time::OffsetDateTime;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

use crate::types::{CertInfo, StepOutcome};

#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub timeout: Duration,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("timed out")]
    Timeout,
    #[error("server presented no certificate")]
    NoCertificate,
    #[error("cannot decode certificate: {0}")]
    Parse(String),
}

pub async fn inspect(ip: IpAddr, port: u16, settings: &TlsSettings) -> StepOutcome<CertInfo> {
    match peer_certificate(ip, port, settings, true).await {
        Ok(der) => match parse_certificate(&der, true) {
            Ok(info) => return StepOutcome::Found(info),
            Err(e) => debug!(%ip, error = %e, "verified certificate unusable"),
        },
        Err(e) => debug!(%ip, error = %e, "verifying handshake failed, retrying without validation"),
    }

    match peer_certificate(ip, port, settings, false)
        .await
        .and_then(|der| parse_certificate(&der, false))
    {
        Ok(info) => StepOutcome::Found(info),
        Err(e) => StepOutcome::Failed(format!("TLS check failed: {e}")),
    }
}

async fn peer_certificate(
    ip: IpAddr,
    port: u16,
    settings: &TlsSettings,
    verify: bool,
) -> Result<Vec<u8>, TlsError> {
    let mut builder = native_tls::TlsConnector::builder();
    if !verify {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    let connector = tokio_native_tls::TlsConnector::from(builder.build()?);

    let addr = SocketAddr::new(ip, port);
    let tcp = time::timeout(settings.timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TlsError::Timeout)??;
    let domain = ip.to_string();
    let stream = time::timeout(settings.timeout, connector.connect(&domain, tcp))
        .await
        .map_err(|_| TlsError::Timeout)??;

    let cert = stream
        .get_ref()
        .peer_certificate()?
        .ok_or(TlsError::NoCertificate)?;
    Ok(cert.to_der()?)
}

/// Decode a DER certificate into the normalized shape.
pub fn parse_certificate(der: &[u8], verified: bool) -> Result<CertInfo, TlsError> {
    let (_, cert) =
        x509_parser::parse_x509_certificate(der).map_err(|e| TlsError::Parse(e.to_string()))?;
    let validity = cert.validity();
    let not_before = validity.not_before.timestamp();
    let not_after = validity.not_after.timestamp();
    let now = OffsetDateTime::now_utc().unix_timestamp();

    Ok(CertInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before: rfc3339(not_before),
        not_after: rfc3339(not_after),
        verified,
        expired: now < not_before || now > not_after,
    })
}

fn rfc3339(unix: i64) -> String {
    OffsetDateTime::from_unix_timestamp(unix)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| unix.to_string())
}
