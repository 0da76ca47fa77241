//! SNMP v2c `sysDescr.0` lookup.
//!
//! Only one GetRequest is ever needed, so the BER encoding is done by hand and the
//! response is read with a small TLV reader that checks request id and error-status.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::debug;

use crate::types::StepOutcome;

/// 1.3.6.1.2.1.1.1.0
pub const SYS_DESCR_OID: &[u32] = &[1, 3, 6, 1, 2, 1, 1, 1, 0];

const SNMP_V2C: i64 = 1;

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
pub const PDU_GET_REQUEST: u8 = 0xA0;
pub const PDU_GET_RESPONSE: u8 = 0xA2;
// noSuchObject, noSuchInstance, endOfMibView
const EXCEPTION_TAGS: [u8; 3] = [0x80, 0x81, 0x82];

#[derive(Debug, Clone)]
pub struct SnmpSettings {
    pub community: String,
    pub port: u16,
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for SnmpSettings {
    fn default() -> Self {
        Self {
            community: String::from("public"),
            port: 161,
            timeout: Duration::from_secs(2),
            retries: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum SnmpError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no response")]
    Timeout,
    #[error("truncated message")]
    Truncated,
    #[error("invalid length encoding")]
    BadLength,
    #[error("expected tag {expected:#04x}, found {found:#04x}")]
    UnexpectedTag { expected: u8, found: u8 },
    #[error("agent returned error-status {0}")]
    ErrorStatus(i64),
    #[error("unsupported value type {0:#04x}")]
    UnexpectedType(u8),
}

/// Fetch the device description. Silence maps to `Absent`, anything else that goes wrong
/// to `Failed`; neither is fatal to the host pipeline.
pub async fn fetch_sys_descr(ip: IpAddr, settings: &SnmpSettings) -> StepOutcome<String> {
    match query_sys_descr(ip, settings).await {
        Ok(Some(descr)) if !descr.trim().is_empty() => StepOutcome::Found(descr),
        Ok(_) => StepOutcome::Absent,
        Err(SnmpError::Timeout) => {
            debug!(%ip, "no SNMP agent answered");
            StepOutcome::Absent
        }
        Err(SnmpError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            debug!(%ip, "SNMP port unreachable");
            StepOutcome::Absent
        }
        Err(e) => {
            debug!(%ip, error = %e, "SNMP query failed");
            StepOutcome::Failed(e.to_string())
        }
    }
}

async fn query_sys_descr(ip: IpAddr, settings: &SnmpSettings) -> Result<Option<String>, SnmpError> {
    let local: SocketAddr = match ip {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(SocketAddr::new(ip, settings.port)).await?;

    let mut buf = vec![0u8; 4096];
    // A slow agent may answer an earlier attempt while a later one is pending; any id we
    // sent is a valid answer.
    let mut sent_ids = Vec::with_capacity(settings.retries as usize + 1);
    for _attempt in 0..=settings.retries {
        let request_id = i64::from(rand::random::<u32>() >> 1);
        sent_ids.push(request_id);
        let request = encode_message(
            &settings.community,
            PDU_GET_REQUEST,
            request_id,
            0,
            SYS_DESCR_OID,
            TAG_NULL,
            &[],
        );
        socket.send(&request).await?;

        let deadline = time::Instant::now() + settings.timeout;
        loop {
            let n = match time::timeout_at(deadline, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(SnmpError::Io(e)),
                Err(_) => break,
            };
            let msg = decode_message(&buf[..n])?;
            if msg.pdu_tag != PDU_GET_RESPONSE {
                return Err(SnmpError::UnexpectedTag {
                    expected: PDU_GET_RESPONSE,
                    found: msg.pdu_tag,
                });
            }
            if !sent_ids.contains(&msg.request_id) {
                debug!(%ip, request_id = msg.request_id, "ignoring SNMP reply to unknown request");
                continue;
            }
            return msg.into_description();
        }
    }
    Err(SnmpError::Timeout)
}

/// One decoded v2c message carrying a single varbind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnmpMessage {
    pub version: i64,
    pub community: Vec<u8>,
    pub pdu_tag: u8,
    pub request_id: i64,
    pub error_status: i64,
    pub oid: Vec<u32>,
    pub value_tag: u8,
    pub value: Vec<u8>,
}

impl SnmpMessage {
    fn into_description(self) -> Result<Option<String>, SnmpError> {
        if self.error_status != 0 {
            return Err(SnmpError::ErrorStatus(self.error_status));
        }
        match self.value_tag {
            TAG_OCTET_STRING => Ok(Some(
                String::from_utf8_lossy(&self.value).trim().to_string(),
            )),
            TAG_NULL => Ok(None),
            t if EXCEPTION_TAGS.contains(&t) => Ok(None),
            t => Err(SnmpError::UnexpectedType(t)),
        }
    }
}

/// Encode a v2c message with one varbind.
pub fn encode_message(
    community: &str,
    pdu_tag: u8,
    request_id: i64,
    error_status: i64,
    oid: &[u32],
    value_tag: u8,
    value: &[u8],
) -> Vec<u8> {
    let varbind = tlv(
        TAG_SEQUENCE,
        &[tlv(TAG_OID, &encode_oid(oid)), tlv(value_tag, value)].concat(),
    );
    let varbinds = tlv(TAG_SEQUENCE, &varbind);
    let pdu = tlv(
        pdu_tag,
        &[
            tlv(TAG_INTEGER, &encode_integer(request_id)),
            tlv(TAG_INTEGER, &encode_integer(error_status)),
            tlv(TAG_INTEGER, &encode_integer(0)),
            varbinds,
        ]
        .concat(),
    );
    tlv(
        TAG_SEQUENCE,
        &[
            tlv(TAG_INTEGER, &encode_integer(SNMP_V2C)),
            tlv(TAG_OCTET_STRING, community.as_bytes()),
            pdu,
        ]
        .concat(),
    )
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    encode_length(content.len(), &mut out);
    out.extend_from_slice(content);
    out
}

fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

/// Minimal two's-complement encoding.
fn encode_integer(v: i64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let (cur, next) = (bytes[start], bytes[start + 1]);
        let redundant = (cur == 0x00 && next & 0x80 == 0) || (cur == 0xFF && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn encode_oid(oid: &[u32]) -> Vec<u8> {
    let mut out = Vec::new();
    if let [a, b, rest @ ..] = oid {
        push_base128(a * 40 + b, &mut out);
        for &arc in rest {
            push_base128(arc, &mut out);
        }
    }
    out
}

fn push_base128(mut v: u32, out: &mut Vec<u8>) {
    let mut tmp = [0u8; 5];
    let mut i = tmp.len();
    loop {
        i -= 1;
        tmp[i] = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    let last = tmp.len() - 1;
    for (j, b) in tmp.iter().enumerate().skip(i) {
        out.push(if j == last { *b } else { b | 0x80 });
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn read_any(&mut self) -> Result<(u8, &'a [u8]), SnmpError> {
        let (&tag, rest) = self.buf.split_first().ok_or(SnmpError::Truncated)?;
        let (&first, mut rest) = rest.split_first().ok_or(SnmpError::Truncated)?;
        let len = if first & 0x80 == 0 {
            usize::from(first)
        } else {
            let n = usize::from(first & 0x7f);
            if n == 0 || n > 4 || rest.len() < n {
                return Err(SnmpError::BadLength);
            }
            let len = rest[..n]
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
            rest = &rest[n..];
            len
        };
        if rest.len() < len {
            return Err(SnmpError::Truncated);
        }
        let (content, tail) = rest.split_at(len);
        self.buf = tail;
        Ok((tag, content))
    }

    fn read(&mut self, expected: u8) -> Result<&'a [u8], SnmpError> {
        let (found, content) = self.read_any()?;
        if found != expected {
            return Err(SnmpError::UnexpectedTag { expected, found });
        }
        Ok(content)
    }

    fn read_integer(&mut self) -> Result<i64, SnmpError> {
        decode_integer(self.read(TAG_INTEGER)?)
    }
}

fn decode_integer(bytes: &[u8]) -> Result<i64, SnmpError> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(SnmpError::BadLength);
    }
    let init: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    Ok(bytes.iter().fold(init, |acc, b| (acc << 8) | i64::from(*b)))
}

fn decode_oid(bytes: &[u8]) -> Result<Vec<u32>, SnmpError> {
    let mut arcs = Vec::new();
    let mut acc: u32 = 0;
    for &b in bytes {
        acc = acc.checked_mul(128).ok_or(SnmpError::BadLength)? | u32::from(b & 0x7f);
        if b & 0x80 == 0 {
            if arcs.is_empty() {
                let first = (acc / 40).min(2);
                arcs.push(first);
                arcs.push(acc - first * 40);
            } else {
                arcs.push(acc);
            }
            acc = 0;
        }
    }
    Ok(arcs)
}

/// Decode a v2c message, keeping only its first varbind.
pub fn decode_message(buf: &[u8]) -> Result<SnmpMessage, SnmpError> {
    let mut msg = Reader::new(Reader::new(buf).read(TAG_SEQUENCE)?);
    let version = msg.read_integer()?;
    let community = msg.read(TAG_OCTET_STRING)?.to_vec();

    let (pdu_tag, pdu) = msg.read_any()?;
    let mut pdu = Reader::new(pdu);
    let request_id = pdu.read_integer()?;
    let error_status = pdu.read_integer()?;
    let _error_index = pdu.read_integer()?;

    let mut varbinds = Reader::new(pdu.read(TAG_SEQUENCE)?);
    let mut varbind = Reader::new(varbinds.read(TAG_SEQUENCE)?);
    let oid = decode_oid(varbind.read(TAG_OID)?)?;
    let (value_tag, value) = varbind.read_any()?;

    Ok(SnmpMessage {
        version,
        community,
        pdu_tag,
        request_id,
        error_status,
        oid,
        value_tag,
        value: value.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(request_id: i64, error_status: i64, tag: u8, value: &[u8]) -> Vec<u8> {
        encode_message("public", PDU_GET_RESPONSE, request_id, error_status, SYS_DESCR_OID, tag, value)
    }

    #[test]
    fn get_request_matches_reference_bytes() {
        let packet = encode_message("public", PDU_GET_REQUEST, 0x1234_5678, 0, SYS_DESCR_OID, TAG_NULL, &[]);
        let expected: [u8; 43] = [
            0x30, 0x29, 0x02, 0x01, 0x01, 0x04, 0x06, 0x70, 0x75, 0x62, 0x6c, 0x69, 0x63, 0xA0,
            0x1C, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00, 0x30,
            0x0E, 0x30, 0x0C, 0x06, 0x08, 0x2B, 0x06, 0x01, 0x02, 0x01, 0x01, 0x01, 0x00, 0x05,
            0x00,
        ];
        assert_eq!(packet, expected);
    }

    #[test]
    fn integers_are_minimal() {
        assert_eq!(encode_integer(0), vec![0x00]);
        assert_eq!(encode_integer(127), vec![0x7f]);
        assert_eq!(encode_integer(128), vec![0x00, 0x80]);
        assert_eq!(encode_integer(-1), vec![0xff]);
        assert_eq!(decode_integer(&[0x00, 0x80]).unwrap(), 128);
        assert_eq!(decode_integer(&[0xff, 0x7f]).unwrap(), -129);
    }

    #[test]
    fn oid_round_trips_multibyte_arcs() {
        let oid = [1, 3, 6, 1, 4, 1, 35265, 1];
        assert_eq!(decode_oid(&encode_oid(&oid)).unwrap(), oid.to_vec());
    }

    #[test]
    fn decodes_description_from_response() {
        let descr = "Eltex MES2324 Ethernet Switch, firmware 4.0.9";
        let msg = decode_message(&response(42, 0, TAG_OCTET_STRING, descr.as_bytes())).unwrap();
        assert_eq!(msg.version, SNMP_V2C);
        assert_eq!(msg.community, b"public");
        assert_eq!(msg.pdu_tag, PDU_GET_RESPONSE);
        assert_eq!(msg.request_id, 42);
        assert_eq!(msg.oid, SYS_DESCR_OID.to_vec());
        assert_eq!(msg.into_description().unwrap().as_deref(), Some(descr));
    }

    #[test]
    fn long_form_lengths_decode() {
        let descr = "x".repeat(300);
        let msg = decode_message(&response(7, 0, TAG_OCTET_STRING, descr.as_bytes())).unwrap();
        assert_eq!(msg.value.len(), 300);
    }

    #[test]
    fn exceptions_and_errors() {
        let msg = decode_message(&response(1, 0, 0x81, &[])).unwrap();
        assert_eq!(msg.into_description().unwrap(), None);
        let msg = decode_message(&response(1, 2, TAG_NULL, &[])).unwrap();
        assert!(matches!(msg.into_description(), Err(SnmpError::ErrorStatus(2))));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let full = response(9, 0, TAG_OCTET_STRING, b"device");
        assert!(decode_message(&full[..full.len() - 3]).is_err());
        assert!(decode_message(&[]).is_err());
        assert!(decode_message(&[0x30, 0x85, 0, 0, 0, 0, 1]).is_err());
    }

    async fn fake_agent(descr: &'static str) -> u16 {
        let agent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = agent.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = agent.recv_from(&mut buf).await.unwrap();
            let req = decode_message(&buf[..n]).unwrap();
            assert_eq!(req.pdu_tag, PDU_GET_REQUEST);
            let reply = encode_message(
                "public",
                PDU_GET_RESPONSE,
                req.request_id,
                0,
                SYS_DESCR_OID,
                TAG_OCTET_STRING,
                descr.as_bytes(),
            );
            agent.send_to(&reply, peer).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn fetches_from_loopback_agent() {
        let port = fake_agent("Linux gw 5.15 public").await;
        let settings = SnmpSettings {
            port,
            ..SnmpSettings::default()
        };
        let out = fetch_sys_descr(IpAddr::V4(Ipv4Addr::LOCALHOST), &settings).await;
        assert_eq!(out, StepOutcome::Found("Linux gw 5.15 public".to_string()));
    }

    #[tokio::test]
    async fn silent_agent_is_absent() {
        let agent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let settings = SnmpSettings {
            port: agent.local_addr().unwrap().port(),
            timeout: Duration::from_millis(100),
            retries: 1,
            ..SnmpSettings::default()
        };
        let out = fetch_sys_descr(IpAddr::V4(Ipv4Addr::LOCALHOST), &settings).await;
        assert_eq!(out, StepOutcome::Absent);
    }

    fn sys_descr_reply(request_id: i64, descr: &str) -> Vec<u8> {
        encode_message(
            "public",
            PDU_GET_RESPONSE,
            request_id,
            0,
            SYS_DESCR_OID,
            TAG_OCTET_STRING,
            descr.as_bytes(),
        )
    }

    #[tokio::test]
    async fn late_reply_to_first_attempt_is_accepted() {
        let agent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = agent.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            // first answer arrives after the first attempt has timed out
            for delay_ms in [150u64, 0] {
                let (n, peer) = agent.recv_from(&mut buf).await.unwrap();
                let req = decode_message(&buf[..n]).unwrap();
                time::sleep(Duration::from_millis(delay_ms)).await;
                let _ = agent
                    .send_to(&sys_descr_reply(req.request_id, "slow switch"), peer)
                    .await;
            }
        });
        let settings = SnmpSettings {
            port,
            timeout: Duration::from_millis(100),
            retries: 2,
            ..SnmpSettings::default()
        };
        let out = fetch_sys_descr(IpAddr::V4(Ipv4Addr::LOCALHOST), &settings).await;
        assert_eq!(out, StepOutcome::Found("slow switch".to_string()));
    }

    #[tokio::test]
    async fn reply_with_unknown_request_id_is_skipped() {
        let agent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = agent.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = agent.recv_from(&mut buf).await.unwrap();
            let req = decode_message(&buf[..n]).unwrap();
            let stale = sys_descr_reply(req.request_id + 1, "someone else");
            agent.send_to(&stale, peer).await.unwrap();
            let good = sys_descr_reply(req.request_id, "edge router");
            agent.send_to(&good, peer).await.unwrap();
        });
        let settings = SnmpSettings {
            port,
            timeout: Duration::from_secs(1),
            retries: 0,
            ..SnmpSettings::default()
        };
        let out = fetch_sys_descr(IpAddr::V4(Ipv4Addr::LOCALHOST), &settings).await;
        assert_eq!(out, StepOutcome::Found("edge router".to_string()));
    }
}
