//! SNMP GET probe.
//!
//! Encodes a single-varbind GetRequest in BER and compares the returned
//! value against the operator/expected pair when one is configured.
//! Supports v1 and v2c community authentication.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::db::{CheckStatus, Target};

use super::{CheckResult, Checker, ErrorKind};

const SNMP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_OID: &str = "1.3.6.1.2.1.1.1.0"; // sysDescr.0
const DEFAULT_COMMUNITY: &str = "public";
const DEFAULT_PORT: u16 = 161;

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_IP_ADDRESS: u8 = 0x40;
const TAG_COUNTER32: u8 = 0x41;
const TAG_GAUGE32: u8 = 0x42;
const TAG_TIMETICKS: u8 = 0x43;
const TAG_COUNTER64: u8 = 0x46;
const TAG_GET_REQUEST: u8 = 0xA0;
const TAG_GET_RESPONSE: u8 = 0xA2;

/// A decoded varbind value.
#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    Integer(i64),
    OctetString(Vec<u8>),
    ObjectIdentifier(String),
    IpAddress(String),
    Counter(u64),
    Null,
    Unsupported(u8),
}

impl SnmpValue {
    fn type_name(&self) -> &'static str {
        match self {
            SnmpValue::Integer(_) => "Integer",
            SnmpValue::OctetString(_) => "OctetString",
            SnmpValue::ObjectIdentifier(_) => "ObjectIdentifier",
            SnmpValue::IpAddress(_) => "IpAddress",
            SnmpValue::Counter(_) => "Counter",
            SnmpValue::Null => "Null",
            SnmpValue::Unsupported(_) => "Unsupported",
        }
    }

    fn display(&self) -> String {
        match self {
            SnmpValue::Integer(v) => v.to_string(),
            SnmpValue::OctetString(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            SnmpValue::ObjectIdentifier(oid) => oid.clone(),
            SnmpValue::IpAddress(ip) => ip.clone(),
            SnmpValue::Counter(v) => v.to_string(),
            SnmpValue::Null => "null".to_string(),
            SnmpValue::Unsupported(tag) => format!("unsupported(0x{:02X})", tag),
        }
    }
}

pub struct SnmpChecker;

#[async_trait]
impl Checker for SnmpChecker {
    async fn check(&self, target: &Target) -> CheckResult {
        let start = Instant::now();

        let community = if target.snmp.community.is_empty() {
            DEFAULT_COMMUNITY
        } else {
            &target.snmp.community
        };
        let oid = if target.snmp.oid.is_empty() {
            DEFAULT_OID
        } else {
            &target.snmp.oid
        };
        let port = if target.port != 0 { target.port } else { DEFAULT_PORT };

        let version = match target.snmp.version.as_str() {
            "" | "v1" => 0u8,
            "v2c" | "v2" => 1u8,
            "v3" => {
                return CheckResult::failed(
                    ErrorKind::ProtocolError,
                    "SNMPv3 requires USM credentials; configure v1 or v2c",
                    start.elapsed().as_millis() as i64,
                )
            }
            other => {
                return CheckResult::failed(
                    ErrorKind::ConfigError,
                    format!("unknown SNMP version: {}", other),
                    start.elapsed().as_millis() as i64,
                )
            }
        };

        let request_id: i32 = rand::random::<u16>() as i32;
        let request = match encode_get_request(version, community, oid, request_id) {
            Ok(r) => r,
            Err(message) => {
                return CheckResult::failed(
                    ErrorKind::ConfigError,
                    message,
                    start.elapsed().as_millis() as i64,
                )
            }
        };

        let value = match exchange(&target.address, port, &request, request_id).await {
            Ok(v) => v,
            Err(message) => {
                return CheckResult::failed(
                    ErrorKind::ProtocolError,
                    format!("SNMP query failed: {}", message),
                    start.elapsed().as_millis() as i64,
                )
            }
        };

        let actual = value.display();
        let (status, message) = if !target.snmp.operator.is_empty()
            && !target.snmp.expected_value.is_empty()
        {
            let matched = compare(&actual, &target.snmp.operator, &target.snmp.expected_value);
            if matched {
                (
                    CheckStatus::Up,
                    format!(
                        "SNMP value check passed - Expected: {} {} {}, Got: {}",
                        target.snmp.expected_value, target.snmp.operator, oid, actual
                    ),
                )
            } else {
                (
                    CheckStatus::Down,
                    format!(
                        "SNMP value check failed - Expected: {} {} {}, Got: {}",
                        target.snmp.expected_value, target.snmp.operator, oid, actual
                    ),
                )
            }
        } else {
            (
                CheckStatus::Up,
                format!("SNMP query successful - OID: {}, Value: {}", oid, actual),
            )
        };

        let mut data = serde_json::Map::new();
        data.insert("oid".to_string(), oid.into());
        data.insert("value".to_string(), actual.clone().into());
        data.insert("type".to_string(), value.type_name().into());
        data.insert("community".to_string(), community.into());
        data.insert("version".to_string(), target.snmp.version.clone().into());

        let mut result = CheckResult {
            status,
            response_time_ms: start.elapsed().as_millis() as i64,
            message,
            data,
            ..Default::default()
        };
        if status == CheckStatus::Down {
            result.error = Some(super::ErrorDetails {
                kind: ErrorKind::ProtocolError,
                message: format!("value mismatch: got {}", actual),
            });
        }
        result
    }
}

async fn exchange(
    address: &str,
    port: u16,
    request: &[u8],
    request_id: i32,
) -> Result<SnmpValue, String> {
    let work = async {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| e.to_string())?;
        socket
            .connect((address, port))
            .await
            .map_err(|e| e.to_string())?;
        socket.send(request).await.map_err(|e| e.to_string())?;

        let mut buf = [0u8; 4096];
        let n = socket.recv(&mut buf).await.map_err(|e| e.to_string())?;
        parse_get_response(&buf[..n], request_id)
    };

    tokio::time::timeout(SNMP_TIMEOUT, work)
        .await
        .map_err(|_| "request timed out".to_string())?
}

/// Numeric comparison when both sides parse as numbers, string eq/ne
/// otherwise.
fn compare(actual: &str, operator: &str, expected: &str) -> bool {
    if let (Ok(actual_num), Ok(expected_num)) = (actual.parse::<f64>(), expected.parse::<f64>()) {
        return match operator {
            "eq" => actual_num == expected_num,
            "ne" => actual_num != expected_num,
            "gt" => actual_num > expected_num,
            "lt" => actual_num < expected_num,
            "ge" => actual_num >= expected_num,
            "le" => actual_num <= expected_num,
            _ => false,
        };
    }
    match operator {
        "ne" => actual != expected,
        _ => actual == expected,
    }
}

// --- BER codec ---

fn encode_length(len: usize) -> Vec<u8> {
    if len < 0x80 {
        vec![len as u8]
    } else if len <= 0xFF {
        vec![0x81, len as u8]
    } else {
        vec![0x82, (len >> 8) as u8, len as u8]
    }
}

fn encode_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend(encode_length(content.len()));
    out.extend_from_slice(content);
    out
}

fn encode_integer(value: i64) -> Vec<u8> {
    let mut bytes = value.to_be_bytes().to_vec();
    // Trim redundant leading bytes while keeping the sign bit intact.
    while bytes.len() > 1 {
        if (bytes[0] == 0x00 && bytes[1] & 0x80 == 0)
            || (bytes[0] == 0xFF && bytes[1] & 0x80 != 0)
        {
            bytes.remove(0);
        } else {
            break;
        }
    }
    encode_tlv(TAG_INTEGER, &bytes)
}

fn encode_oid(oid: &str) -> Result<Vec<u8>, String> {
    let arcs: Vec<u64> = oid
        .split('.')
        .map(|part| part.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|_| format!("invalid OID: {}", oid))?;
    if arcs.len() < 2 || arcs[0] > 2 || arcs[1] > 39 {
        return Err(format!("invalid OID: {}", oid));
    }

    let mut content = vec![(arcs[0] * 40 + arcs[1]) as u8];
    for &arc in &arcs[2..] {
        content.extend(encode_base128(arc));
    }
    Ok(encode_tlv(TAG_OID, &content))
}

fn encode_base128(mut value: u64) -> Vec<u8> {
    let mut out = vec![(value & 0x7F) as u8];
    value >>= 7;
    while value > 0 {
        out.insert(0, (value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }
    out
}

/// SEQUENCE { version, community, GetRequest { id, 0, 0, varbinds } }
fn encode_get_request(
    version: u8,
    community: &str,
    oid: &str,
    request_id: i32,
) -> Result<Vec<u8>, String> {
    let varbind = encode_tlv(TAG_SEQUENCE, &{
        let mut v = encode_oid(oid)?;
        v.extend(encode_tlv(TAG_NULL, &[]));
        v
    });
    let varbinds = encode_tlv(TAG_SEQUENCE, &varbind);

    let mut pdu_content = encode_integer(request_id as i64);
    pdu_content.extend(encode_integer(0)); // error-status
    pdu_content.extend(encode_integer(0)); // error-index
    pdu_content.extend(varbinds);
    let pdu = encode_tlv(TAG_GET_REQUEST, &pdu_content);

    let mut message = encode_integer(version as i64);
    message.extend(encode_tlv(TAG_OCTET_STRING, community.as_bytes()));
    message.extend(pdu);
    Ok(encode_tlv(TAG_SEQUENCE, &message))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_tlv(&mut self) -> Result<(u8, &'a [u8]), String> {
        if self.pos + 2 > self.buf.len() {
            return Err("truncated TLV header".to_string());
        }
        let tag = self.buf[self.pos];
        let mut len = self.buf[self.pos + 1] as usize;
        self.pos += 2;

        if len & 0x80 != 0 {
            let num_bytes = len & 0x7F;
            if num_bytes == 0 || num_bytes > 4 || self.pos + num_bytes > self.buf.len() {
                return Err("unsupported TLV length".to_string());
            }
            len = 0;
            for _ in 0..num_bytes {
                len = (len << 8) | self.buf[self.pos] as usize;
                self.pos += 1;
            }
        }

        if self.pos + len > self.buf.len() {
            return Err("TLV content runs past buffer".to_string());
        }
        let content = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok((tag, content))
    }

    fn read_integer(&mut self) -> Result<i64, String> {
        let (tag, content) = self.read_tlv()?;
        if tag != TAG_INTEGER {
            return Err(format!("expected INTEGER, got tag 0x{:02X}", tag));
        }
        Ok(decode_integer(content))
    }
}

fn decode_integer(content: &[u8]) -> i64 {
    if content.is_empty() {
        return 0;
    }
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for &byte in content {
        value = (value << 8) | byte as i64;
    }
    value
}

fn decode_unsigned(content: &[u8]) -> u64 {
    let mut value: u64 = 0;
    for &byte in content {
        value = (value << 8) | byte as u64;
    }
    value
}

fn decode_oid(content: &[u8]) -> String {
    if content.is_empty() {
        return String::new();
    }
    let mut arcs = vec![(content[0] / 40) as u64, (content[0] % 40) as u64];
    let mut acc: u64 = 0;
    for &byte in &content[1..] {
        acc = (acc << 7) | (byte & 0x7F) as u64;
        if byte & 0x80 == 0 {
            arcs.push(acc);
            acc = 0;
        }
    }
    arcs.iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// Walk a GetResponse down to the first varbind's value.
fn parse_get_response(buf: &[u8], request_id: i32) -> Result<SnmpValue, String> {
    let mut outer = Reader::new(buf);
    let (tag, message) = outer.read_tlv()?;
    if tag != TAG_SEQUENCE {
        return Err("response is not a SEQUENCE".to_string());
    }

    let mut message = Reader::new(message);
    let _version = message.read_integer()?;
    let (tag, _community) = message.read_tlv()?;
    if tag != TAG_OCTET_STRING {
        return Err("missing community string".to_string());
    }

    let (tag, pdu) = message.read_tlv()?;
    if tag != TAG_GET_RESPONSE {
        return Err(format!("expected GetResponse, got tag 0x{:02X}", tag));
    }

    let mut pdu = Reader::new(pdu);
    let reply_id = pdu.read_integer()?;
    if reply_id != request_id as i64 {
        return Err(format!(
            "request id mismatch: got {}, expected {}",
            reply_id, request_id
        ));
    }
    let error_status = pdu.read_integer()?;
    let _error_index = pdu.read_integer()?;
    if error_status != 0 {
        return Err(format!("server returned error-status {}", error_status));
    }

    let (tag, varbinds) = pdu.read_tlv()?;
    if tag != TAG_SEQUENCE {
        return Err("missing varbind list".to_string());
    }
    let mut varbinds = Reader::new(varbinds);
    let (tag, varbind) = varbinds.read_tlv()?;
    if tag != TAG_SEQUENCE {
        return Err("missing varbind".to_string());
    }
    let mut varbind = Reader::new(varbind);
    let (tag, _oid) = varbind.read_tlv()?;
    if tag != TAG_OID {
        return Err("varbind missing OID".to_string());
    }

    let (tag, content) = varbind.read_tlv()?;
    let value = match tag {
        TAG_INTEGER => SnmpValue::Integer(decode_integer(content)),
        TAG_OCTET_STRING => SnmpValue::OctetString(content.to_vec()),
        TAG_OID => SnmpValue::ObjectIdentifier(decode_oid(content)),
        TAG_IP_ADDRESS if content.len() == 4 => SnmpValue::IpAddress(format!(
            "{}.{}.{}.{}",
            content[0], content[1], content[2], content[3]
        )),
        TAG_COUNTER32 | TAG_GAUGE32 | TAG_TIMETICKS | TAG_COUNTER64 => {
            SnmpValue::Counter(decode_unsigned(content))
        }
        TAG_NULL => SnmpValue::Null,
        other => SnmpValue::Unsupported(other),
    };
    Ok(value)
}
