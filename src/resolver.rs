//! DNS resolution over UDP, TCP, DoH and DoT transports.
//!
//! Queries are built and parsed on the wire directly; DoH (RFC 8484 JSON
//! flavor) goes through the shared HTTP client and DoT (RFC 7858) wraps the
//! TCP framing in TLS with hostname verification.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::probe::shared_client;

const DNS_TIMEOUT: Duration = Duration::from_secs(10);

/// DNS transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
    Doh,
    Dot,
}

impl FromStr for Transport {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            "doh" => Ok(Transport::Doh),
            "dot" => Ok(Transport::Dot),
            other => Err(ResolveError::Config(format!(
                "unknown DNS transport: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid resolver configuration: {0}")]
    Config(String),
    #[error("dns i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dns query timed out")]
    Timeout,
    #[error("malformed dns response: {0}")]
    Malformed(String),
    #[error("dns server returned rcode {0}")]
    Server(u8),
    #[error("doh request failed: {0}")]
    Doh(String),
}

/// Records returned by a lookup, grouped by type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub a: Vec<String>,
    pub aaaa: Vec<String>,
    pub cname: Vec<String>,
    pub mx: Vec<String>,
    pub txt: Vec<String>,
    pub ns: Vec<String>,
}

impl QueryResult {
    /// True when the answer resolves the name to an address or alias.
    pub fn has_address(&self) -> bool {
        !self.a.is_empty() || !self.aaaa.is_empty() || !self.cname.is_empty()
    }
}

/// A DNS resolver bound to one server and transport.
#[derive(Debug, Clone)]
pub struct Resolver {
    server: String,
    transport: Transport,
    timeout: Duration,
}

impl Resolver {
    pub fn new(server: impl Into<String>, transport: Transport) -> Self {
        Self {
            server: server.into(),
            transport,
            timeout: DNS_TIMEOUT,
        }
    }

    /// Query the server for A records of `domain` and collect every answer.
    pub async fn lookup(&self, domain: &str) -> Result<QueryResult, ResolveError> {
        match self.transport {
            Transport::Udp => self.lookup_udp(domain).await,
            Transport::Tcp => self.lookup_tcp(domain).await,
            Transport::Doh => self.lookup_doh(domain).await,
            Transport::Dot => self.lookup_dot(domain).await,
        }
    }

    async fn lookup_udp(&self, domain: &str) -> Result<QueryResult, ResolveError> {
        let server = ensure_port(&self.server, 53);
        let query = encode_query(domain)?;
        let tx_id = u16::from_be_bytes([query[0], query[1]]);

        let work = async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(&server).await?;
            socket.send(&query).await?;

            let mut buf = [0u8; 1500];
            let n = socket.recv(&mut buf).await?;
            Ok::<Vec<u8>, std::io::Error>(buf[..n].to_vec())
        };

        let response = tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| ResolveError::Timeout)??;
        parse_response(tx_id, &response)
    }

    async fn lookup_tcp(&self, domain: &str) -> Result<QueryResult, ResolveError> {
        let server = ensure_port(&self.server, 53);
        let query = encode_query(domain)?;
        let tx_id = u16::from_be_bytes([query[0], query[1]]);

        let work = async {
            let mut stream = TcpStream::connect(&server).await?;
            write_framed(&mut stream, &query).await?;
            read_framed(&mut stream).await
        };

        let response = tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| ResolveError::Timeout)??;
        parse_response(tx_id, &response)
    }

    async fn lookup_doh(&self, domain: &str) -> Result<QueryResult, ResolveError> {
        let url = format!(
            "{}?name={}&type=A",
            self.server.trim_end_matches('/'),
            domain
        );

        let response = shared_client()
            .get(&url)
            .header("Accept", "application/dns-json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ResolveError::Doh(e.to_string()))?;

        let body = response
            .bytes()
            .await
            .map_err(|e| ResolveError::Doh(e.to_string()))?;
        parse_doh_response(&body)
    }

    async fn lookup_dot(&self, domain: &str) -> Result<QueryResult, ResolveError> {
        let (host, port) = split_host_port(&self.server, 853);
        let query = encode_query(domain)?;
        let tx_id = u16::from_be_bytes([query[0], query[1]]);

        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| ResolveError::Config(format!("invalid DoT server name: {}", host)))?;

        let work = async {
            let stream = TcpStream::connect((host.as_str(), port)).await?;
            let connector = TlsConnector::from(tls_config());
            let mut tls = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            write_framed(&mut tls, &query).await?;
            read_framed(&mut tls).await
        };

        let response = tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| ResolveError::Timeout)??;
        parse_response(tx_id, &response)
    }
}

fn tls_config() -> Arc<ClientConfig> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.into(),
    };
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Append the default port when the address has none.
pub fn ensure_port(server: &str, default_port: u16) -> String {
    let (host, port) = split_host_port(server, default_port);
    format!("{}:{}", host, port)
}

/// Split `host[:port]`, falling back to the default port.
pub fn split_host_port(server: &str, default_port: u16) -> (String, u16) {
    match server.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
            Ok(p) => (host.to_string(), p),
            Err(_) => (server.to_string(), default_port),
        },
        _ => (server.to_string(), default_port),
    }
}

async fn write_framed<W: AsyncWriteExt + Unpin>(w: &mut W, msg: &[u8]) -> std::io::Result<()> {
    // TCP and DoT prefix the message with a 2-byte big-endian length.
    let len = (msg.len() as u16).to_be_bytes();
    w.write_all(&len).await?;
    w.write_all(msg).await?;
    w.flush().await
}

async fn read_framed<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

// --- Wire codec ---

const TYPE_A: u16 = 1;
const TYPE_NS: u16 = 2;
const TYPE_CNAME: u16 = 5;
const TYPE_MX: u16 = 15;
const TYPE_TXT: u16 = 16;
const TYPE_AAAA: u16 = 28;

/// Build a standard recursive query for the A record of `domain`.
fn encode_query(domain: &str) -> Result<Vec<u8>, ResolveError> {
    let tx_id: u16 = rand::random();
    let mut packet = Vec::with_capacity(32 + domain.len());

    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&0x0100u16.to_be_bytes()); // RD=1, standard query
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());

    for label in domain.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ResolveError::Config(format!(
                "invalid domain name: {}",
                domain
            )));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&TYPE_A.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // IN

    Ok(packet)
}

/// Parse a response message and collect the answers by record type.
fn parse_response(tx_id: u16, buf: &[u8]) -> Result<QueryResult, ResolveError> {
    if buf.len() < 12 {
        return Err(ResolveError::Malformed(format!(
            "response too short: {} bytes",
            buf.len()
        )));
    }

    let resp_id = u16::from_be_bytes([buf[0], buf[1]]);
    if resp_id != tx_id {
        return Err(ResolveError::Malformed(format!(
            "transaction id mismatch: got {}, expected {}",
            resp_id, tx_id
        )));
    }

    let rcode = buf[3] & 0x0F;
    if rcode != 0 {
        return Err(ResolveError::Server(rcode));
    }

    let qd_count = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let an_count = u16::from_be_bytes([buf[6], buf[7]]) as usize;

    let mut pos = 12;
    for _ in 0..qd_count {
        let (_, next) = read_name(buf, pos)?;
        pos = next + 4; // QTYPE + QCLASS
    }

    let mut result = QueryResult::default();
    for _ in 0..an_count {
        let (_, next) = read_name(buf, pos)?;
        pos = next;
        if pos + 10 > buf.len() {
            return Err(ResolveError::Malformed("truncated answer header".into()));
        }
        let rr_type = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let rd_len = u16::from_be_bytes([buf[pos + 8], buf[pos + 9]]) as usize;
        pos += 10;
        if pos + rd_len > buf.len() {
            return Err(ResolveError::Malformed("truncated answer rdata".into()));
        }
        let rdata = &buf[pos..pos + rd_len];

        match rr_type {
            TYPE_A if rd_len == 4 => {
                result
                    .a
                    .push(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string());
            }
            TYPE_AAAA if rd_len == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                result.aaaa.push(Ipv6Addr::from(octets).to_string());
            }
            TYPE_CNAME => {
                let (name, _) = read_name(buf, pos)?;
                result.cname.push(name);
            }
            TYPE_NS => {
                let (name, _) = read_name(buf, pos)?;
                result.ns.push(name);
            }
            TYPE_MX if rd_len >= 2 => {
                let pref = u16::from_be_bytes([rdata[0], rdata[1]]);
                let (name, _) = read_name(buf, pos + 2)?;
                result.mx.push(format!("{} {}", pref, name));
            }
            TYPE_TXT => {
                let mut i = 0;
                while i < rdata.len() {
                    let len = rdata[i] as usize;
                    i += 1;
                    if i + len > rdata.len() {
                        break;
                    }
                    result
                        .txt
                        .push(String::from_utf8_lossy(&rdata[i..i + len]).into_owned());
                    i += len;
                }
            }
            _ => {}
        }
        pos += rd_len;
    }

    Ok(result)
}

/// Decode a possibly-compressed domain name at `pos`.
///
/// Returns the dotted name and the position just past the name in the
/// original (uncompressed) stream.
fn read_name(buf: &[u8], mut pos: usize) -> Result<(String, usize), ResolveError> {
    let mut labels = Vec::new();
    let mut jumped = false;
    let mut end = pos;
    let mut hops = 0;

    loop {
        if pos >= buf.len() {
            return Err(ResolveError::Malformed("name runs past buffer".into()));
        }
        let len = buf[pos];
        if len & 0xC0 == 0xC0 {
            // compression pointer
            if pos + 1 >= buf.len() {
                return Err(ResolveError::Malformed("truncated name pointer".into()));
            }
            if !jumped {
                end = pos + 2;
                jumped = true;
            }
            pos = (((len & 0x3F) as usize) << 8) | buf[pos + 1] as usize;
            hops += 1;
            if hops > 16 {
                return Err(ResolveError::Malformed("name pointer loop".into()));
            }
        } else if len == 0 {
            if !jumped {
                end = pos + 1;
            }
            break;
        } else {
            let start = pos + 1;
            let stop = start + len as usize;
            if stop > buf.len() {
                return Err(ResolveError::Malformed("truncated name label".into()));
            }
            labels.push(String::from_utf8_lossy(&buf[start..stop]).into_owned());
            pos = stop;
        }
    }

    let mut name = labels.join(".");
    if !name.is_empty() {
        name.push('.');
    }
    Ok((name, end))
}

// --- DoH JSON ---

#[derive(Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    rr_type: u16,
    data: String,
}

#[derive(Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

fn parse_doh_response(body: &[u8]) -> Result<QueryResult, ResolveError> {
    let parsed: DohResponse =
        serde_json::from_slice(body).map_err(|e| ResolveError::Doh(e.to_string()))?;

    let mut result = QueryResult::default();
    for answer in parsed.answer {
        match answer.rr_type {
            TYPE_A => result.a.push(answer.data),
            TYPE_AAAA => result.aaaa.push(answer.data),
            TYPE_CNAME => result.cname.push(answer.data),
            _ => {}
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_query_shape() {
        let packet = encode_query("example.com").unwrap();
        // header + "example" + "com" + root + type/class
        assert_eq!(packet.len(), 12 + 8 + 4 + 1 + 4);
        assert_eq!(packet[2], 0x01); // RD set
        assert_eq!(&packet[12..20], &[7, b'e', b'x', b'a', b'm', b'p', b'l', b'e']);
        assert!(encode_query("").is_err());
    }

    #[test]
    fn parse_response_a_record() {
        let query = encode_query("example.org").unwrap();
        let tx_id = u16::from_be_bytes([query[0], query[1]]);

        // Echo the question back with one A answer using a name pointer.
        let mut response = query.clone();
        response[2] = 0x81; // QR + RD
        response[3] = 0x80; // RA, rcode 0
        response[7] = 1; // ANCOUNT
        response.extend_from_slice(&[0xC0, 0x0C]); // pointer to the question name
        response.extend_from_slice(&TYPE_A.to_be_bytes());
        response.extend_from_slice(&1u16.to_be_bytes());
        response.extend_from_slice(&300u32.to_be_bytes());
        response.extend_from_slice(&4u16.to_be_bytes());
        response.extend_from_slice(&[93, 184, 216, 34]);

        let result = parse_response(tx_id, &response).unwrap();
        assert_eq!(result.a, vec!["93.184.216.34"]);
        assert!(result.has_address());
    }

    #[test]
    fn parse_response_rejects_mismatched_id() {
        let query = encode_query("example.org").unwrap();
        let tx_id = u16::from_be_bytes([query[0], query[1]]);
        let mut response = query;
        response[0] ^= 0xFF;
        assert!(matches!(
            parse_response(tx_id, &response),
            Err(ResolveError::Malformed(_))
        ));
    }

    #[test]
    fn parse_response_surfaces_rcode() {
        let query = encode_query("example.org").unwrap();
        let tx_id = u16::from_be_bytes([query[0], query[1]]);
        let mut response = query;
        response[3] = 0x03; // NXDOMAIN
        assert!(matches!(
            parse_response(tx_id, &response),
            Err(ResolveError::Server(3))
        ));
    }

    #[test]
    fn doh_response_decodes_by_numeric_type() {
        let body = br#"{"Status":0,"Answer":[
            {"name":"x.example.","type":1,"TTL":60,"data":"1.2.3.4"},
            {"name":"x.example.","type":5,"TTL":60,"data":"x.example."},
            {"name":"x.example.","type":46,"TTL":60,"data":"ignored"}
        ]}"#;
        let result = parse_doh_response(body).unwrap();
        assert_eq!(result.a, vec!["1.2.3.4"]);
        assert_eq!(result.cname, vec!["x.example."]);
        assert!(result.aaaa.is_empty());
    }

    #[test]
    fn split_host_port_defaults() {
        assert_eq!(split_host_port("1.1.1.1", 853), ("1.1.1.1".to_string(), 853));
        assert_eq!(split_host_port("1.1.1.1:53", 853), ("1.1.1.1".to_string(), 53));
        assert_eq!(ensure_port("8.8.8.8", 53), "8.8.8.8:53");
    }

    #[test]
    fn transport_from_str() {
        assert_eq!("".parse::<Transport>().unwrap(), Transport::Udp);
        assert_eq!("dot".parse::<Transport>().unwrap(), Transport::Dot);
        assert!("quic".parse::<Transport>().is_err());
    }
}
