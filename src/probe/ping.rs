//! ICMP ping probe with native sockets and a ping(8) fallback.
//!
//! The native path uses blocking socket2 sockets inside spawn_blocking for
//! precise timing; unprivileged environments without ICMP socket access fall
//! back to the system ping command.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use crate::db::{CheckStatus, Target};

use super::{CheckResult, Checker, ErrorKind};

/// ICMP capability state, detected once per process.
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW or root; DGRAM works unprivileged on Linux with
    // ping_group_range set, and on macOS.
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("ping probe: using native ICMP (RAW socket)");
        return IcmpCapability::Native;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }
    tracing::info!("ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Aggregate outcome of a multi-packet ping round.
#[derive(Debug, Clone, Copy)]
struct PingStats {
    sent: u32,
    received: u32,
    /// Average RTT over received packets.
    avg: Duration,
}

impl PingStats {
    /// Loss percentage, rounded up.
    fn packet_loss(&self) -> u32 {
        if self.sent == 0 {
            return 100;
        }
        ((self.sent - self.received) * 100).div_ceil(self.sent)
    }
}

pub struct PingChecker;

#[async_trait]
impl Checker for PingChecker {
    async fn check(&self, target: &Target) -> CheckResult {
        let count = if target.ping.count == 0 { 4 } else { target.ping.count };
        let size = if target.ping.size == 0 { 32 } else { target.ping.size };
        let timeout = if target.ping.timeout_ms == 0 {
            Duration::from_secs(5)
        } else {
            Duration::from_millis(target.ping.timeout_ms)
        };

        let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

        let stats = if capability == IcmpCapability::Native {
            match run_native_ping(&target.address, count, size, timeout).await {
                Ok(stats) => Ok(stats),
                Err(e) if e.contains("ermission") || e.contains("denied") => {
                    tracing::warn!(
                        address = %target.address,
                        error = %e,
                        "native ping denied, falling back to command"
                    );
                    run_ping_command(&target.address, count, size, timeout).await
                }
                Err(e) => Err(e),
            }
        } else {
            run_ping_command(&target.address, count, size, timeout).await
        };

        let stats = match stats {
            Ok(stats) => stats,
            Err(message) => {
                return CheckResult::failed(ErrorKind::NetworkError, format!("Ping failed: {}", message), 0)
            }
        };

        let loss = stats.packet_loss();
        let avg_ms = stats.avg.as_millis() as i64;

        let (status, message) = if loss == 100 {
            (CheckStatus::Down, "Ping failed - 100% packet loss".to_string())
        } else if loss >= 50 {
            (
                CheckStatus::Degraded,
                format!("Ping degraded - Packet loss: {}%, Avg time: {}ms", loss, avg_ms),
            )
        } else {
            (
                CheckStatus::Up,
                format!("Ping successful - Packet loss: {}%, Avg time: {}ms", loss, avg_ms),
            )
        };

        let mut data = serde_json::Map::new();
        data.insert("packet_loss".to_string(), loss.into());
        data.insert("avg_time_ms".to_string(), avg_ms.into());
        data.insert("packets_sent".to_string(), stats.sent.into());
        data.insert("packets_received".to_string(), stats.received.into());

        let mut result = CheckResult {
            status,
            response_time_ms: avg_ms,
            message,
            data,
            ..Default::default()
        };
        if status == CheckStatus::Down {
            result.error = Some(super::ErrorDetails {
                kind: ErrorKind::NetworkError,
                message: "100% packet loss".to_string(),
            });
        }
        result
    }
}

/// Resolve and ping natively, one echo request at a time.
async fn run_native_ping(
    address: &str,
    count: u32,
    size: usize,
    timeout: Duration,
) -> Result<PingStats, String> {
    let ip = resolve_address(address).await?;

    tokio::task::spawn_blocking(move || {
        let mut received = 0u32;
        let mut total = Duration::ZERO;

        for _ in 0..count {
            match ping_once(ip, size, timeout) {
                Ok(rtt) => {
                    received += 1;
                    total += rtt;
                }
                Err(PingError::Timeout) => {}
                Err(PingError::Fatal(e)) => return Err(e),
            }
        }

        let avg = if received > 0 {
            total / received
        } else {
            Duration::ZERO
        };
        Ok(PingStats {
            sent: count,
            received,
            avg,
        })
    })
    .await
    .map_err(|e| format!("ping task failed: {}", e))?
}

async fn resolve_address(address: &str) -> Result<IpAddr, String> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }
    let addrs: Vec<_> = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| format!("DNS resolution failed: {}", e))?
        .collect();
    addrs
        .into_iter()
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| format!("no addresses found for {}", address))
}

enum PingError {
    Timeout,
    Fatal(String),
}

/// Send one echo request and wait for the matching reply.
fn ping_once(ip: IpAddr, size: usize, timeout: Duration) -> Result<Duration, PingError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| PingError::Fatal(format!("failed to create ICMP socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .and_then(|_| socket.set_write_timeout(Some(timeout)))
        .map_err(|e| PingError::Fatal(format!("failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| PingError::Fatal(format!("failed to connect: {}", e)))?;

    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_echo_request(ip.is_ipv6(), identifier, sequence, size);

    let start = Instant::now();
    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            PingError::Fatal(format!("permission denied: {}", e))
        } else {
            PingError::Fatal(format!("failed to send: {}", e))
        }
    })?;

    // Read until our reply shows up or the timeout hits. Other traffic on
    // the socket (replies to concurrent pings) is skipped.
    loop {
        let mut buf: [MaybeUninit<u8>; 1500] = [MaybeUninit::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut
            {
                PingError::Timeout
            } else {
                PingError::Fatal(format!("failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(PingError::Timeout);
        }

        if is_matching_reply(ip.is_ipv6(), buf, identifier, sequence) {
            return Ok(elapsed);
        }
    }
}

/// Echo request packet: 8-byte ICMP header + `size` payload bytes.
fn build_echo_request(ipv6: bool, identifier: u16, sequence: u16, size: usize) -> Vec<u8> {
    let mut packet = vec![0u8; 8 + size.max(8)];

    packet[0] = if ipv6 { 128 } else { 8 };
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    // ICMPv6 checksums are filled in by the kernel.
    if !ipv6 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

fn is_matching_reply(ipv6: bool, buf: &[u8], identifier: u16, sequence: u16) -> bool {
    if buf.len() < 8 {
        return false;
    }
    // RAW IPv4 sockets deliver the IP header; DGRAM sockets start at ICMP.
    let offset = if !ipv6 && buf[0] >> 4 == 4 { 20 } else { 0 };
    if buf.len() < offset + 8 {
        return false;
    }
    let reply_type = buf[offset];
    let reply_id = u16::from_be_bytes([buf[offset + 4], buf[offset + 5]]);
    let reply_seq = u16::from_be_bytes([buf[offset + 6], buf[offset + 7]]);

    let echo_reply = if ipv6 { 129 } else { 0 };
    reply_type == echo_reply && reply_id == identifier && reply_seq == sequence
}

/// RFC 1071 checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i + 1 < data.len() {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// ping(8) fallback for environments without ICMP socket access.
async fn run_ping_command(
    address: &str,
    count: u32,
    size: usize,
    timeout: Duration,
) -> Result<PingStats, String> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args([
            "-c",
            &count.to_string(),
            "-s",
            &size.to_string(),
            "-W",
            &timeout_secs.to_string(),
            address,
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| format!("failed to execute ping: {}", e))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() && !stdout.contains("packets transmitted") {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("ping command failed: {}", stderr.trim()));
    }

    parse_ping_output(&stdout, count)
}

/// Parse the transmitted/received summary and average RTT out of ping output.
fn parse_ping_output(output: &str, sent_fallback: u32) -> Result<PingStats, String> {
    static STATS_RE: OnceLock<Regex> = OnceLock::new();
    let stats_re = STATS_RE.get_or_init(|| {
        Regex::new(r"(?P<sent>\d+) packets transmitted, (?P<recv>\d+)(?: packets)? received").unwrap()
    });

    static RTT_RE: OnceLock<Regex> = OnceLock::new();
    let rtt_re = RTT_RE.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip) min/avg/max/(?:mdev|stddev) = [0-9.]+/(?P<avg>[0-9.]+)/")
            .unwrap()
    });

    let (sent, received) = match stats_re.captures(output) {
        Some(caps) => {
            let sent = caps["sent"].parse::<u32>().unwrap_or(sent_fallback);
            let received = caps["recv"].parse::<u32>().unwrap_or(0);
            (sent, received)
        }
        None => return Err(format!("failed to parse ping output: {}", output.trim())),
    };

    let avg = rtt_re
        .captures(output)
        .and_then(|caps| caps["avg"].parse::<f64>().ok())
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
        .unwrap_or(Duration::ZERO);

    Ok(PingStats {
        sent,
        received,
        avg,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable() {
        let mut packet = vec![0u8; 8];
        packet[0] = 8;
        packet[4] = 0x12;
        packet[5] = 0x34;
        packet[7] = 0x01;
        let checksum = icmp_checksum(&packet);
        assert_ne!(checksum, 0);

        // Including the checksum in the sum folds to zero.
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn echo_request_carries_id_seq_and_payload() {
        let packet = build_echo_request(false, 0x1234, 0x0001, 32);
        assert_eq!(packet.len(), 40);
        assert_eq!(packet[0], 8);
        assert_eq!(&packet[4..6], &[0x12, 0x34]);
        assert_eq!(&packet[6..8], &[0x00, 0x01]);

        let v6 = build_echo_request(true, 1, 2, 32);
        assert_eq!(v6[0], 128);
        assert_eq!(&v6[2..4], &[0, 0]); // kernel fills the checksum
    }

    #[test]
    fn reply_matching_skips_foreign_packets() {
        let mut reply = vec![0u8; 8];
        reply[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        reply[6..8].copy_from_slice(&7u16.to_be_bytes());
        assert!(is_matching_reply(false, &reply, 0x1234, 7));
        assert!(!is_matching_reply(false, &reply, 0x1234, 8));
        assert!(!is_matching_reply(false, &reply, 0x4321, 7));

        reply[0] = 129;
        assert!(is_matching_reply(true, &reply, 0x1234, 7));
    }

    #[test]
    fn packet_loss_rounds_up() {
        let stats = PingStats {
            sent: 3,
            received: 2,
            avg: Duration::ZERO,
        };
        assert_eq!(stats.packet_loss(), 34);

        let stats = PingStats {
            sent: 4,
            received: 0,
            avg: Duration::ZERO,
        };
        assert_eq!(stats.packet_loss(), 100);
    }

    #[test]
    fn parse_linux_summary() {
        let output = r#"PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms

--- 8.8.8.8 ping statistics ---
4 packets transmitted, 3 received, 25% packet loss, time 3004ms
rtt min/avg/max/mdev = 11.001/12.302/13.500/0.900 ms"#;
        let stats = parse_ping_output(output, 4).unwrap();
        assert_eq!(stats.sent, 4);
        assert_eq!(stats.received, 3);
        assert_eq!(stats.packet_loss(), 25);
        assert!((stats.avg.as_secs_f64() * 1000.0 - 12.302).abs() < 0.001);
    }

    #[test]
    fn parse_macos_summary() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes

--- google.com ping statistics ---
4 packets transmitted, 4 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/18.120/18.500/0.200 ms"#;
        let stats = parse_ping_output(output, 4).unwrap();
        assert_eq!(stats.sent, 4);
        assert_eq!(stats.received, 4);
        assert_eq!(stats.packet_loss(), 0);
    }

    #[test]
    fn parse_garbage_fails() {
        assert!(parse_ping_output("no ping here", 4).is_err());
    }
}
