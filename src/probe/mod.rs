//! Probe library for network monitoring.
//!
//! One checker per protocol: HTTP, HTTPS, TCP, UDP, DNS, Ping, SMTP, SNMP
//! and SSL. Every checker produces a uniform [`CheckResult`]; I/O failures
//! are encoded in the result, never panicked or propagated.

mod dns;
mod http;
pub(crate) mod http_client;
mod https;
mod ping;
mod smtp;
mod snmp;
mod ssl;
mod tcp;
mod udp;

pub use dns::DnsChecker;
pub use http::HttpChecker;
pub use http_client::shared_client;
pub use https::HttpsChecker;
pub use ping::PingChecker;
pub use smtp::{SmtpChecker, SmtpError};
pub(crate) use smtp::SmtpSession;
pub use snmp::SnmpChecker;
pub use ssl::SslChecker;
pub use tcp::TcpChecker;
pub use udp::UdpChecker;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::{CheckStatus, Target, TargetKind};

/// Error classification carried on failed check results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigError,
    NetworkError,
    DnsError,
    SslError,
    ProtocolError,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigError => "config_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::DnsError => "dns_error",
            ErrorKind::SslError => "ssl_error",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::Timeout => "timeout",
        }
    }
}

/// Error detail attached to a failed check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
}

/// What the probe sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestDetails {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
}

/// What the probe got back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseDetails {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub content_length: i64,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

/// Uniform output of every probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub response_time_ms: i64,
    pub message: String,
    #[serde(default)]
    pub request: RequestDetails,
    #[serde(default)]
    pub response: ResponseDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    /// Protocol-specific extras: certificate chains, DNS records, ping stats.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl CheckResult {
    /// A failed result with the given classification and message.
    pub fn failed(kind: ErrorKind, message: impl Into<String>, response_time_ms: i64) -> Self {
        let message = message.into();
        Self {
            status: CheckStatus::Down,
            response_time_ms,
            error: Some(ErrorDetails {
                kind,
                message: message.clone(),
            }),
            message,
            ..Default::default()
        }
    }
}

/// One-shot protocol check. Implementations are stateless.
#[async_trait]
pub trait Checker: Send + Sync {
    async fn check(&self, target: &Target) -> CheckResult;
}

/// Resolve a checker for the given target kind.
pub fn new_checker(kind: TargetKind) -> Box<dyn Checker> {
    match kind {
        TargetKind::Http => Box::new(HttpChecker),
        TargetKind::Https => Box::new(HttpsChecker),
        TargetKind::Tcp => Box::new(TcpChecker),
        TargetKind::Udp => Box::new(UdpChecker),
        TargetKind::Dns => Box::new(DnsChecker),
        TargetKind::Ping => Box::new(PingChecker),
        TargetKind::Smtp => Box::new(SmtpChecker),
        TargetKind::Snmp => Box::new(SnmpChecker),
        TargetKind::Ssl => Box::new(SslChecker),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_result_sets_status_and_error() {
        let result = CheckResult::failed(ErrorKind::NetworkError, "connection refused", 12);
        assert_eq!(result.status, CheckStatus::Down);
        assert_eq!(result.response_time_ms, 12);
        let err = result.error.unwrap();
        assert_eq!(err.kind, ErrorKind::NetworkError);
        assert_eq!(err.message, "connection refused");
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::SslError).unwrap();
        assert_eq!(json, "\"ssl_error\"");
    }
}
