//! Database model types.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol kind of a monitoring target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Http,
    Https,
    Tcp,
    Udp,
    Dns,
    Ping,
    Smtp,
    Snmp,
    Ssl,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Http => "http",
            TargetKind::Https => "https",
            TargetKind::Tcp => "tcp",
            TargetKind::Udp => "udp",
            TargetKind::Dns => "dns",
            TargetKind::Ping => "ping",
            TargetKind::Smtp => "smtp",
            TargetKind::Snmp => "snmp",
            TargetKind::Ssl => "ssl",
        }
    }

    /// Kinds whose results carry a TLS certificate summary.
    pub fn carries_certificate(&self) -> bool {
        matches!(self, TargetKind::Https | TargetKind::Ssl)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(TargetKind::Http),
            "https" => Ok(TargetKind::Https),
            "tcp" => Ok(TargetKind::Tcp),
            "udp" => Ok(TargetKind::Udp),
            "dns" => Ok(TargetKind::Dns),
            "ping" | "icmp" => Ok(TargetKind::Ping),
            "smtp" | "smtps" => Ok(TargetKind::Smtp),
            "snmp" => Ok(TargetKind::Snmp),
            "ssl" | "tls" => Ok(TargetKind::Ssl),
            other => Err(format!("unsupported monitor type: {}", other)),
        }
    }
}

/// Outcome status of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Up,
    Down,
    Degraded,
    Warning,
    Critical,
    #[default]
    Unknown,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Up => "up",
            CheckStatus::Down => "down",
            CheckStatus::Degraded => "degraded",
            CheckStatus::Warning => "warning",
            CheckStatus::Critical => "critical",
            CheckStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(CheckStatus::Up),
            "down" => Ok(CheckStatus::Down),
            "degraded" => Ok(CheckStatus::Degraded),
            "warning" => Ok(CheckStatus::Warning),
            "critical" => Ok(CheckStatus::Critical),
            "unknown" => Ok(CheckStatus::Unknown),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// HTTP/HTTPS probe options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpOptions {
    /// GET, POST, PUT, DELETE, etc. Empty means GET.
    pub method: String,
    /// Custom headers, applied in order before defaults are filled in.
    pub headers: Vec<(String, String)>,
    pub body: String,
    /// Custom Host header value.
    pub resolved_host: String,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    /// Empty means the 2xx range is acceptable.
    pub expected_status_codes: Vec<u16>,
    /// Custom DNS server used to resolve the request host (e.g. 8.8.8.8:53).
    pub dns_server: String,
    pub dns_server_type: String,
    /// Pre-resolved IP overriding DNS entirely.
    pub resolved_ip: String,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            method: String::new(),
            headers: Vec::new(),
            body: String::new(),
            resolved_host: String::new(),
            follow_redirects: true,
            max_redirects: 10,
            expected_status_codes: Vec::new(),
            dns_server: String::new(),
            dns_server_type: String::new(),
            resolved_ip: String::new(),
        }
    }
}

/// DNS probe options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsOptions {
    /// DNS server address (e.g. 8.8.8.8:53 or https://dns.google/resolve).
    pub server: String,
    /// udp, tcp, doh or dot.
    pub server_type: String,
    /// Display name for the server (e.g. "Google DNS").
    pub server_name: String,
}

/// Ping probe options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PingOptions {
    pub count: u32,
    /// Payload size in bytes.
    pub size: usize,
    /// Per-packet timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for PingOptions {
    fn default() -> Self {
        Self {
            count: 4,
            size: 32,
            timeout_ms: 5000,
        }
    }
}

/// SMTP probe options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpOptions {
    pub username: String,
    pub password: String,
    /// Implicit TLS (e.g. port 465).
    pub use_tls: bool,
    pub mail_from: String,
    pub mail_to: String,
    pub check_starttls: bool,
}

impl Default for SmtpOptions {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            use_tls: false,
            mail_from: String::new(),
            mail_to: String::new(),
            check_starttls: true,
        }
    }
}

/// SNMP probe options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnmpOptions {
    pub community: String,
    pub oid: String,
    /// v1, v2c or v3.
    pub version: String,
    pub expected_value: String,
    /// eq, ne, gt, lt, ge, le.
    pub operator: String,
}

impl Default for SnmpOptions {
    fn default() -> Self {
        Self {
            community: String::new(),
            oid: String::new(),
            version: "v2c".to_string(),
            expected_value: String::new(),
            operator: String::new(),
        }
    }
}

/// SSL/TLS certificate check options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SslOptions {
    pub warn_days: i64,
    pub critical_days: i64,
    pub get_chain: bool,
    /// Enables certificate inspection for HTTPS targets.
    pub check: bool,
}

impl Default for SslOptions {
    fn default() -> Self {
        Self {
            warn_days: 30,
            critical_days: 7,
            get_chain: true,
            check: false,
        }
    }
}

/// A monitoring target configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: u32,
    pub name: String,
    pub kind: TargetKind,
    pub address: String,
    /// 0 means the protocol default.
    pub port: u16,
    /// Check period in seconds.
    pub interval_secs: u64,
    pub enabled: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub http: HttpOptions,
    #[serde(default)]
    pub dns: DnsOptions,
    #[serde(default)]
    pub ping: PingOptions,
    #[serde(default)]
    pub smtp: SmtpOptions,
    #[serde(default)]
    pub snmp: SnmpOptions,
    #[serde(default)]
    pub ssl: SslOptions,
    /// Alert channel ids associated with this target.
    #[serde(default)]
    pub alert_channels: Vec<u32>,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            kind: TargetKind::Http,
            address: String::new(),
            port: 0,
            interval_secs: 60,
            enabled: true,
            metadata: HashMap::new(),
            http: HttpOptions::default(),
            dns: DnsOptions::default(),
            ping: PingOptions::default(),
            smtp: SmtpOptions::default(),
            snmp: SnmpOptions::default(),
            ssl: SslOptions::default(),
            alert_channels: Vec::new(),
        }
    }
}

impl Target {
    /// Admit-time validation. Rejected targets never reach the scheduler.
    pub fn validate(&self) -> Result<(), String> {
        if self.address.is_empty() {
            return Err("address must not be empty".to_string());
        }
        if self.interval_secs < 1 {
            return Err("check interval must be at least 1 second".to_string());
        }
        if self.kind == TargetKind::Snmp
            && !self.snmp.operator.is_empty()
            && self.snmp.expected_value.is_empty()
        {
            return Err("snmp operator requires an expected value".to_string());
        }
        if (self.kind == TargetKind::Https && self.ssl.check) || self.kind == TargetKind::Ssl {
            if self.ssl.critical_days < 0 {
                return Err("ssl critical_days must not be negative".to_string());
            }
            if self.ssl.warn_days < self.ssl.critical_days {
                return Err("ssl warn_days must be >= critical_days".to_string());
            }
        }
        Ok(())
    }
}

/// Latest known state of a target. At most one row per target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CurrentStatus {
    pub target_id: u32,
    pub status: CheckStatus,
    pub response_time_ms: i64,
    pub message: String,
    pub checked_at: DateTime<Utc>,
    /// 0-100 over the trailing 30 days of history.
    pub uptime_percentage: i32,

    // SSL certificate summary (https/ssl targets only)
    pub ssl_days_until_expiry: Option<i64>,
    pub ssl_issuer: Option<String>,
    pub ssl_subject: Option<String>,
    pub ssl_serial: Option<String>,

    pub resolved_ip: Option<String>,
    /// JSON string of DNS records for dns targets.
    pub dns_records: Option<String>,
    /// Opaque check data blob (e.g. certificate chain) as JSON.
    pub data: Option<String>,
}

/// One append-only history row per check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub target_id: u32,
    pub status: CheckStatus,
    pub response_time_ms: i64,
    pub message: String,
    pub checked_at: DateTime<Utc>,
}

/// An outbound notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertChannel {
    pub id: u32,
    pub name: String,
    /// webhook, webhook-signed, messenger or smtp.
    pub kind: String,
    pub enabled: bool,
    /// Channel-specific configuration decoded by the notifier factory.
    pub config: serde_json::Value,
}

/// A rule binding a target to a channel with a firing condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: u32,
    pub target_id: u32,
    pub channel_id: u32,
    /// failure_count or response_time.
    pub threshold_type: String,
    pub threshold_value: i64,
    /// Also fire when the two newest events differ in status.
    pub on_status_change: bool,
    pub enabled: bool,
    pub cooldown_seconds: i64,
    pub last_fired: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trip() {
        for s in ["http", "https", "tcp", "udp", "dns", "ping", "smtp", "snmp", "ssl"] {
            let kind: TargetKind = s.parse().unwrap();
            assert_eq!(kind.as_str(), s);
        }
        assert_eq!("icmp".parse::<TargetKind>().unwrap(), TargetKind::Ping);
        assert_eq!("tls".parse::<TargetKind>().unwrap(), TargetKind::Ssl);
        assert!("gopher".parse::<TargetKind>().is_err());
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let target = Target {
            address: "example.com".to_string(),
            interval_secs: 0,
            ..Default::default()
        };
        assert!(target.validate().is_err());

        let target = Target {
            address: "example.com".to_string(),
            interval_secs: 1,
            ..Default::default()
        };
        assert!(target.validate().is_ok());
    }

    #[test]
    fn validate_snmp_operator_requires_expected() {
        let mut target = Target {
            address: "10.0.0.1".to_string(),
            kind: TargetKind::Snmp,
            ..Default::default()
        };
        target.snmp.operator = "gt".to_string();
        assert!(target.validate().is_err());
        target.snmp.expected_value = "1000".to_string();
        assert!(target.validate().is_ok());
    }

    #[test]
    fn validate_ssl_thresholds() {
        let mut target = Target {
            address: "example.com".to_string(),
            kind: TargetKind::Https,
            ..Default::default()
        };
        target.ssl.check = true;
        target.ssl.warn_days = 5;
        target.ssl.critical_days = 7;
        assert!(target.validate().is_err());
        target.ssl.warn_days = 30;
        assert!(target.validate().is_ok());
    }
}
