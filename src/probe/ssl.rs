//! SSL/TLS certificate probe.
//!
//! Dials the target with certificate verification enabled, reads the
//! presented chain and classifies the leaf by days until expiry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::db::{CheckStatus, Target};
use crate::resolver::split_host_port;

use super::{CheckResult, Checker, ErrorKind, RequestDetails, ResponseDetails};

const TLS_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// One parsed certificate of a presented chain, leaf first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertRecord {
    pub index: usize,
    pub subject_cn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_org: Option<String>,
    pub issuer_cn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer_org: Option<String>,
    /// Uppercase hex, no separators.
    pub serial: String,
    pub not_before: String,
    pub not_after: String,
    pub days_until_expiry: i64,
    pub is_ca: bool,
    pub signature_algorithm: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_names: Option<Vec<String>>,
}

pub struct SslChecker;

#[async_trait]
impl Checker for SslChecker {
    async fn check(&self, target: &Target) -> CheckResult {
        let start = Instant::now();
        let (host, port) = parse_endpoint(target);
        let address = format!("{}:{}", host, port);

        tracing::debug!(
            target = %target.name,
            original = %target.address,
            %address,
            "SSL check address parsed"
        );

        let certs = match fetch_peer_chain(&host, port).await {
            Ok(c) => c,
            Err(message) => {
                tracing::warn!(target = %target.name, %address, %message, "SSL/TLS connection failed");
                let mut result = CheckResult::failed(
                    ErrorKind::SslError,
                    format!("SSL/TLS connection failed: {}", message),
                    start.elapsed().as_millis() as i64,
                );
                result.request = RequestDetails {
                    method: "SSL".to_string(),
                    url: address,
                    ..Default::default()
                };
                return result;
            }
        };

        if certs.is_empty() {
            let mut result = CheckResult::failed(
                ErrorKind::SslError,
                "No certificates presented",
                start.elapsed().as_millis() as i64,
            );
            result.request = RequestDetails {
                method: "SSL".to_string(),
                url: address,
                ..Default::default()
            };
            return result;
        }

        let now = Utc::now();
        let chain = chain_records(&certs, now);
        let leaf = match chain.first() {
            Some(leaf) => leaf,
            None => {
                let mut result = CheckResult::failed(
                    ErrorKind::SslError,
                    "Failed to parse presented certificates",
                    start.elapsed().as_millis() as i64,
                );
                result.request = RequestDetails {
                    method: "SSL".to_string(),
                    url: address,
                    ..Default::default()
                };
                return result;
            }
        };
        let days = leaf.days_until_expiry;

        let (status, headline) = if days < 0 {
            (
                CheckStatus::Down,
                format!("Certificate expired {} days ago", -days),
            )
        } else if days <= target.ssl.critical_days {
            (
                CheckStatus::Critical,
                format!("Certificate expires in {} days (CRITICAL)", days),
            )
        } else if days <= target.ssl.warn_days {
            (
                CheckStatus::Warning,
                format!("Certificate expires in {} days (WARNING)", days),
            )
        } else {
            (
                CheckStatus::Up,
                format!("Certificate expires in {} days", days),
            )
        };

        let chain_summary = summarize_chain(&chain);
        let message = [
            headline,
            format!("Issuer: {}", leaf.issuer_cn),
            format!("Subject: {}", leaf.subject_cn),
            format!("Serial: {}", leaf.serial),
            format!("Valid from: {}", leaf.not_before),
            format!("Expires: {}", leaf.not_after),
            chain_summary.clone(),
        ]
        .join("\n");

        let mut headers = std::collections::BTreeMap::new();
        headers.insert("issuer".to_string(), leaf.issuer_cn.clone());
        headers.insert("subject".to_string(), leaf.subject_cn.clone());
        headers.insert("serial".to_string(), leaf.serial.clone());
        headers.insert("not_before".to_string(), leaf.not_before.clone());
        headers.insert("not_after".to_string(), leaf.not_after.clone());
        headers.insert("days_until_expiry".to_string(), days.to_string());
        headers.insert("chain_count".to_string(), chain.len().to_string());
        headers.insert("chain_summary".to_string(), chain_summary);

        let mut data = serde_json::Map::new();
        if target.ssl.get_chain {
            if let Ok(value) = serde_json::to_value(&chain) {
                data.insert("certificate_chain".to_string(), value);
            }
        }

        tracing::info!(
            target = %target.name,
            %host,
            days_until_expiry = days,
            chain_length = chain.len(),
            status = %status,
            "SSL check completed"
        );

        CheckResult {
            status,
            response_time_ms: start.elapsed().as_millis() as i64,
            message,
            request: RequestDetails {
                method: "SSL".to_string(),
                url: address,
                ..Default::default()
            },
            response: ResponseDetails {
                headers,
                ..Default::default()
            },
            error: None,
            data,
        }
    }
}

/// Strip scheme and path from the address; default port 443.
fn parse_endpoint(target: &Target) -> (String, u16) {
    let mut host = target.address.as_str();
    for prefix in ["https://", "http://", "ssl://"] {
        host = host.strip_prefix(prefix).unwrap_or(host);
    }
    if let Some(idx) = host.find('/') {
        host = &host[..idx];
    }

    let default_port = if target.port != 0 { target.port } else { 443 };
    split_host_port(host, default_port)
}

/// TLS-dial with verification enabled and return the peer chain.
async fn fetch_peer_chain(
    host: &str,
    port: u16,
) -> Result<Vec<CertificateDer<'static>>, String> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.into(),
    };
    let config = Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    );
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| format!("invalid server name: {}", host))?;

    let dial = async {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| e.to_string())?;
        let connector = TlsConnector::from(config);
        connector
            .connect(server_name, stream)
            .await
            .map_err(|e| e.to_string())
    };

    let tls = tokio::time::timeout(TLS_DIAL_TIMEOUT, dial)
        .await
        .map_err(|_| "handshake timed out".to_string())??;

    let (_, conn) = tls.get_ref();
    Ok(conn
        .peer_certificates()
        .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
        .unwrap_or_default())
}

/// Parse every certificate of the chain into a record, leaf first.
fn chain_records(certs: &[CertificateDer<'_>], now: DateTime<Utc>) -> Vec<CertRecord> {
    certs
        .iter()
        .enumerate()
        .filter_map(|(index, der)| {
            let (_, cert) = X509Certificate::from_der(der.as_ref()).ok()?;
            Some(cert_record(index, &cert, now))
        })
        .collect()
}

fn cert_record(index: usize, cert: &X509Certificate<'_>, now: DateTime<Utc>) -> CertRecord {
    let not_before = asn1_to_utc(cert.validity().not_before.timestamp());
    let not_after = asn1_to_utc(cert.validity().not_after.timestamp());
    let days_until_expiry = days_until(cert.validity().not_after.timestamp(), now.timestamp());

    let dns_names = cert
        .subject_alternative_name()
        .ok()
        .flatten()
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect::<Vec<_>>()
        })
        .filter(|names: &Vec<String>| !names.is_empty());

    CertRecord {
        index,
        subject_cn: first_cn(cert.subject()),
        subject_org: first_org(cert.subject()),
        issuer_cn: first_cn(cert.issuer()),
        issuer_org: first_org(cert.issuer()),
        serial: hex_serial(cert.raw_serial()),
        not_before: not_before.to_rfc3339(),
        not_after: not_after.to_rfc3339(),
        days_until_expiry,
        is_ca: cert.is_ca(),
        signature_algorithm: sig_alg_name(&cert.signature_algorithm.algorithm.to_id_string()),
        dns_names,
    }
}

/// Floor division: a certificate expired by any amount counts as negative.
fn days_until(not_after: i64, now: i64) -> i64 {
    (not_after - now).div_euclid(86_400)
}

fn asn1_to_utc(timestamp: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn first_cn(name: &x509_parser::x509::X509Name<'_>) -> String {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn first_org(name: &x509_parser::x509::X509Name<'_>) -> Option<String> {
    name.iter_organization()
        .next()
        .and_then(|org| org.as_str().ok())
        .map(|org| org.to_string())
}

fn hex_serial(raw: &[u8]) -> String {
    if raw.is_empty() {
        return "unknown".to_string();
    }
    raw.iter().map(|b| format!("{:02X}", b)).collect()
}

fn sig_alg_name(oid: &str) -> String {
    match oid {
        "1.2.840.113549.1.1.5" => "SHA1-RSA".to_string(),
        "1.2.840.113549.1.1.11" => "SHA256-RSA".to_string(),
        "1.2.840.113549.1.1.12" => "SHA384-RSA".to_string(),
        "1.2.840.113549.1.1.13" => "SHA512-RSA".to_string(),
        "1.2.840.10045.4.3.2" => "ECDSA-SHA256".to_string(),
        "1.2.840.10045.4.3.3" => "ECDSA-SHA384".to_string(),
        "1.2.840.10045.4.3.4" => "ECDSA-SHA512".to_string(),
        "1.3.101.112" => "Ed25519".to_string(),
        other => other.to_string(),
    }
}

/// "Certificate chain contains N certificates: 1.CN (leaf) -> ..."
fn summarize_chain(chain: &[CertRecord]) -> String {
    let mut summary = format!("Certificate chain contains {} certificates", chain.len());
    if chain.is_empty() {
        return summary;
    }
    summary.push_str(": ");
    let roles: Vec<String> = chain
        .iter()
        .map(|cert| {
            let role = if !cert.is_ca {
                "leaf"
            } else if cert.index == chain.len() - 1 {
                "root"
            } else {
                "intermediate"
            };
            format!("{}.{} ({})", cert.index + 1, cert.subject_cn, role)
        })
        .collect();
    summary.push_str(&roles.join(" -> "));
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: usize, cn: &str, is_ca: bool, days: i64) -> CertRecord {
        CertRecord {
            index,
            subject_cn: cn.to_string(),
            subject_org: None,
            issuer_cn: "Test CA".to_string(),
            issuer_org: None,
            serial: "0AFF".to_string(),
            not_before: String::new(),
            not_after: String::new(),
            days_until_expiry: days,
            is_ca,
            signature_algorithm: "SHA256-RSA".to_string(),
            dns_names: None,
        }
    }

    #[test]
    fn endpoint_parsing_strips_scheme_and_path() {
        let target = Target {
            address: "https://www.example.com/health".to_string(),
            ..Default::default()
        };
        assert_eq!(parse_endpoint(&target), ("www.example.com".to_string(), 443));

        let target = Target {
            address: "example.com:8443".to_string(),
            ..Default::default()
        };
        assert_eq!(parse_endpoint(&target), ("example.com".to_string(), 8443));

        let target = Target {
            address: "example.com".to_string(),
            port: 993,
            ..Default::default()
        };
        assert_eq!(parse_endpoint(&target), ("example.com".to_string(), 993));
    }

    #[test]
    fn chain_summary_names_roles() {
        let chain = vec![
            record(0, "www.example.com", false, 90),
            record(1, "Intermediate R3", true, 400),
            record(2, "Root X1", true, 3000),
        ];
        let summary = summarize_chain(&chain);
        assert!(summary.starts_with("Certificate chain contains 3 certificates"));
        assert!(summary.contains("1.www.example.com (leaf)"));
        assert!(summary.contains("2.Intermediate R3 (intermediate)"));
        assert!(summary.contains("3.Root X1 (root)"));
    }

    #[test]
    fn days_until_floors_toward_expiry() {
        let now = 1_700_000_000;
        // expired one second ago is already a negative day
        assert_eq!(days_until(now - 1, now), -1);
        assert_eq!(days_until(now - 86_400, now), -1);
        assert_eq!(days_until(now - 86_401, now), -2);
        // not yet a full day in the future stays at zero
        assert_eq!(days_until(now + 1, now), 0);
        assert_eq!(days_until(now + 86_400, now), 1);
    }

    #[test]
    fn serial_formats_uppercase_hex() {
        assert_eq!(hex_serial(&[0x0A, 0xFF, 0x00]), "0AFF00");
        assert_eq!(hex_serial(&[]), "unknown");
    }

    #[test]
    fn signature_algorithm_names() {
        assert_eq!(sig_alg_name("1.2.840.113549.1.1.11"), "SHA256-RSA");
        assert_eq!(sig_alg_name("1.3.101.112"), "Ed25519");
        assert_eq!(sig_alg_name("9.9.9"), "9.9.9");
    }
}
