//! DNS lookup probe.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::{CheckStatus, Target};
use crate::resolver::{QueryResult, Resolver, Transport};

use super::{CheckResult, Checker, ErrorKind, RequestDetails, ResponseDetails};

/// One record group in the stored response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRecordInfo {
    #[serde(rename = "type")]
    pub record_type: String,
    pub value: Vec<String>,
}

pub struct DnsChecker;

#[async_trait]
impl Checker for DnsChecker {
    async fn check(&self, target: &Target) -> CheckResult {
        let start = Instant::now();

        let (server, server_type) = if target.dns.server.is_empty() {
            ("8.8.8.8:53".to_string(), "udp".to_string())
        } else {
            let server_type = if target.dns.server_type.is_empty() {
                "udp".to_string()
            } else {
                target.dns.server_type.clone()
            };
            (target.dns.server.clone(), server_type)
        };

        let transport = match server_type.parse::<Transport>() {
            Ok(t) => t,
            Err(e) => {
                return CheckResult::failed(
                    ErrorKind::ConfigError,
                    e.to_string(),
                    start.elapsed().as_millis() as i64,
                )
            }
        };

        tracing::debug!(
            target = %target.name,
            address = %target.address,
            dns_server = %server,
            dns_server_type = %server_type,
            "DNS lookup starting"
        );

        let resolver = Resolver::new(&server, transport);
        let answer = match resolver.lookup(&target.address).await {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(
                    target = %target.name,
                    address = %target.address,
                    dns_server = %server,
                    error = %e,
                    "DNS lookup failed"
                );
                let mut result = CheckResult::failed(
                    ErrorKind::DnsError,
                    format!("DNS lookup failed: {}", e),
                    start.elapsed().as_millis() as i64,
                );
                result.request = RequestDetails {
                    method: "DNS".to_string(),
                    url: target.address.clone(),
                    ..Default::default()
                };
                return result;
            }
        };

        let records = collect_records(&answer);
        let response_time = start.elapsed().as_millis() as i64;

        let mut message = String::new();
        let mut total_records = 0;
        for record in &records {
            total_records += record.value.len();
            message.push_str(&format!(
                "{}: {} record(s); ",
                record.record_type,
                record.value.len()
            ));
        }
        if !target.dns.server_name.is_empty() {
            message.push_str(&format!("via {} ({}); ", target.dns.server_name, server_type));
        } else {
            message.push_str(&format!("via {} ({}); ", server, server_type));
        }

        let status = if answer.has_address() {
            CheckStatus::Up
        } else {
            CheckStatus::Warning
        };

        tracing::info!(
            target = %target.name,
            address = %target.address,
            dns_server = %server,
            total_records,
            response_time,
            status = %status,
            "DNS lookup completed"
        );

        let mut headers = std::collections::BTreeMap::new();
        headers.insert("dns_server".to_string(), server);
        headers.insert("dns_server_name".to_string(), target.dns.server_name.clone());
        headers.insert("dns_server_type".to_string(), server_type);
        headers.insert("a_count".to_string(), answer.a.len().to_string());
        headers.insert("aaaa_count".to_string(), answer.aaaa.len().to_string());
        headers.insert("total_types".to_string(), records.len().to_string());

        CheckResult {
            status,
            response_time_ms: response_time,
            message,
            request: RequestDetails {
                method: "DNS".to_string(),
                url: target.address.clone(),
                ..Default::default()
            },
            response: ResponseDetails {
                headers,
                body: serde_json::to_string(&records).unwrap_or_default(),
                ..Default::default()
            },
            error: None,
            data: serde_json::Map::new(),
        }
    }
}

/// Group non-empty record sets, address records first.
fn collect_records(answer: &QueryResult) -> Vec<DnsRecordInfo> {
    let groups = [
        ("A", &answer.a),
        ("AAAA", &answer.aaaa),
        ("CNAME", &answer.cname),
        ("MX", &answer.mx),
        ("TXT", &answer.txt),
        ("NS", &answer.ns),
    ];
    groups
        .into_iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(record_type, values)| DnsRecordInfo {
            record_type: record_type.to_string(),
            value: values.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_group_by_type_in_order() {
        let answer = QueryResult {
            a: vec!["93.184.216.34".to_string()],
            cname: vec!["alias.example.".to_string()],
            ..Default::default()
        };
        let records = collect_records(&answer);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_type, "A");
        assert_eq!(records[0].value, vec!["93.184.216.34"]);
        assert_eq!(records[1].record_type, "CNAME");

        let json = serde_json::to_string(&records).unwrap();
        assert!(json.contains(r#""type":"A""#));
        assert!(json.contains(r#""value":["93.184.216.34"]"#));
    }

    #[test]
    fn empty_answer_has_no_groups() {
        assert!(collect_records(&QueryResult::default()).is_empty());
    }
}
