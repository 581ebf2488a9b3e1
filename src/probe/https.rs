//! HTTPS probe: HTTP check composed with certificate inspection.

use std::time::Instant;

use async_trait::async_trait;

use crate::db::{CheckStatus, Target};

use super::{CheckResult, Checker, HttpChecker, SslChecker};

pub struct HttpsChecker;

#[async_trait]
impl Checker for HttpsChecker {
    async fn check(&self, target: &Target) -> CheckResult {
        let start = Instant::now();

        // Certificate inspection first, on an independent TLS dial.
        let ssl_result = if target.ssl.check {
            Some(SslChecker.check(target).await)
        } else {
            None
        };

        let mut result = HttpChecker.check(target).await;

        if let Some(ssl) = ssl_result {
            merge_ssl(&mut result, ssl);
        }

        result.response_time_ms = start.elapsed().as_millis() as i64;
        tracing::debug!(
            target = %target.name,
            status = %result.status,
            response_time = result.response_time_ms,
            "HTTPS check completed"
        );
        result
    }
}

/// Lift the leaf certificate summary and chain into the HTTP result.
fn merge_ssl(result: &mut CheckResult, ssl: CheckResult) {
    if let Some(chain) = ssl.data.get("certificate_chain") {
        result
            .data
            .insert("certificate_chain".to_string(), chain.clone());
    }

    for key in ["issuer", "subject", "serial", "days_until_expiry"] {
        if let Some(value) = ssl.response.headers.get(key) {
            result
                .response
                .headers
                .insert(key.to_string(), value.clone());
        }
    }

    if ssl.status == CheckStatus::Down {
        result.status = CheckStatus::Down;
        result.message = format!("{} (SSL: {})", result.message, first_line(&ssl.message));
        // The certificate failure is the authoritative cause, even when the
        // HTTP request over the same endpoint failed too.
        if ssl.error.is_some() {
            result.error = ssl.error;
        }
    } else {
        result.message = format!("{} | SSL: {}", result.message, first_line(&ssl.message));
    }
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ErrorDetails, ErrorKind};

    fn ssl_result(status: CheckStatus, message: &str) -> CheckResult {
        let mut result = CheckResult {
            status,
            message: message.to_string(),
            ..Default::default()
        };
        result
            .response
            .headers
            .insert("issuer".to_string(), "Test CA".to_string());
        result
            .response
            .headers
            .insert("days_until_expiry".to_string(), "42".to_string());
        result.data.insert(
            "certificate_chain".to_string(),
            serde_json::json!([{"index": 0, "subject_cn": "example.com"}]),
        );
        result
    }

    #[test]
    fn merge_lifts_chain_and_summary() {
        let mut http = CheckResult {
            status: CheckStatus::Up,
            message: "HTTP 200 OK".to_string(),
            ..Default::default()
        };
        merge_ssl(&mut http, ssl_result(CheckStatus::Up, "Certificate expires in 42 days"));

        assert_eq!(http.status, CheckStatus::Up);
        assert!(http.data.contains_key("certificate_chain"));
        assert_eq!(http.response.headers.get("issuer").unwrap(), "Test CA");
        assert_eq!(
            http.response.headers.get("days_until_expiry").unwrap(),
            "42"
        );
        assert_eq!(
            http.message,
            "HTTP 200 OK | SSL: Certificate expires in 42 days"
        );
    }

    #[test]
    fn ssl_failure_pulls_overall_status_down() {
        let mut http = CheckResult {
            status: CheckStatus::Up,
            message: "HTTP 200 OK".to_string(),
            ..Default::default()
        };
        let mut ssl = CheckResult {
            status: CheckStatus::Down,
            message: "SSL/TLS connection failed: handshake failure".to_string(),
            ..Default::default()
        };
        ssl.error = Some(ErrorDetails {
            kind: ErrorKind::SslError,
            message: "handshake failure".to_string(),
        });

        merge_ssl(&mut http, ssl);
        assert_eq!(http.status, CheckStatus::Down);
        assert!(http.message.contains("(SSL:"));
        assert_eq!(http.error.unwrap().kind, ErrorKind::SslError);
        assert!(!http.data.contains_key("certificate_chain"));
    }

    #[test]
    fn ssl_error_overrides_http_network_error() {
        // A bad-cert host fails the HTTP request too; the certificate
        // failure still names the cause.
        let mut http = CheckResult::failed(
            ErrorKind::NetworkError,
            "Request failed: certificate verify failed",
            25,
        );
        let mut ssl = CheckResult {
            status: CheckStatus::Down,
            message: "SSL/TLS connection failed: handshake failure".to_string(),
            ..Default::default()
        };
        ssl.error = Some(ErrorDetails {
            kind: ErrorKind::SslError,
            message: "handshake failure".to_string(),
        });

        merge_ssl(&mut http, ssl);
        assert_eq!(http.status, CheckStatus::Down);
        assert_eq!(http.error.unwrap().kind, ErrorKind::SslError);
    }
}
