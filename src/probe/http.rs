//! HTTP probe implementation.

use std::collections::BTreeMap;
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::db::{CheckStatus, Target, TargetKind};
use crate::resolver::{split_host_port, Resolver, Transport};

use super::http_client::shared_client;
use super::{CheckResult, Checker, ErrorKind, RequestDetails, ResponseDetails};

const MAX_STORED_BODY: usize = 100 * 1024;
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub struct HttpChecker;

#[async_trait]
impl Checker for HttpChecker {
    async fn check(&self, target: &Target) -> CheckResult {
        let start = Instant::now();

        let url = build_url(target);
        let method = if target.http.method.is_empty() {
            "GET".to_string()
        } else {
            target.http.method.to_uppercase()
        };

        let headers = match build_headers(target) {
            Ok(h) => h,
            Err(message) => {
                return CheckResult::failed(
                    ErrorKind::ConfigError,
                    message,
                    start.elapsed().as_millis() as i64,
                )
            }
        };
        let request_details = RequestDetails {
            method: method.clone(),
            url: url.clone(),
            headers: headers
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_string(),
                        v.to_str().unwrap_or_default().to_string(),
                    )
                })
                .collect(),
            body: target.http.body.clone(),
        };

        let client = match client_for(target, &url).await {
            Ok(c) => c,
            Err(result) => {
                let mut result = *result;
                result.response_time_ms = start.elapsed().as_millis() as i64;
                result.request = request_details;
                return result;
            }
        };

        let parsed_method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                let mut result = CheckResult::failed(
                    ErrorKind::ConfigError,
                    format!("invalid HTTP method: {}", method),
                    start.elapsed().as_millis() as i64,
                );
                result.request = request_details;
                return result;
            }
        };

        let mut builder = client.request(parsed_method, &url).headers(headers);
        if !target.http.body.is_empty() {
            builder = builder.body(target.http.body.clone());
        }

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(target = %target.name, url = %url, error = %e, "HTTP request failed");
                let kind = if e.is_timeout() {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::NetworkError
                };
                let mut result = CheckResult::failed(
                    kind,
                    format!("Request failed: {}", e),
                    start.elapsed().as_millis() as i64,
                );
                result.request = request_details;
                return result;
            }
        };

        let status_code = response.status().as_u16();
        let reason = response
            .status()
            .canonical_reason()
            .unwrap_or("")
            .to_string();
        let mut response_headers = clone_headers(response.headers());
        let content_length = response.content_length().map(|l| l as i64).unwrap_or(0);
        let content_type = response_headers.get("content-type").cloned();
        let content_encoding = response_headers.get("content-encoding").cloned();

        let body = match response.bytes().await {
            Ok(b) => b.to_vec(),
            Err(e) => {
                tracing::warn!(target = %target.name, error = %e, "failed to read response body");
                format!("Failed to read response body: {}", e).into_bytes()
            }
        };
        let response_time = start.elapsed().as_millis() as i64;

        // The stored body keeps the wire form; decompression is only for
        // title extraction.
        let html_body = if content_encoding
            .as_deref()
            .is_some_and(|enc| enc.contains("gzip"))
        {
            gunzip(&body).unwrap_or_else(|| body.clone())
        } else {
            body.clone()
        };

        let mut stored_body = body;
        if stored_body.len() > MAX_STORED_BODY {
            stored_body.truncate(MAX_STORED_BODY);
            stored_body.extend_from_slice(b"... (truncated)");
        }

        let resolved_ip = lookup_resolved_ip(&url).await;
        response_headers.insert("resolved_ip".to_string(), resolved_ip);

        if content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("text/html"))
        {
            if let Some(title) = extract_title(&html_body) {
                response_headers.insert("title".to_string(), title);
            }
        }

        let status = classify_status(status_code, &target.http.expected_status_codes);

        tracing::debug!(
            target = %target.name,
            status_code,
            response_time,
            "HTTP check completed"
        );

        CheckResult {
            status,
            response_time_ms: response_time,
            message: format!("HTTP {} {}", status_code, reason),
            request: request_details,
            response: ResponseDetails {
                status_code,
                headers: response_headers,
                body: String::from_utf8_lossy(&stored_body).into_owned(),
                content_length,
            },
            error: None,
            data: serde_json::Map::new(),
        }
    }
}

/// Prepend a scheme matching the target kind when the address has none.
fn build_url(target: &Target) -> String {
    let address = &target.address;
    if address.starts_with("http://") || address.starts_with("https://") {
        return address.clone();
    }
    let scheme = if target.kind == TargetKind::Https {
        "https"
    } else {
        "http"
    };
    if target.port != 0 && !address.contains(':') {
        format!("{}://{}:{}", scheme, address, target.port)
    } else {
        format!("{}://{}", scheme, address)
    }
}

/// Custom headers first, then defaults only for keys still absent.
fn build_headers(target: &Target) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();

    for (key, value) in &target.http.headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| format!("invalid header name: {}", key))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| format!("invalid value for header {}", key))?;
        headers.insert(name, value);
    }

    let defaults: [(&str, &str); 5] = [
        ("user-agent", DEFAULT_USER_AGENT),
        ("accept", "*/*"),
        ("accept-encoding", "gzip, deflate, br"),
        ("accept-language", "zh-CN,zh;q=0.9,en;q=0.8"),
        ("connection", "keep-alive"),
    ];
    for (name, value) in defaults {
        let name = HeaderName::from_static(name);
        if !headers.contains_key(&name) {
            headers.insert(name, HeaderValue::from_static(value));
        }
    }

    if !target.http.resolved_host.is_empty() {
        let value = HeaderValue::from_str(&target.http.resolved_host)
            .map_err(|_| format!("invalid host override: {}", target.http.resolved_host))?;
        headers.insert(reqwest::header::HOST, value);
    }

    Ok(headers)
}

/// Pick the shared pooled client, or build a one-off client when the target
/// needs its own redirect policy or resolver.
async fn client_for(target: &Target, url: &str) -> Result<reqwest::Client, Box<CheckResult>> {
    let needs_redirect_policy = !target.http.follow_redirects
        || (target.http.max_redirects > 0 && target.http.max_redirects != 10);
    let needs_resolver = !target.http.dns_server.is_empty() || !target.http.resolved_ip.is_empty();

    if !needs_redirect_policy && !needs_resolver {
        return Ok(shared_client().clone());
    }

    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30));

    builder = if !target.http.follow_redirects {
        builder.redirect(reqwest::redirect::Policy::none())
    } else if target.http.max_redirects > 0 {
        builder.redirect(reqwest::redirect::Policy::limited(target.http.max_redirects))
    } else {
        builder.redirect(reqwest::redirect::Policy::limited(10))
    };

    if needs_resolver {
        let (host, port) = host_and_port(url);
        let ip = if !target.http.resolved_ip.is_empty() {
            match target.http.resolved_ip.parse::<IpAddr>() {
                Ok(ip) => ip,
                Err(_) => {
                    return Err(Box::new(CheckResult::failed(
                        ErrorKind::ConfigError,
                        format!("invalid resolved ip: {}", target.http.resolved_ip),
                        0,
                    )))
                }
            }
        } else {
            match resolve_via(&target.http.dns_server, &target.http.dns_server_type, &host).await {
                Ok(ip) => ip,
                Err(message) => {
                    tracing::warn!(
                        host = %host,
                        dns_server = %target.http.dns_server,
                        "custom DNS resolution failed"
                    );
                    return Err(Box::new(CheckResult::failed(ErrorKind::DnsError, message, 0)));
                }
            }
        };
        builder = builder.resolve(&host, SocketAddr::new(ip, port));
    }

    builder.build().map_err(|e| {
        Box::new(CheckResult::failed(
            ErrorKind::ConfigError,
            format!("failed to build HTTP client: {}", e),
            0,
        ))
    })
}

/// Resolve `host` through the target's custom DNS server, preferring IPv4.
async fn resolve_via(server: &str, server_type: &str, host: &str) -> Result<IpAddr, String> {
    let transport = server_type.parse::<Transport>().unwrap_or(Transport::Udp);
    let resolver = Resolver::new(server, transport);
    let answer = resolver
        .lookup(host)
        .await
        .map_err(|e| format!("DNS resolution failed: {}", e))?;

    answer
        .a
        .first()
        .or_else(|| answer.aaaa.first())
        .and_then(|ip| ip.parse::<IpAddr>().ok())
        .ok_or_else(|| format!("no addresses found for {}", host))
}

fn host_and_port(url: &str) -> (String, u16) {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or_default().to_string();
            let port = parsed.port_or_known_default().unwrap_or(80);
            (host, port)
        }
        Err(_) => split_host_port(url, 80),
    }
}

/// System DNS lookup of the request host, recorded alongside the response.
/// Prefers the first IPv4, falls back to IPv6, then the hostname itself.
async fn lookup_resolved_ip(url: &str) -> String {
    let (host, _) = host_and_port(url);
    match tokio::net::lookup_host(format!("{}:0", host)).await {
        Ok(addrs) => {
            let addrs: Vec<IpAddr> = addrs.map(|sa| sa.ip()).collect();
            addrs
                .iter()
                .find(|ip| ip.is_ipv4())
                .or_else(|| addrs.first())
                .map(|ip| ip.to_string())
                .unwrap_or(host)
        }
        Err(_) => host,
    }
}

fn clone_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = value.to_str().unwrap_or_default();
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}

fn gunzip(body: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = GzDecoder::new(body);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

/// Extract the first `<title>` of an HTML document and decode the common
/// entities.
fn extract_title(body: &[u8]) -> Option<String> {
    static TITLE_RE: OnceLock<Regex> = OnceLock::new();
    let re = TITLE_RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());

    let text = String::from_utf8_lossy(body);
    let title = re.captures(&text)?.get(1)?.as_str().trim().to_string();
    if title.is_empty() {
        return None;
    }
    Some(
        title
            .replace("&nbsp;", " ")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&amp;", "&"),
    )
}

/// Empty expectation means the 2xx range; otherwise exact membership.
fn classify_status(status_code: u16, expected: &[u16]) -> CheckStatus {
    if expected.is_empty() {
        if (200..300).contains(&status_code) {
            return CheckStatus::Up;
        }
        return CheckStatus::Down;
    }
    if expected.contains(&status_code) {
        CheckStatus::Up
    } else {
        CheckStatus::Down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::HttpOptions;

    #[test]
    fn build_url_adds_scheme_by_kind() {
        let mut target = Target {
            address: "example.com".to_string(),
            ..Default::default()
        };
        assert_eq!(build_url(&target), "http://example.com");
        target.kind = TargetKind::Https;
        assert_eq!(build_url(&target), "https://example.com");
        target.address = "https://example.com/health".to_string();
        assert_eq!(build_url(&target), "https://example.com/health");
        target.kind = TargetKind::Http;
        target.address = "example.com".to_string();
        target.port = 8080;
        assert_eq!(build_url(&target), "http://example.com:8080");
    }

    #[test]
    fn default_headers_fill_only_absent_keys() {
        let mut target = Target::default();
        target.http.headers = vec![("User-Agent".to_string(), "probe/1.0".to_string())];
        let headers = build_headers(&target).unwrap();
        assert_eq!(headers.get("user-agent").unwrap(), "probe/1.0");
        assert_eq!(headers.get("accept").unwrap(), "*/*");
        assert_eq!(headers.get("accept-encoding").unwrap(), "gzip, deflate, br");
        assert_eq!(headers.get("connection").unwrap(), "keep-alive");
    }

    #[test]
    fn host_override_sets_host_header() {
        let target = Target {
            http: HttpOptions {
                resolved_host: "internal.example".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let headers = build_headers(&target).unwrap();
        assert_eq!(headers.get("host").unwrap(), "internal.example");
    }

    #[test]
    fn classify_default_is_2xx() {
        assert_eq!(classify_status(200, &[]), CheckStatus::Up);
        assert_eq!(classify_status(299, &[]), CheckStatus::Up);
        assert_eq!(classify_status(300, &[]), CheckStatus::Down);
        assert_eq!(classify_status(404, &[]), CheckStatus::Down);
    }

    #[test]
    fn classify_expected_set_is_exact() {
        let expected = [200, 301];
        assert_eq!(classify_status(301, &expected), CheckStatus::Up);
        assert_eq!(classify_status(302, &expected), CheckStatus::Down);
    }

    #[test]
    fn title_extraction_decodes_entities() {
        let body = b"<html><head><TITLE>A &amp; B &lt;ok&gt;</TITLE></head></html>";
        assert_eq!(extract_title(body).unwrap(), "A & B <ok>");
        assert_eq!(extract_title(b"<html></html>"), None);
    }

    #[test]
    fn title_extraction_spans_lines() {
        let body = b"<title>\n  Padded\n</title>";
        assert_eq!(extract_title(body).unwrap(), "Padded");
    }

    #[test]
    fn gunzip_round_trip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"<title>X</title>").unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(gunzip(&compressed).unwrap(), b"<title>X</title>");
        assert!(gunzip(b"not gzip").is_none());
    }
}
