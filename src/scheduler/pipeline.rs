//! Result pipeline: every `(target, result)` pair flows through here into
//! the store, the uptime accountant, the log sinks and the alert engine.

use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::alert::{AlertEngine, AlertEvent};
use crate::db::{CheckStatus, CurrentStatus, HistoryRecord, Store, Target, TargetKind};
use crate::logsink::{
    CheckLogEntry, FileSink, IndexEntry, IndexRequestDetails, IndexResponseDetails, IndexSink,
};
use crate::probe::CheckResult;

const UPTIME_WINDOW_DAYS: i64 = 30;

/// Applies check results. Cloned into every worker.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<Store>,
    alert: Arc<AlertEngine>,
    file_sink: FileSink,
    index_sink: Option<IndexSink>,
}

impl Pipeline {
    pub fn new(
        store: Arc<Store>,
        alert: Arc<AlertEngine>,
        file_sink: FileSink,
        index_sink: Option<IndexSink>,
    ) -> Self {
        Self {
            store,
            alert,
            file_sink,
            index_sink,
        }
    }

    /// Store, account and fan out one result. Errors are logged and
    /// swallowed; the scheduler keeps running.
    pub fn apply(&self, target: &Target, result: &CheckResult) {
        let now = Utc::now();

        // Keep the last computed uptime until the recompute below.
        let previous_uptime = self
            .store
            .get_status(target.id)
            .map(|s| s.uptime_percentage)
            .unwrap_or(0);

        let mut status = CurrentStatus {
            target_id: target.id,
            status: result.status,
            response_time_ms: result.response_time_ms,
            message: result.message.clone(),
            checked_at: now,
            uptime_percentage: previous_uptime,
            ..Default::default()
        };

        if target.kind.carries_certificate() {
            status.ssl_days_until_expiry = result
                .response
                .headers
                .get("days_until_expiry")
                .and_then(|v| v.parse().ok());
            status.ssl_issuer = result.response.headers.get("issuer").cloned();
            status.ssl_subject = result.response.headers.get("subject").cloned();
            status.ssl_serial = result.response.headers.get("serial").cloned();
        }

        status.resolved_ip = result.response.headers.get("resolved_ip").cloned();

        if target.kind == TargetKind::Dns && !result.response.body.is_empty() {
            status.dns_records = Some(result.response.body.clone());
        }

        if !result.data.is_empty() {
            status.data = serde_json::to_string(&result.data).ok();
        }

        if let Err(e) = self.store.upsert_status(&status) {
            tracing::error!(target_id = target.id, error = %e, "failed to save status");
        }

        if let Err(e) = self.store.append_history(&HistoryRecord {
            target_id: target.id,
            status: result.status,
            response_time_ms: result.response_time_ms,
            message: result.message.clone(),
            checked_at: now,
        }) {
            tracing::error!(target_id = target.id, error = %e, "failed to save history");
        }

        self.update_uptime(target.id);

        self.file_sink.log(file_entry(target, result));
        if let Some(index_sink) = &self.index_sink {
            index_sink.log(index_entry(target, result));
        }

        self.alert.process_event(AlertEvent {
            target_id: target.id,
            target_name: target.name.clone(),
            target_kind: target.kind.as_str().to_string(),
            address: target.address.clone(),
            status: result.status,
            response_time_ms: result.response_time_ms,
            message: result.message.clone(),
            timestamp: now,
        });
    }

    /// `floor(100 * up / total)` over the trailing 30 days, 0 when empty.
    fn update_uptime(&self, target_id: u32) {
        let since = Utc::now() - Duration::days(UPTIME_WINDOW_DAYS);

        let total = match self.store.count_history(target_id, since, None) {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(target_id, error = %e, "failed to count history");
                return;
            }
        };
        let up = match self
            .store
            .count_history(target_id, since, Some(CheckStatus::Up))
        {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(target_id, error = %e, "failed to count up history");
                return;
            }
        };

        let uptime = if total > 0 {
            ((up * 100) / total) as i32
        } else {
            0
        };
        if let Err(e) = self.store.set_uptime_percentage(target_id, uptime) {
            tracing::error!(target_id, error = %e, "failed to save uptime");
        }
    }
}

/// Build the daily-file log line. The response body itself is never stored,
/// only its size.
fn file_entry(target: &Target, result: &CheckResult) -> CheckLogEntry {
    let mut request = serde_json::Map::new();
    if !result.request.method.is_empty() {
        request.insert("method".to_string(), result.request.method.clone().into());
    }
    if !result.request.url.is_empty() {
        request.insert("url".to_string(), result.request.url.clone().into());
    }
    // Headers are always recorded so the operator can see what was sent.
    request.insert(
        "headers".to_string(),
        serde_json::to_value(&result.request.headers).unwrap_or_default(),
    );
    if !result.request.body.is_empty() {
        request.insert("body".to_string(), result.request.body.clone().into());
    }

    let mut response = serde_json::Map::new();
    if result.response.status_code != 0 {
        response.insert(
            "status_code".to_string(),
            result.response.status_code.into(),
        );
    }
    if !result.response.headers.is_empty() {
        response.insert(
            "headers".to_string(),
            serde_json::to_value(&result.response.headers).unwrap_or_default(),
        );
    }
    if !result.response.body.is_empty() {
        response.insert("body_size".to_string(), result.response.body.len().into());
    }
    if result.response.content_length > 0 {
        response.insert(
            "content_length".to_string(),
            result.response.content_length.into(),
        );
    }

    CheckLogEntry {
        timestamp: Utc::now(),
        target_id: target.id,
        target_name: target.name.clone(),
        target_type: target.kind.as_str().to_string(),
        address: target.address.clone(),
        status: result.status.as_str().to_string(),
        response_time: result.response_time_ms,
        message: result.message.clone(),
        request: Some(request),
        response: if response.is_empty() {
            None
        } else {
            Some(response)
        },
        error: result
            .error
            .as_ref()
            .and_then(|e| serde_json::to_value(e).ok()),
    }
}

/// Build the search-index document with flattened fields.
fn index_entry(target: &Target, result: &CheckResult) -> IndexEntry {
    IndexEntry {
        target_id: target.id,
        target_name: target.name.clone(),
        target_type: target.kind.as_str().to_string(),
        address: target.address.clone(),
        status: result.status.as_str().to_string(),
        response_time: result.response_time_ms,
        message: result.message.clone(),
        timestamp: Utc::now(),
        request: IndexRequestDetails {
            method: result.request.method.clone(),
            resolved_url: result.request.url.clone(),
            headers: result.request.headers.clone(),
            body: result.request.body.clone(),
        },
        response: IndexResponseDetails {
            status_code: match result.response.status_code {
                0 => None,
                code => Some(code),
            },
            headers: result.response.headers.clone(),
            body: result.response.body.clone(),
            content_length: match result.response.content_length {
                0 => None,
                length => Some(length),
            },
        },
        error: result
            .error
            .as_ref()
            .and_then(|e| serde_json::to_value(e).ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TargetKind;
    use crate::probe::{ErrorDetails, ErrorKind};
    use tempfile::tempdir;

    fn test_pipeline() -> (Pipeline, Arc<Store>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::in_memory().unwrap());
        let alert = Arc::new(AlertEngine::new(store.clone()));
        let file_sink = FileSink::spawn(dir.path(), 16);
        (
            Pipeline::new(store.clone(), alert, file_sink, None),
            store,
            dir,
        )
    }

    fn http_target() -> Target {
        Target {
            id: 1,
            name: "web".to_string(),
            kind: TargetKind::Http,
            address: "example.com".to_string(),
            interval_secs: 60,
            ..Default::default()
        }
    }

    fn up_result() -> CheckResult {
        let mut result = CheckResult {
            status: CheckStatus::Up,
            response_time_ms: 120,
            message: "HTTP 200 OK".to_string(),
            ..Default::default()
        };
        result.response.status_code = 200;
        result
            .response
            .headers
            .insert("resolved_ip".to_string(), "93.184.216.34".to_string());
        result
    }

    #[tokio::test]
    async fn apply_updates_status_history_and_uptime() {
        let (pipeline, store, _dir) = test_pipeline();
        let target = http_target();

        pipeline.apply(&target, &up_result());

        let status = store.get_status(1).unwrap();
        assert_eq!(status.status, CheckStatus::Up);
        assert_eq!(status.response_time_ms, 120);
        assert_eq!(status.resolved_ip.as_deref(), Some("93.184.216.34"));
        assert_eq!(status.uptime_percentage, 100);

        let mut down = CheckResult::failed(ErrorKind::NetworkError, "Request failed", 30);
        down.request.method = "GET".to_string();
        pipeline.apply(&target, &down);

        let status = store.get_status(1).unwrap();
        assert_eq!(status.status, CheckStatus::Down);
        // 1 up of 2 checks
        assert_eq!(status.uptime_percentage, 50);

        let since = Utc::now() - Duration::days(1);
        assert_eq!(store.count_history(1, since, None).unwrap(), 2);
    }

    #[tokio::test]
    async fn ssl_summary_is_lifted_for_https() {
        let (pipeline, store, _dir) = test_pipeline();
        let mut target = http_target();
        target.kind = TargetKind::Https;

        let mut result = up_result();
        result
            .response
            .headers
            .insert("days_until_expiry".to_string(), "42".to_string());
        result
            .response
            .headers
            .insert("issuer".to_string(), "Test CA".to_string());
        result
            .response
            .headers
            .insert("subject".to_string(), "example.com".to_string());
        result
            .response
            .headers
            .insert("serial".to_string(), "0AFF".to_string());
        result.data.insert(
            "certificate_chain".to_string(),
            serde_json::json!([{"index": 0}]),
        );

        pipeline.apply(&target, &result);

        let status = store.get_status(1).unwrap();
        assert_eq!(status.ssl_days_until_expiry, Some(42));
        assert_eq!(status.ssl_issuer.as_deref(), Some("Test CA"));
        assert_eq!(status.ssl_subject.as_deref(), Some("example.com"));
        assert_eq!(status.ssl_serial.as_deref(), Some("0AFF"));
        assert!(status.data.unwrap().contains("certificate_chain"));
    }

    #[tokio::test]
    async fn http_target_does_not_lift_ssl_fields() {
        let (pipeline, store, _dir) = test_pipeline();
        let target = http_target();

        let mut result = up_result();
        result
            .response
            .headers
            .insert("days_until_expiry".to_string(), "42".to_string());
        pipeline.apply(&target, &result);

        let status = store.get_status(1).unwrap();
        assert!(status.ssl_days_until_expiry.is_none());
    }

    #[test]
    fn file_entry_stores_body_size_not_body() {
        let target = http_target();
        let mut result = up_result();
        result.response.body = "<html>hello</html>".to_string();
        result.response.content_length = 18;

        let entry = file_entry(&target, &result);
        let response = entry.response.unwrap();
        assert_eq!(response["body_size"], 18);
        assert_eq!(response["content_length"], 18);
        assert!(response.get("body").is_none());

        // request.headers is always present, even when empty
        let request = entry.request.unwrap();
        assert!(request.get("headers").is_some());
    }

    #[test]
    fn file_entry_round_trips_through_json() {
        let target = http_target();
        let result = up_result();
        let entry = file_entry(&target, &result);

        let line = serde_json::to_string(&entry).unwrap();
        let decoded: CheckLogEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(decoded.status, "up");
        assert_eq!(decoded.response_time, 120);
        assert_eq!(decoded.target_id, 1);
    }

    #[test]
    fn index_entry_keeps_error_details() {
        let target = http_target();
        let mut result = CheckResult::failed(ErrorKind::Timeout, "deadline exceeded", 30_000);
        result.error = Some(ErrorDetails {
            kind: ErrorKind::Timeout,
            message: "deadline exceeded".to_string(),
        });

        let entry = index_entry(&target, &result);
        assert_eq!(entry.status, "down");
        let error = entry.error.unwrap();
        assert_eq!(error["type"], "timeout");
        assert_eq!(error["message"], "deadline exceeded");
    }
}
