//! Optional search-index sink (Elasticsearch-compatible HTTP API).
//!
//! Best-effort: indexing failures are logged and dropped, never retried.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::probe::shared_client;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("index returned status {0}: {1}")]
    Status(u16, String),
}

/// Index sink configuration.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Base URL, e.g. `http://localhost:9200`.
    pub url: String,
    /// Daily indices are named `{prefix}-YYYY.MM.DD`.
    pub prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// One indexed check document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub target_id: u32,
    pub target_name: String,
    pub target_type: String,
    pub address: String,
    pub status: String,
    pub response_time: i64,
    pub message: String,
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    pub request: IndexRequestDetails,
    pub response: IndexResponseDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexRequestDetails {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub method: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub resolved_url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub body: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexResponseDetails {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content_length: Option<i64>,
}

/// Thin client over the index HTTP API.
#[derive(Clone)]
pub struct IndexClient {
    config: IndexConfig,
}

impl IndexClient {
    pub fn new(config: IndexConfig) -> Self {
        Self { config }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.username {
            Some(username) => builder.basic_auth(username, self.config.password.as_deref()),
            None => builder,
        }
    }

    /// Index one document into the daily index.
    pub async fn index(&self, entry: &IndexEntry) -> Result<(), IndexError> {
        let index = format!(
            "{}-{}",
            self.config.prefix,
            entry.timestamp.format("%Y.%m.%d")
        );
        let url = format!("{}/{}/_doc", self.config.url.trim_end_matches('/'), index);

        let response = self
            .authorize(shared_client().post(&url).json(entry))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::Status(status.as_u16(), body));
        }

        tracing::debug!(index = %index, target_id = entry.target_id, "log indexed");
        Ok(())
    }

    /// Search across all daily indices, `@timestamp` descending.
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResult, IndexError> {
        let url = format!(
            "{}/{}-*/_search",
            self.config.url.trim_end_matches('/'),
            self.config.prefix
        );

        let response = self
            .authorize(shared_client().post(&url).json(&query.to_body()))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::Status(status.as_u16(), body));
        }

        let parsed: RawSearchResponse = response.json().await?;
        Ok(SearchResult {
            total: parsed.hits.total.value,
            hits: parsed.hits.hits.into_iter().map(|h| h.source).collect(),
        })
    }
}

/// Term/range/full-text filters for log search.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub target_id: Option<u32>,
    pub status: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Multi-field match over message and request/response/error bodies.
    pub query_text: Option<String>,
    pub size: usize,
    pub from: usize,
}

impl SearchQuery {
    fn to_body(&self) -> serde_json::Value {
        let mut must = Vec::new();

        if let Some(target_id) = self.target_id {
            must.push(json!({"term": {"target_id": target_id}}));
        }
        if let Some(status) = &self.status {
            must.push(json!({"term": {"status": status}}));
        }
        if self.start_time.is_some() || self.end_time.is_some() {
            let mut range = serde_json::Map::new();
            if let Some(start) = self.start_time {
                range.insert("gte".to_string(), json!(start.to_rfc3339()));
            }
            if let Some(end) = self.end_time {
                range.insert("lte".to_string(), json!(end.to_rfc3339()));
            }
            must.push(json!({"range": {"@timestamp": range}}));
        }
        if let Some(text) = &self.query_text {
            must.push(json!({
                "multi_match": {
                    "query": text,
                    "fields": ["message", "request.body", "response.body", "error.message"],
                }
            }));
        }

        let size = match self.size {
            0 => 20,
            s => s.min(100),
        };

        json!({
            "query": {"bool": {"must": must}},
            "size": size,
            "from": self.from,
            "sort": [{"@timestamp": {"order": "desc"}}],
        })
    }
}

#[derive(Debug, Default)]
pub struct SearchResult {
    pub total: u64,
    pub hits: Vec<IndexEntry>,
}

#[derive(Deserialize)]
struct RawSearchResponse {
    hits: RawHits,
}

#[derive(Deserialize)]
struct RawHits {
    total: RawTotal,
    hits: Vec<RawHit>,
}

#[derive(Deserialize)]
struct RawTotal {
    value: u64,
}

#[derive(Deserialize)]
struct RawHit {
    #[serde(rename = "_source")]
    source: IndexEntry,
}

/// Producer handle for the index sink.
#[derive(Clone)]
pub struct IndexSink {
    tx: mpsc::Sender<IndexEntry>,
    dropped: Arc<AtomicU64>,
}

impl IndexSink {
    /// Spawn the consumer task and return the producer handle.
    pub fn spawn(client: IndexClient, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<IndexEntry>(capacity);

        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = client.index(&entry).await {
                    tracing::error!(target_id = entry.target_id, error = %e, "failed to index log");
                }
            }
            tracing::debug!("index sink exiting");
        });

        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Non-blocking enqueue; a full queue drops the entry.
    pub fn log(&self, entry: IndexEntry) {
        if let Err(mpsc::error::TrySendError::Full(entry)) = self.tx.try_send(entry) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                target_id = entry.target_id,
                dropped,
                "index queue full, dropping log"
            );
        }
    }

    pub fn dropped_entries(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_body_includes_all_filters() {
        let query = SearchQuery {
            target_id: Some(4),
            status: Some("down".to_string()),
            start_time: Some("2026-01-01T00:00:00Z".parse().unwrap()),
            end_time: Some("2026-01-02T00:00:00Z".parse().unwrap()),
            query_text: Some("timeout".to_string()),
            size: 0,
            from: 10,
        };
        let body = query.to_body();

        let must = body["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(must.len(), 4);
        assert_eq!(must[0]["term"]["target_id"], 4);
        assert_eq!(must[1]["term"]["status"], "down");
        assert!(must[2]["range"]["@timestamp"]["gte"].is_string());
        assert_eq!(must[3]["multi_match"]["query"], "timeout");
        assert_eq!(body["size"], 20);
        assert_eq!(body["from"], 10);
        assert_eq!(body["sort"][0]["@timestamp"]["order"], "desc");
    }

    #[test]
    fn search_size_is_capped() {
        let query = SearchQuery {
            size: 10_000,
            ..Default::default()
        };
        assert_eq!(query.to_body()["size"], 100);
    }

    #[test]
    fn entry_serializes_with_at_timestamp() {
        let entry = IndexEntry {
            target_id: 1,
            target_name: "t".to_string(),
            target_type: "http".to_string(),
            address: "example.com".to_string(),
            status: "up".to_string(),
            response_time: 5,
            message: "HTTP 200 OK".to_string(),
            timestamp: "2026-03-01T12:00:00Z".parse().unwrap(),
            request: IndexRequestDetails::default(),
            response: IndexResponseDetails::default(),
            error: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("@timestamp").is_some());
        assert!(json.get("error").is_none());
    }
}
