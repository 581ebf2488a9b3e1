//! Outbound alert notifiers and their factory.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::probe::{shared_client, SmtpSession};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("invalid channel config: {0}")]
    Config(String),
    #[error("notification request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("notification rejected with status {0}")]
    Status(u16),
    #[error("mail delivery failed: {0}")]
    Smtp(#[from] crate::probe::SmtpError),
}

/// The rendered alert handed to a notifier.
#[derive(Debug, Clone)]
pub struct AlertMessage {
    pub title: String,
    pub message: String,
    pub target: String,
    pub status: String,
    pub metadata: BTreeMap<String, String>,
}

impl AlertMessage {
    /// Human-readable body shared by text-oriented channels.
    pub fn render(&self) -> String {
        let mut body = format!(
            "Monitoring alert: {}\nTarget: {}\nStatus: {}\nTime: {}\n",
            self.title,
            self.target,
            self.status,
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
        );
        if !self.metadata.is_empty() {
            body.push_str("\nDetails:\n");
            for (key, value) in &self.metadata {
                body.push_str(&format!("  {}: {}\n", key, value));
            }
        }
        body.push('\n');
        body.push_str(&self.message);
        body
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, alert: &AlertMessage) -> Result<(), NotifierError>;
}

fn webhook_payload(alert: &AlertMessage) -> serde_json::Value {
    json!({
        "title": alert.title,
        "message": alert.message,
        "target": alert.target,
        "status": alert.status,
        "timestamp": Utc::now().to_rfc3339(),
        "metadata": alert.metadata,
    })
}

/// Generic webhook: POST a fixed JSON schema, 2xx is success.
pub struct WebhookNotifier {
    url: String,
    headers: BTreeMap<String, String>,
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, alert: &AlertMessage) -> Result<(), NotifierError> {
        let mut request = shared_client()
            .post(&self.url)
            .timeout(NOTIFY_TIMEOUT)
            .json(&webhook_payload(alert));
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(NotifierError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Webhook variant that signs each delivery with a shared secret.
pub struct SignedWebhookNotifier {
    url: String,
    secret: String,
}

impl SignedWebhookNotifier {
    /// `sign = base64(sha256("{timestamp}\n{secret}"))`
    fn sign(&self, timestamp: i64) -> String {
        let digest = Sha256::digest(format!("{}\n{}", timestamp, self.secret).as_bytes());
        BASE64.encode(digest)
    }
}

#[async_trait]
impl Notifier for SignedWebhookNotifier {
    async fn send(&self, alert: &AlertMessage) -> Result<(), NotifierError> {
        let timestamp = Utc::now().timestamp_millis();
        let response = shared_client()
            .post(&self.url)
            .timeout(NOTIFY_TIMEOUT)
            .query(&[
                ("timestamp", timestamp.to_string()),
                ("sign", self.sign(timestamp)),
            ])
            .json(&webhook_payload(alert))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NotifierError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Bot-over-HTTP messenger (Telegram-style sendMessage API).
pub struct MessengerNotifier {
    api_base: String,
    bot_token: String,
    chat_id: String,
}

#[async_trait]
impl Notifier for MessengerNotifier {
    async fn send(&self, alert: &AlertMessage) -> Result<(), NotifierError> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.bot_token
        );
        let response = shared_client()
            .post(&url)
            .timeout(NOTIFY_TIMEOUT)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": format!("{}\n\n{}", alert.title, alert.render()),
                "parse_mode": "Markdown",
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NotifierError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// SMTP mail notifier.
pub struct MailNotifier {
    host: String,
    port: u16,
    username: String,
    password: String,
    from: String,
    to: Vec<String>,
    starttls: bool,
}

#[async_trait]
impl Notifier for MailNotifier {
    async fn send(&self, alert: &AlertMessage) -> Result<(), NotifierError> {
        let implicit_tls = self.port == 465;
        let mut session = SmtpSession::connect(&self.host, self.port, implicit_tls).await?;
        session.ehlo("netpulse.local").await?;

        if self.starttls && !implicit_tls {
            session = session.starttls(&self.host).await?;
            session.ehlo("netpulse.local").await?;
        }
        if !self.username.is_empty() {
            session.auth_plain(&self.username, &self.password).await?;
        }

        session.expect(&format!("MAIL FROM:<{}>", self.from)).await?;
        for recipient in &self.to {
            session.expect(&format!("RCPT TO:<{}>", recipient)).await?;
        }

        let body = format!("Subject: {}\r\n\r\n{}", alert.title, alert.render());
        session.data(&body).await?;
        session.quit().await?;
        Ok(())
    }
}

fn required_str(config: &serde_json::Value, key: &str) -> Result<String, NotifierError> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| NotifierError::Config(format!("missing {}", key)))
}

fn optional_str(config: &serde_json::Value, key: &str) -> String {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Construct a notifier from a channel kind and its opaque JSON config.
pub fn build_notifier(
    kind: &str,
    config: &serde_json::Value,
) -> Result<Box<dyn Notifier>, NotifierError> {
    match kind {
        "webhook" => {
            let headers = config
                .get("headers")
                .and_then(|v| v.as_object())
                .map(|map| {
                    map.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            Ok(Box::new(WebhookNotifier {
                url: required_str(config, "url")?,
                headers,
            }))
        }
        "webhook-signed" => Ok(Box::new(SignedWebhookNotifier {
            url: required_str(config, "url")?,
            secret: required_str(config, "secret")?,
        })),
        "messenger" => {
            let api_base = match optional_str(config, "api_base") {
                base if base.is_empty() => "https://api.telegram.org".to_string(),
                base => base,
            };
            Ok(Box::new(MessengerNotifier {
                api_base,
                bot_token: required_str(config, "bot_token")?,
                chat_id: required_str(config, "chat_id")?,
            }))
        }
        "smtp" => {
            let to = config
                .get("to")
                .and_then(|v| v.as_array())
                .map(|list| {
                    list.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect::<Vec<_>>()
                })
                .filter(|list| !list.is_empty())
                .ok_or_else(|| NotifierError::Config("missing to".to_string()))?;
            Ok(Box::new(MailNotifier {
                host: required_str(config, "host")?,
                port: config.get("port").and_then(|v| v.as_u64()).unwrap_or(25) as u16,
                username: optional_str(config, "username"),
                password: optional_str(config, "password"),
                from: required_str(config, "from")?,
                to,
                starttls: config
                    .get("starttls")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            }))
        }
        other => Err(NotifierError::Config(format!(
            "unsupported channel kind: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert() -> AlertMessage {
        AlertMessage {
            title: "Target down".to_string(),
            message: "HTTP probe failed twice".to_string(),
            target: "api.example.com".to_string(),
            status: "down".to_string(),
            metadata: BTreeMap::from([("response_time".to_string(), "1200ms".to_string())]),
        }
    }

    #[test]
    fn render_includes_target_and_metadata() {
        let body = alert().render();
        assert!(body.contains("Monitoring alert: Target down"));
        assert!(body.contains("Target: api.example.com"));
        assert!(body.contains("response_time: 1200ms"));
        assert!(body.ends_with("HTTP probe failed twice"));
    }

    #[test]
    fn webhook_payload_schema() {
        let payload = webhook_payload(&alert());
        for key in ["title", "message", "target", "status", "timestamp", "metadata"] {
            assert!(payload.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(payload["status"], "down");
    }

    #[test]
    fn factory_builds_each_kind() {
        assert!(build_notifier("webhook", &json!({"url": "https://x/hook"})).is_ok());
        assert!(build_notifier(
            "webhook-signed",
            &json!({"url": "https://x/hook", "secret": "s"})
        )
        .is_ok());
        assert!(build_notifier(
            "messenger",
            &json!({"bot_token": "123:abc", "chat_id": "42"})
        )
        .is_ok());
        assert!(build_notifier(
            "smtp",
            &json!({"host": "mail.example.com", "from": "mon@example.com", "to": ["ops@example.com"]})
        )
        .is_ok());
    }

    #[test]
    fn factory_rejects_bad_config() {
        assert!(matches!(
            build_notifier("webhook", &json!({})),
            Err(NotifierError::Config(_))
        ));
        assert!(matches!(
            build_notifier("smtp", &json!({"host": "h", "from": "f", "to": []})),
            Err(NotifierError::Config(_))
        ));
        assert!(matches!(
            build_notifier("pager", &json!({})),
            Err(NotifierError::Config(_))
        ));
    }

    #[test]
    fn signature_is_deterministic() {
        let notifier = SignedWebhookNotifier {
            url: "https://x".to_string(),
            secret: "secret".to_string(),
        };
        assert_eq!(notifier.sign(1700000000000), notifier.sign(1700000000000));
        assert_ne!(notifier.sign(1700000000000), notifier.sign(1700000000001));
    }

    #[tokio::test]
    async fn webhook_posts_to_local_server() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
            request
        });

        let notifier = build_notifier(
            "webhook",
            &json!({"url": format!("http://127.0.0.1:{}/hook", port)}),
        )
        .unwrap();
        notifier.send(&alert()).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.contains("content-type: application/json"));
    }
}
