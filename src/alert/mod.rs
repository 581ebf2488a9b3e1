//! Alert engine: per-target event buffers, rule evaluation, cooldown and
//! notifier dispatch.

mod notifier;

pub use notifier::*;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::db::{AlertChannel, AlertRule, CheckStatus, DbError, Store};

/// Events kept per target for rule evaluation.
const EVENT_BUFFER_CAPACITY: usize = 100;

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// One probe outcome as seen by the alert engine.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub target_id: u32,
    pub target_name: String,
    pub target_kind: String,
    pub address: String,
    pub status: CheckStatus,
    pub response_time_ms: i64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Evaluates rules against recent events and dispatches notifications.
pub struct AlertEngine {
    store: Arc<Store>,
    buffers: Mutex<HashMap<u32, VecDeque<AlertEvent>>>,
}

impl AlertEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Append the event to its target's ring and walk the target's rules.
    ///
    /// Evaluation is serialized with the append; dispatches run on their own
    /// tasks and never block the caller.
    pub fn process_event(&self, event: AlertEvent) {
        let snapshot: Vec<AlertEvent> = {
            let mut buffers = self.buffers.lock().unwrap();
            let buffer = buffers.entry(event.target_id).or_default();
            if buffer.len() == EVENT_BUFFER_CAPACITY {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
            buffer.iter().cloned().collect()
        };

        let rules = match self.store.list_rules(event.target_id) {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!(target_id = event.target_id, error = %e, "failed to load alert rules");
                return;
            }
        };

        let now = Utc::now();
        for rule in rules {
            if !rule.enabled {
                continue;
            }
            if in_cooldown(&rule, now) {
                continue;
            }
            if !should_fire(&rule, &snapshot) {
                continue;
            }
            self.fire(&rule, &event, now);
        }
    }

    /// Resolve the channel, mark the rule fired and dispatch asynchronously.
    fn fire(&self, rule: &AlertRule, event: &AlertEvent, now: DateTime<Utc>) {
        let channel = match self.store.get_channel(rule.channel_id) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(
                    rule_id = rule.id,
                    channel_id = rule.channel_id,
                    error = %e,
                    "alert rule references a missing channel, skipping"
                );
                return;
            }
        };
        if !channel.enabled {
            return;
        }

        let notifier = match build_notifier(&channel.kind, &channel.config) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(channel_id = channel.id, error = %e, "failed to build notifier");
                return;
            }
        };

        if let Err(e) = self.store.set_rule_fired(rule.id, now) {
            tracing::error!(rule_id = rule.id, error = %e, "failed to record rule fire time");
        }

        tracing::warn!(
            target = %event.target_name,
            address = %event.address,
            status = %event.status,
            rule_id = rule.id,
            "alert fired"
        );

        let message = alert_message(event);
        let channel_name = channel.name.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(DISPATCH_TIMEOUT, notifier.send(&message)).await {
                Ok(Ok(())) => {
                    tracing::info!(channel = %channel_name, "alert dispatched");
                }
                Ok(Err(e)) => {
                    tracing::error!(channel = %channel_name, error = %e, "alert dispatch failed");
                }
                Err(_) => {
                    tracing::error!(channel = %channel_name, "alert dispatch timed out");
                }
            }
        });
    }

    /// Register a channel after checking its config builds a notifier.
    pub fn add_channel(&self, channel: &mut AlertChannel) -> Result<u32, DbError> {
        if let Err(e) = build_notifier(&channel.kind, &channel.config) {
            return Err(DbError::Invalid(e.to_string()));
        }
        let id = self.store.add_channel(channel)?;
        tracing::info!(channel_id = id, name = %channel.name, kind = %channel.kind, "alert channel added");
        Ok(id)
    }

    pub fn remove_channel(&self, id: u32) -> Result<(), DbError> {
        self.store.delete_channel(id)?;
        tracing::info!(channel_id = id, "alert channel removed");
        Ok(())
    }

    pub fn add_rule(&self, rule: &mut AlertRule) -> Result<u32, DbError> {
        let id = self.store.add_rule(rule)?;
        tracing::info!(rule_id = id, target_id = rule.target_id, "alert rule added");
        Ok(id)
    }

    pub fn remove_rule(&self, id: u32) -> Result<(), DbError> {
        self.store.delete_rule(id)?;
        tracing::info!(rule_id = id, "alert rule removed");
        Ok(())
    }

    /// Send a canned test alert through one channel.
    pub async fn test_channel(&self, channel_id: u32) -> Result<(), NotifierError> {
        let channel = self
            .store
            .get_channel(channel_id)
            .map_err(|e| NotifierError::Config(e.to_string()))?;
        let notifier = build_notifier(&channel.kind, &channel.config)?;

        let message = AlertMessage {
            title: "Test alert".to_string(),
            message: "This is a test alert. If you received it, the channel is configured correctly."
                .to_string(),
            target: "test target".to_string(),
            status: "up".to_string(),
            metadata: BTreeMap::from([("test".to_string(), "true".to_string())]),
        };

        match tokio::time::timeout(DISPATCH_TIMEOUT, notifier.send(&message)).await {
            Ok(result) => result,
            Err(_) => Err(NotifierError::Config("test dispatch timed out".to_string())),
        }
    }

    #[cfg(test)]
    fn buffer_len(&self, target_id: u32) -> usize {
        self.buffers
            .lock()
            .unwrap()
            .get(&target_id)
            .map(|b| b.len())
            .unwrap_or(0)
    }
}

fn in_cooldown(rule: &AlertRule, now: DateTime<Utc>) -> bool {
    match rule.last_fired {
        Some(last) if rule.cooldown_seconds > 0 => {
            (now - last).num_seconds() < rule.cooldown_seconds
        }
        _ => false,
    }
}

/// Rule conditions against the event ring, newest event last.
fn should_fire(rule: &AlertRule, events: &[AlertEvent]) -> bool {
    let newest = match events.last() {
        Some(event) => event,
        None => return false,
    };

    match rule.threshold_type.as_str() {
        "failure_count" if rule.threshold_value > 0 => {
            let consecutive_down = events
                .iter()
                .rev()
                .take_while(|e| e.status == CheckStatus::Down)
                .count() as i64;
            if consecutive_down >= rule.threshold_value {
                return true;
            }
        }
        "response_time" if rule.threshold_value > 0 => {
            if newest.response_time_ms > rule.threshold_value {
                return true;
            }
        }
        _ => {}
    }

    if rule.on_status_change && events.len() >= 2 {
        let previous = &events[events.len() - 2];
        if previous.status != newest.status {
            return true;
        }
    }

    false
}

fn alert_message(event: &AlertEvent) -> AlertMessage {
    AlertMessage {
        title: format!("Monitoring alert: {}", event.target_name),
        message: event.message.clone(),
        target: event.target_name.clone(),
        status: event.status.as_str().to_string(),
        metadata: BTreeMap::from([
            ("address".to_string(), event.address.clone()),
            ("type".to_string(), event.target_kind.clone()),
            (
                "response_time".to_string(),
                format!("{}ms", event.response_time_ms),
            ),
            ("time".to_string(), event.timestamp.to_rfc3339()),
        ]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AlertChannel;
    use chrono::Duration as ChronoDuration;

    fn event(status: CheckStatus, response_time_ms: i64) -> AlertEvent {
        AlertEvent {
            target_id: 1,
            target_name: "api".to_string(),
            target_kind: "http".to_string(),
            address: "api.example.com".to_string(),
            status,
            response_time_ms,
            message: "probe result".to_string(),
            timestamp: Utc::now(),
        }
    }

    fn rule(threshold_type: &str, threshold_value: i64) -> AlertRule {
        AlertRule {
            id: 1,
            target_id: 1,
            channel_id: 1,
            threshold_type: threshold_type.to_string(),
            threshold_value,
            on_status_change: false,
            enabled: true,
            cooldown_seconds: 300,
            last_fired: None,
        }
    }

    #[test]
    fn failure_count_needs_consecutive_downs() {
        let rule = rule("failure_count", 2);
        let events = vec![event(CheckStatus::Up, 10), event(CheckStatus::Down, 10)];
        assert!(!should_fire(&rule, &events));

        let events = vec![
            event(CheckStatus::Up, 10),
            event(CheckStatus::Down, 10),
            event(CheckStatus::Down, 10),
        ];
        assert!(should_fire(&rule, &events));

        // An up in between resets the streak.
        let events = vec![
            event(CheckStatus::Down, 10),
            event(CheckStatus::Up, 10),
            event(CheckStatus::Down, 10),
        ];
        assert!(!should_fire(&rule, &events));
    }

    #[test]
    fn response_time_checks_newest_event() {
        let rule = rule("response_time", 1000);
        let events = vec![event(CheckStatus::Up, 500)];
        assert!(!should_fire(&rule, &events));
        let events = vec![event(CheckStatus::Up, 1500)];
        assert!(should_fire(&rule, &events));
        // threshold is strict
        let events = vec![event(CheckStatus::Up, 1000)];
        assert!(!should_fire(&rule, &events));
    }

    #[test]
    fn status_change_fires_on_transition() {
        let mut rule = rule("failure_count", 0);
        rule.on_status_change = true;
        let events = vec![event(CheckStatus::Up, 10), event(CheckStatus::Down, 10)];
        assert!(should_fire(&rule, &events));
        let events = vec![event(CheckStatus::Up, 10), event(CheckStatus::Up, 10)];
        assert!(!should_fire(&rule, &events));
        // A single event has no transition.
        let events = vec![event(CheckStatus::Down, 10)];
        assert!(!should_fire(&rule, &events));
    }

    #[test]
    fn cooldown_window_suppresses() {
        let mut rule = rule("failure_count", 1);
        let now = Utc::now();
        assert!(!in_cooldown(&rule, now));

        rule.last_fired = Some(now - ChronoDuration::seconds(100));
        assert!(in_cooldown(&rule, now));

        rule.last_fired = Some(now - ChronoDuration::seconds(301));
        assert!(!in_cooldown(&rule, now));

        rule.cooldown_seconds = 0;
        rule.last_fired = Some(now);
        assert!(!in_cooldown(&rule, now));
    }

    #[test]
    fn buffer_evicts_oldest_at_capacity() {
        let store = Arc::new(Store::in_memory().unwrap());
        let engine = AlertEngine::new(store);

        for _ in 0..150 {
            engine.process_event(event(CheckStatus::Up, 1));
        }
        assert_eq!(engine.buffer_len(1), EVENT_BUFFER_CAPACITY);
    }

    #[tokio::test]
    async fn consecutive_failures_dispatch_once_within_cooldown() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));

        let server_hits = hits.clone();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                server_hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                    .await;
            }
        });

        let store = Arc::new(Store::in_memory().unwrap());
        let mut channel = AlertChannel {
            id: 0,
            name: "hook".to_string(),
            kind: "webhook".to_string(),
            enabled: true,
            config: serde_json::json!({"url": format!("http://127.0.0.1:{}/alert", port)}),
        };
        let channel_id = store.add_channel(&mut channel).unwrap();

        let mut rule = AlertRule {
            id: 0,
            target_id: 1,
            channel_id,
            threshold_type: "failure_count".to_string(),
            threshold_value: 2,
            on_status_change: false,
            enabled: true,
            cooldown_seconds: 300,
            last_fired: None,
        };
        store.add_rule(&mut rule).unwrap();

        let engine = AlertEngine::new(store);
        engine.process_event(event(CheckStatus::Down, 10));
        engine.process_event(event(CheckStatus::Down, 10));
        engine.process_event(event(CheckStatus::Down, 10));

        // Let the dispatch task run.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if hits.load(Ordering::SeqCst) > 0 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
