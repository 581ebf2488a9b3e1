//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Invalid record: {0}")]
    Invalid(String),
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// In-memory store, used by tests and ephemeral runs.
    pub fn in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Target CRUD ---

    /// Add a new target and return its ID.
    pub fn add_target(&self, target: &mut Target) -> Result<u32, DbError> {
        target.validate().map_err(DbError::Invalid)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO targets (name, kind, address, port, interval_secs, enabled, metadata,
                                  http_options, dns_options, ping_options, smtp_options,
                                  snmp_options, ssl_options, alert_channels)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                target.name,
                target.kind.as_str(),
                target.address,
                target.port,
                target.interval_secs,
                target.enabled,
                to_json(&target.metadata),
                to_json(&target.http),
                to_json(&target.dns),
                to_json(&target.ping),
                to_json(&target.smtp),
                to_json(&target.snmp),
                to_json(&target.ssl),
                to_json(&target.alert_channels),
            ],
        )?;
        let id = conn.last_insert_rowid() as u32;
        target.id = id;
        Ok(id)
    }

    /// Update an existing target.
    pub fn update_target(&self, target: &Target) -> Result<(), DbError> {
        target.validate().map_err(DbError::Invalid)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE targets SET name=?1, kind=?2, address=?3, port=?4, interval_secs=?5,
                                enabled=?6, metadata=?7, http_options=?8, dns_options=?9,
                                ping_options=?10, smtp_options=?11, snmp_options=?12,
                                ssl_options=?13, alert_channels=?14
             WHERE id=?15",
            params![
                target.name,
                target.kind.as_str(),
                target.address,
                target.port,
                target.interval_secs,
                target.enabled,
                to_json(&target.metadata),
                to_json(&target.http),
                to_json(&target.dns),
                to_json(&target.ping),
                to_json(&target.smtp),
                to_json(&target.snmp),
                to_json(&target.ssl),
                to_json(&target.alert_channels),
                target.id,
            ],
        )?;
        Ok(())
    }

    /// Get all targets.
    pub fn list_targets(&self) -> Result<Vec<Target>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM targets", TARGET_COLUMNS))?;
        let targets = stmt
            .query_map([], target_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// Get a target by ID.
    pub fn get_target(&self, id: u32) -> Result<Target, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {} FROM targets WHERE id = ?1", TARGET_COLUMNS),
            params![id],
            target_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete a target with its status, history and rules.
    pub fn delete_target(&self, id: u32) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM monitor_status WHERE target_id = ?1", params![id])?;
        conn.execute("DELETE FROM monitor_history WHERE target_id = ?1", params![id])?;
        conn.execute("DELETE FROM alert_rules WHERE target_id = ?1", params![id])?;
        conn.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Current status ---

    /// Insert or replace the single status row of a target.
    pub fn upsert_status(&self, status: &CurrentStatus) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO monitor_status (target_id, status, response_time_ms, message, checked_at,
                                         uptime_percentage, ssl_days_until_expiry, ssl_issuer,
                                         ssl_subject, ssl_serial, resolved_ip, dns_records, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(target_id) DO UPDATE SET
                 status=excluded.status,
                 response_time_ms=excluded.response_time_ms,
                 message=excluded.message,
                 checked_at=excluded.checked_at,
                 uptime_percentage=excluded.uptime_percentage,
                 ssl_days_until_expiry=excluded.ssl_days_until_expiry,
                 ssl_issuer=excluded.ssl_issuer,
                 ssl_subject=excluded.ssl_subject,
                 ssl_serial=excluded.ssl_serial,
                 resolved_ip=excluded.resolved_ip,
                 dns_records=excluded.dns_records,
                 data=excluded.data",
            params![
                status.target_id,
                status.status.as_str(),
                status.response_time_ms,
                status.message,
                format_time(status.checked_at),
                status.uptime_percentage,
                status.ssl_days_until_expiry,
                status.ssl_issuer,
                status.ssl_subject,
                status.ssl_serial,
                status.resolved_ip,
                status.dns_records,
                status.data,
            ],
        )?;
        Ok(())
    }

    /// Update only the uptime percentage of a status row.
    pub fn set_uptime_percentage(&self, target_id: u32, uptime: i32) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE monitor_status SET uptime_percentage = ?1 WHERE target_id = ?2",
            params![uptime, target_id],
        )?;
        Ok(())
    }

    pub fn get_status(&self, target_id: u32) -> Result<CurrentStatus, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT {} FROM monitor_status WHERE target_id = ?1",
                STATUS_COLUMNS
            ),
            params![target_id],
            status_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    pub fn list_statuses(&self) -> Result<Vec<CurrentStatus>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM monitor_status ORDER BY target_id",
            STATUS_COLUMNS
        ))?;
        let statuses = stmt
            .query_map([], status_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(statuses)
    }

    // --- History ---

    pub fn append_history(&self, record: &HistoryRecord) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO monitor_history (target_id, status, response_time_ms, message, checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.target_id,
                record.status.as_str(),
                record.response_time_ms,
                record.message,
                format_time(record.checked_at),
            ],
        )?;
        Ok(())
    }

    /// Count history rows since a cutoff, optionally restricted to a status.
    pub fn count_history(
        &self,
        target_id: u32,
        since: DateTime<Utc>,
        status: Option<CheckStatus>,
    ) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        let count = match status {
            Some(status) => conn.query_row(
                "SELECT COUNT(*) FROM monitor_history
                 WHERE target_id = ?1 AND checked_at >= ?2 AND status = ?3",
                params![target_id, format_time(since), status.as_str()],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM monitor_history
                 WHERE target_id = ?1 AND checked_at >= ?2",
                params![target_id, format_time(since)],
                |row| row.get(0),
            )?,
        };
        Ok(count)
    }

    /// Delete history rows older than the cutoff. Returns the number removed.
    pub fn prune_history(&self, before: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM monitor_history WHERE checked_at < ?1",
            params![format_time(before)],
        )?;
        Ok(removed)
    }

    // --- Alert channels ---

    pub fn add_channel(&self, channel: &mut AlertChannel) -> Result<u32, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alert_channels (name, kind, enabled, config) VALUES (?1, ?2, ?3, ?4)",
            params![
                channel.name,
                channel.kind,
                channel.enabled,
                channel.config.to_string(),
            ],
        )?;
        let id = conn.last_insert_rowid() as u32;
        channel.id = id;
        Ok(id)
    }

    pub fn get_channel(&self, id: u32) -> Result<AlertChannel, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, kind, enabled, config FROM alert_channels WHERE id = ?1",
            params![id],
            channel_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    pub fn list_channels(&self) -> Result<Vec<AlertChannel>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, name, kind, enabled, config FROM alert_channels ORDER BY id")?;
        let channels = stmt
            .query_map([], channel_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(channels)
    }

    pub fn delete_channel(&self, id: u32) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM alert_channels WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Alert rules ---

    pub fn add_rule(&self, rule: &mut AlertRule) -> Result<u32, DbError> {
        if rule.cooldown_seconds < 0 {
            return Err(DbError::Invalid(
                "cooldown_seconds must not be negative".to_string(),
            ));
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alert_rules (target_id, channel_id, threshold_type, threshold_value,
                                      on_status_change, enabled, cooldown_seconds, last_fired)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                rule.target_id,
                rule.channel_id,
                rule.threshold_type,
                rule.threshold_value,
                rule.on_status_change,
                rule.enabled,
                rule.cooldown_seconds,
                rule.last_fired.map(format_time),
            ],
        )?;
        let id = conn.last_insert_rowid() as u32;
        rule.id = id;
        Ok(id)
    }

    /// Rules for one target, in insertion order.
    pub fn list_rules(&self, target_id: u32) -> Result<Vec<AlertRule>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, target_id, channel_id, threshold_type, threshold_value,
                    on_status_change, enabled, cooldown_seconds, last_fired
             FROM alert_rules WHERE target_id = ?1 ORDER BY id",
        )?;
        let rules = stmt
            .query_map(params![target_id], rule_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rules)
    }

    pub fn delete_rule(&self, id: u32) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM alert_rules WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Record the fire time of a rule.
    pub fn set_rule_fired(&self, id: u32, when: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alert_rules SET last_fired = ?1 WHERE id = ?2",
            params![format_time(when), id],
        )?;
        Ok(())
    }
}

const TARGET_COLUMNS: &str = "id, name, kind, address, port, interval_secs, enabled, metadata, \
                              http_options, dns_options, ping_options, smtp_options, \
                              snmp_options, ssl_options, alert_channels";

const STATUS_COLUMNS: &str = "target_id, status, response_time_ms, message, checked_at, \
                              uptime_percentage, ssl_days_until_expiry, ssl_issuer, ssl_subject, \
                              ssl_serial, resolved_ip, dns_records, data";

fn target_from_row(row: &Row<'_>) -> SqlResult<Target> {
    let kind_str: String = row.get(2)?;
    let kind = parse_enum(2, &kind_str)?;
    Ok(Target {
        id: row.get(0)?,
        name: row.get(1)?,
        kind,
        address: row.get(3)?,
        port: row.get(4)?,
        interval_secs: row.get(5)?,
        enabled: row.get(6)?,
        metadata: from_json_column(row, 7)?,
        http: from_json_column(row, 8)?,
        dns: from_json_column(row, 9)?,
        ping: from_json_column(row, 10)?,
        smtp: from_json_column(row, 11)?,
        snmp: from_json_column(row, 12)?,
        ssl: from_json_column(row, 13)?,
        alert_channels: from_json_column(row, 14)?,
    })
}

fn status_from_row(row: &Row<'_>) -> SqlResult<CurrentStatus> {
    let status_str: String = row.get(1)?;
    let checked_at_str: String = row.get(4)?;
    Ok(CurrentStatus {
        target_id: row.get(0)?,
        status: parse_enum(1, &status_str)?,
        response_time_ms: row.get(2)?,
        message: row.get(3)?,
        checked_at: parse_db_time(&checked_at_str).unwrap_or_else(Utc::now),
        uptime_percentage: row.get(5)?,
        ssl_days_until_expiry: row.get(6)?,
        ssl_issuer: row.get(7)?,
        ssl_subject: row.get(8)?,
        ssl_serial: row.get(9)?,
        resolved_ip: row.get(10)?,
        dns_records: row.get(11)?,
        data: row.get(12)?,
    })
}

fn channel_from_row(row: &Row<'_>) -> SqlResult<AlertChannel> {
    let config_str: String = row.get(4)?;
    Ok(AlertChannel {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        enabled: row.get(3)?,
        config: serde_json::from_str(&config_str).unwrap_or(serde_json::Value::Null),
    })
}

fn rule_from_row(row: &Row<'_>) -> SqlResult<AlertRule> {
    let last_fired: Option<String> = row.get(8)?;
    Ok(AlertRule {
        id: row.get(0)?,
        target_id: row.get(1)?,
        channel_id: row.get(2)?,
        threshold_type: row.get(3)?,
        threshold_value: row.get(4)?,
        on_status_change: row.get(5)?,
        enabled: row.get(6)?,
        cooldown_seconds: row.get(7)?,
        last_fired: last_fired.as_deref().and_then(parse_db_time),
    })
}

fn parse_enum<T: std::str::FromStr>(column: usize, value: &str) -> SqlResult<T> {
    value.parse::<T>().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            format!("unrecognized value: {}", value).into(),
        )
    })
}

fn from_json_column<T: serde::de::DeserializeOwned + Default>(
    row: &Row<'_>,
    column: usize,
) -> SqlResult<T> {
    let raw: String = row.get(column)?;
    Ok(serde_json::from_str(&raw).unwrap_or_default())
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.fZ",
    ];
    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_target_crud() {
        let store = Store::in_memory().unwrap();

        let mut target = Target {
            name: "Test".to_string(),
            address: "example.com".to_string(),
            kind: TargetKind::Ping,
            ..Default::default()
        };
        let id = store.add_target(&mut target).unwrap();
        assert!(id > 0);

        let fetched = store.get_target(id).unwrap();
        assert_eq!(fetched.name, "Test");
        assert_eq!(fetched.kind, TargetKind::Ping);
        assert_eq!(fetched.ping.count, 4);

        let mut updated = fetched;
        updated.name = "Updated".to_string();
        updated.http.expected_status_codes = vec![200, 301];
        store.update_target(&updated).unwrap();

        let fetched2 = store.get_target(id).unwrap();
        assert_eq!(fetched2.name, "Updated");
        assert_eq!(fetched2.http.expected_status_codes, vec![200, 301]);

        store.delete_target(id).unwrap();
        assert!(matches!(store.get_target(id), Err(DbError::NotFound)));
    }

    #[test]
    fn test_invalid_target_rejected() {
        let store = Store::in_memory().unwrap();
        let mut target = Target {
            address: "example.com".to_string(),
            interval_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            store.add_target(&mut target),
            Err(DbError::Invalid(_))
        ));
    }

    #[test]
    fn test_status_upsert_keeps_single_row() {
        let store = Store::in_memory().unwrap();

        let mut status = CurrentStatus {
            target_id: 7,
            status: CheckStatus::Up,
            response_time_ms: 42,
            message: "HTTP 200 OK".to_string(),
            checked_at: Utc::now(),
            ..Default::default()
        };
        store.upsert_status(&status).unwrap();

        status.status = CheckStatus::Down;
        status.message = "Request failed".to_string();
        store.upsert_status(&status).unwrap();

        let statuses = store.list_statuses().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, CheckStatus::Down);
        assert_eq!(statuses[0].message, "Request failed");
    }

    #[test]
    fn test_history_count_window() {
        let store = Store::in_memory().unwrap();
        let now = Utc::now();

        for (age_days, status) in [(1, CheckStatus::Up), (2, CheckStatus::Down), (40, CheckStatus::Up)] {
            store
                .append_history(&HistoryRecord {
                    target_id: 1,
                    status,
                    response_time_ms: 10,
                    message: String::new(),
                    checked_at: now - Duration::days(age_days),
                })
                .unwrap();
        }

        let since = now - Duration::days(30);
        assert_eq!(store.count_history(1, since, None).unwrap(), 2);
        assert_eq!(
            store.count_history(1, since, Some(CheckStatus::Up)).unwrap(),
            1
        );

        let removed = store.prune_history(since).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count_history(1, since, None).unwrap(), 2);
    }

    #[test]
    fn test_channels_and_rules() {
        let store = Store::in_memory().unwrap();

        let mut channel = AlertChannel {
            id: 0,
            name: "ops".to_string(),
            kind: "webhook".to_string(),
            enabled: true,
            config: serde_json::json!({"url": "https://hooks.example/x"}),
        };
        let channel_id = store.add_channel(&mut channel).unwrap();

        let fetched = store.get_channel(channel_id).unwrap();
        assert_eq!(fetched.kind, "webhook");
        assert_eq!(fetched.config["url"], "https://hooks.example/x");

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
        let rule_id = store.add_rule(&mut rule).unwrap();

        let rules = store.list_rules(1).unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].last_fired.is_none());

        let fired_at = Utc::now();
        store.set_rule_fired(rule_id, fired_at).unwrap();
        let rules = store.list_rules(1).unwrap();
        let recorded = rules[0].last_fired.unwrap();
        assert!((recorded - fired_at).num_seconds().abs() < 1);

        store.delete_rule(rule_id).unwrap();
        assert!(store.list_rules(1).unwrap().is_empty());

        store.delete_channel(channel_id).unwrap();
        assert!(matches!(store.get_channel(channel_id), Err(DbError::NotFound)));
    }

    #[test]
    fn test_negative_cooldown_rejected() {
        let store = Store::in_memory().unwrap();
        let mut rule = AlertRule {
            id: 0,
            target_id: 1,
            channel_id: 1,
            threshold_type: "failure_count".to_string(),
            threshold_value: 1,
            on_status_change: false,
            enabled: true,
            cooldown_seconds: -1,
            last_fired: None,
        };
        assert!(matches!(store.add_rule(&mut rule), Err(DbError::Invalid(_))));
    }
}
