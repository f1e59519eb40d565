//! Findings and cross-pass signals as they travel to and from the event log.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const SCAN_ID_LEN: usize = 32;

/// Random token scoping every event written by one top-level invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(String);

impl ScanId {
    pub fn generate() -> Self {
        let token: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(SCAN_ID_LEN)
            .map(char::from)
            .collect();
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ScanId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ScanId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A finding about to be appended to `scan_events`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub date: DateTime<Utc>,
    pub target: String,
    pub module_name: String,
    pub scan_id: ScanId,
    pub port: Value,
    pub event: Value,
    /// Full self-describing record. This is what `query` hands back.
    pub json_event: Value,
}

impl NewEvent {
    pub fn new(
        target: impl Into<String>,
        module_name: impl Into<String>,
        scan_id: &ScanId,
        port: Option<u16>,
        event: Value,
    ) -> Self {
        let date: DateTime<Utc> = Utc::now();
        let target: String = target.into();
        let module_name: String = module_name.into();
        let port: Value = port.map(Value::from).unwrap_or(Value::Null);

        let json_event: Value = json!({
            "date": date.to_rfc3339(),
            "target": target,
            "module_name": module_name,
            "scan_id": scan_id.as_str(),
            "port": port,
            "event": event,
        });

        Self {
            date,
            target,
            module_name,
            scan_id: scan_id.clone(),
            port,
            event,
            json_event,
        }
    }
}

/// A short-lived signal one module leaves for a later reader in the same scan.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTempEvent {
    pub date: DateTime<Utc>,
    pub target: String,
    pub module_name: String,
    pub scan_id: ScanId,
    pub event_name: String,
    pub port: Value,
    pub event: Value,
    pub data: Value,
}

impl NewTempEvent {
    pub fn new(
        target: impl Into<String>,
        module_name: impl Into<String>,
        scan_id: &ScanId,
        event_name: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            date: Utc::now(),
            target: target.into(),
            module_name: module_name.into(),
            scan_id: scan_id.clone(),
            event_name: event_name.into(),
            port: Value::Null,
            event: Value::Null,
            data,
        }
    }
}

/// A row read back from `scan_events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub target: String,
    pub module_name: String,
    pub scan_id: ScanId,
    pub port: Value,
    pub event: Value,
    pub json_event: Value,
}

/// Result of a write that went through the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Contention outlasted every retry and the write was discarded.
    Dropped,
}

impl WriteOutcome {
    pub fn is_written(self) -> bool {
        matches!(self, WriteOutcome::Written)
    }
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_ids_are_alphanumeric_and_unique() {
        let a = ScanId::generate();
        let b = ScanId::generate();
        assert_eq!(a.as_str().len(), SCAN_ID_LEN);
        assert!(a.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn json_event_embeds_payload() {
        let id = ScanId::from("abc");
        let event = NewEvent::new("10.0.0.1", "port_scan", &id, Some(22), json!({"open": true}));

        assert_eq!(event.port, json!(22));
        assert_eq!(event.json_event["target"], "10.0.0.1");
        assert_eq!(event.json_event["module_name"], "port_scan");
        assert_eq!(event.json_event["scan_id"], "abc");
        assert_eq!(event.json_event["event"]["open"], true);
    }

    #[test]
    fn missing_port_is_null() {
        let event = NewEvent::new("a.com", "icmp_scan", &ScanId::from("x"), None, json!({}));
        assert!(event.port.is_null());
        assert!(event.json_event["port"].is_null());
    }

    #[test]
    fn scan_id_serializes_as_plain_string() {
        let id = ScanId::from("tok");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"tok\"");
    }
}
