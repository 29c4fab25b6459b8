//! Capped scan run history stored in the `ScanHistory` environment variable.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Environment variable holding the history list.
pub const SCAN_HISTORY: &str = "ScanHistory";

/// Summary of one finished scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanHistoryEntry {
    pub serial: i64,
    pub title: String,
    pub user: String,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    /// Estimated duration in seconds
    pub estimated_time: f64,
    /// Elapsed time not spent acquiring, in seconds
    pub deadtime: f64,
    pub motion_time: f64,
    pub acq_time: f64,
    pub channels: Vec<String>,
    pub end_status: String,
}

/// Append `entry`, evicting the oldest entries beyond `cap`.
pub fn push_capped(history: &mut Vec<ScanHistoryEntry>, entry: ScanHistoryEntry, cap: usize) {
    history.push(entry);
    if history.len() > cap {
        let excess = history.len() - cap;
        history.drain(..excess);
    }
}

/// Decode the environment value; an undecodable value starts a new history.
pub fn from_env(value: Option<Value>) -> Vec<ScanHistoryEntry> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(v) => serde_json::from_value(v).unwrap_or_else(|e| {
            warn!(error = %e, "discarding malformed {}", SCAN_HISTORY);
            Vec::new()
        }),
    }
}

/// Encode for the environment
pub fn to_env(history: &[ScanHistoryEntry]) -> Value {
    serde_json::to_value(history).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(serial: i64) -> ScanHistoryEntry {
        let now = Local::now();
        ScanHistoryEntry {
            serial,
            title: format!("ascan #{}", serial),
            user: "tester".into(),
            start_time: now,
            end_time: now,
            estimated_time: 1.0,
            deadtime: 0.1,
            motion_time: 0.5,
            acq_time: 0.4,
            channels: vec!["ct01".into()],
            end_status: "Finished".into(),
        }
    }

    #[test]
    fn test_history_is_fifo_capped() {
        let mut history = Vec::new();
        for serial in 1..=21 {
            push_capped(&mut history, entry(serial), 20);
        }
        assert_eq!(history.len(), 20);
        assert_eq!(history.first().unwrap().serial, 2);
        assert_eq!(history.last().unwrap().serial, 21);
    }

    #[test]
    fn test_env_round_trip_and_malformed_value() {
        let history = vec![entry(1), entry(2)];
        assert_eq!(from_env(Some(to_env(&history))), history);
        assert!(from_env(Some(Value::String("garbage".into()))).is_empty());
        assert!(from_env(None).is_empty());
    }
}
