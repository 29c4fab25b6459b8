//! Control session collaborator.
//!
//! A session owns the named environment and is the outward channel for
//! everything a macro produces: status events, results, scan records and
//! user-facing output. [`InMemorySession`] keeps all of it in memory and
//! rebroadcasts every event on a `tokio::sync::broadcast` channel.

use crate::error::{MacroError, MacroResult};
use crate::macros::status::StatusEvent;
use crate::scan::record::Record;
use crate::value::ParamValue;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Severity of a line of macro output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLevel {
    Debug,
    Info,
    Output,
    Warning,
    Error,
}

/// Everything a session broadcasts.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Status(StatusEvent),
    Result {
        macro_id: Uuid,
        value: Option<ParamValue>,
    },
    Record(Record),
    Output {
        level: OutputLevel,
        macro_name: String,
        message: String,
    },
    EnvChanged {
        name: String,
        value: Value,
    },
}

/// Environment and broadcast surface consumed by macros.
pub trait Session: Send + Sync {
    /// Session (door) name
    fn name(&self) -> &str;

    /// Value of environment variable `name`. No default: absent is an error.
    fn get_env(&self, name: &str) -> MacroResult<Value>;

    /// Value of `name` as seen by `macro_name`: `"{macro_name}.{name}"`
    /// takes precedence over the global variable.
    fn get_env_scoped(&self, name: &str, macro_name: &str) -> MacroResult<Value> {
        match self.get_env(&format!("{}.{}", macro_name, name)) {
            Ok(value) => Ok(value),
            Err(MacroError::UnknownEnvironment(_)) => self.get_env(name),
            Err(e) => Err(e),
        }
    }

    /// True when `name` is defined
    fn has_env(&self, name: &str) -> bool {
        self.get_env(name).is_ok()
    }

    /// Define or overwrite an environment variable.
    fn set_env(&self, name: &str, value: Value);

    /// Broadcast a macro status event.
    fn send_status(&self, event: StatusEvent);

    /// Broadcast the result of a top-level macro.
    fn send_result(&self, macro_id: Uuid, value: Option<&ParamValue>);

    /// Broadcast a scan record.
    fn send_record(&self, record: &Record);

    /// Broadcast a line of macro output.
    fn send_output(&self, level: OutputLevel, macro_name: &str, message: &str);
}

/// Session that keeps its environment and event log in memory.
pub struct InMemorySession {
    name: String,
    env: RwLock<HashMap<String, Value>>,
    events: Mutex<Vec<SessionEvent>>,
    tx: broadcast::Sender<SessionEvent>,
}

impl InMemorySession {
    /// Create a session with an empty environment
    pub fn new(name: &str) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            name: name.to_string(),
            env: RwLock::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            tx,
        }
    }

    /// Builder-style environment setup
    pub fn with_env(self, name: &str, value: impl Into<Value>) -> Self {
        if let Ok(mut env) = self.env.write() {
            env.insert(name.to_string(), value.into());
        }
        self
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// All events emitted so far
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Scan records emitted so far
    pub fn records(&self) -> Vec<Record> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Record(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    /// Status events emitted so far
    pub fn statuses(&self) -> Vec<StatusEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Status(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn emit(&self, event: SessionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        // no receivers is fine
        let _ = self.tx.send(event);
    }
}

impl Session for InMemorySession {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_env(&self, name: &str) -> MacroResult<Value> {
        self.env
            .read()
            .ok()
            .and_then(|env| env.get(name).cloned())
            .ok_or_else(|| MacroError::UnknownEnvironment(name.to_string()))
    }

    fn set_env(&self, name: &str, value: Value) {
        if let Ok(mut env) = self.env.write() {
            env.insert(name.to_string(), value.clone());
        }
        self.emit(SessionEvent::EnvChanged {
            name: name.to_string(),
            value,
        });
    }

    fn send_status(&self, event: StatusEvent) {
        self.emit(SessionEvent::Status(event));
    }

    fn send_result(&self, macro_id: Uuid, value: Option<&ParamValue>) {
        self.emit(SessionEvent::Result {
            macro_id,
            value: value.cloned(),
        });
    }

    fn send_record(&self, record: &Record) {
        self.emit(SessionEvent::Record(record.clone()));
    }

    fn send_output(&self, level: OutputLevel, macro_name: &str, message: &str) {
        self.emit(SessionEvent::Output {
            level,
            macro_name: macro_name.to_string(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_env_has_no_default() {
        let session = InMemorySession::new("door01");
        assert!(matches!(
            session.get_env("ScanDir"),
            Err(MacroError::UnknownEnvironment(name)) if name == "ScanDir"
        ));
    }

    #[test]
    fn test_scoped_env_overrides_global() {
        let session = InMemorySession::new("door01")
            .with_env("ActiveMntGrp", "mntgrp01")
            .with_env("ascan.ActiveMntGrp", "mntgrp02");
        assert_eq!(
            session.get_env_scoped("ActiveMntGrp", "ascan").unwrap(),
            json!("mntgrp02")
        );
        assert_eq!(
            session.get_env_scoped("ActiveMntGrp", "ct").unwrap(),
            json!("mntgrp01")
        );
    }

    #[tokio::test]
    async fn test_events_are_logged_and_broadcast() {
        let session = InMemorySession::new("door01");
        let mut rx = session.subscribe();
        session.set_env("ScanID", json!(3));
        session.send_output(OutputLevel::Info, "ct", "hello");

        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::EnvChanged { .. }));
        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::Output { .. }));
        assert_eq!(session.events().len(), 2);
        assert_eq!(session.get_env("ScanID").unwrap(), json!(3));
    }
}
