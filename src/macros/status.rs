//! Macro identity, lifecycle state and status events.

use crate::error::MacroError;
use crate::value::ParamValue;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a macro.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacroState {
    Init,
    Running,
    Paused,
    Finished,
    Stopped,
    Aborted,
    Exception,
}

impl MacroState {
    /// Terminal state matching the way a run ended
    pub fn for_error(err: &MacroError) -> Self {
        if err.is_stop() {
            MacroState::Stopped
        } else if err.is_abort() {
            MacroState::Aborted
        } else {
            MacroState::Exception
        }
    }

    /// True for Finished, Stopped, Aborted and Exception
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MacroState::Finished | MacroState::Stopped | MacroState::Aborted | MacroState::Exception
        )
    }
}

impl std::fmt::Display for MacroState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Kind of a broadcast status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Start,
    Step,
    Pause,
    Resume,
    Stop,
    Abort,
    Exception,
    Finish,
}

impl StatusKind {
    /// Terminal kind matching the way a run ended
    pub fn for_error(err: &MacroError) -> Self {
        match MacroState::for_error(err) {
            MacroState::Stopped => StatusKind::Stop,
            MacroState::Aborted => StatusKind::Abort,
            _ => StatusKind::Exception,
        }
    }
}

/// Identity of a macro instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MacroInfo {
    pub name: String,
    pub id: Uuid,
    /// Invocation line, e.g. `ascan mot01 0 10 5 0.1`
    pub line: String,
    pub params: Vec<ParamValue>,
}

impl MacroInfo {
    pub fn new(name: &str, params: Vec<ParamValue>) -> Self {
        let mut line = name.to_string();
        for p in &params {
            line.push(' ');
            line.push_str(&p.to_string());
        }
        Self {
            name: name.to_string(),
            id: Uuid::new_v4(),
            line,
            params,
        }
    }
}

/// Mutable status record of a running macro.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MacroStatus {
    pub range: (f64, f64),
    pub step: f64,
    pub state: MacroState,
}

impl Default for MacroStatus {
    fn default() -> Self {
        Self {
            range: (0.0, 100.0),
            step: 0.0,
            state: MacroState::Init,
        }
    }
}

/// Status snapshot broadcast to the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub id: Uuid,
    pub name: String,
    pub range: (f64, f64),
    pub step: f64,
    pub kind: StatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exc_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exc_message: Option<String>,
}

impl StatusEvent {
    pub fn new(info: &MacroInfo, status: &MacroStatus, kind: StatusKind) -> Self {
        Self {
            id: info.id,
            name: info.name.clone(),
            range: status.range,
            step: status.step,
            kind,
            exc_type: None,
            exc_message: None,
        }
    }

    /// Attach the exception fields of a failed run
    pub fn with_error(mut self, err: &MacroError) -> Self {
        self.exc_type = Some(err.kind().to_string());
        self.exc_message = Some(err.to_string());
        self
    }
}
