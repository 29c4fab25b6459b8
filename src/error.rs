//! Custom error types for the macro server.
//!
//! This module defines the primary error type, `MacroError`, used by the macro
//! unit, the executor and the scan engine. Using the `thiserror` crate, it
//! provides a centralized way to tell apart the different ways a macro can end.
//!
//! ## Error Hierarchy
//!
//! - **`Stop`**: Cooperative cancellation. Raised at the next API boundary or
//!   checkpoint after a stop was requested. Triggers the macro's `on_stop`.
//! - **`Abort`** / **`ForcedAbort`**: Asynchronous cancellation. Raised at the
//!   next blocking point. `ForcedAbort` is raised by the pause watchdog when a
//!   macro was unparked for an abort that never arrived.
//! - **`Release`**: Escape valve used to unblock a hung stop/abort handler.
//!   Never a normal outcome, always propagated.
//! - **`ScanSetup`** / **`Scan`**: Precondition or device failures fatal to a
//!   single scan run, not to the session.
//! - **`MissingEnvironment`**, **`UnknownMacro`**, **`UnknownEnvironment`**:
//!   Fail fast while a macro is being prepared.
//! - **`Device`**: Wraps `anyhow::Error` coming out of the device collaborators,
//!   so driver code can keep using `anyhow::Context` and the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the macro error type.
pub type MacroResult<T> = std::result::Result<T, MacroError>;

/// Errors raised while preparing or running macros.
#[derive(Error, Debug)]
pub enum MacroError {
    /// Cooperative stop requested by the operator.
    #[error("Macro stopped")]
    Stop,

    /// Asynchronous abort requested by the operator.
    #[error("Macro aborted")]
    Abort,

    /// Abort raised by the pause watchdog itself.
    #[error("Macro aborted by pause watchdog")]
    ForcedAbort,

    /// Injected to unblock a hung stop/abort handler.
    #[error("Macro released")]
    Release,

    /// A scan could not be set up.
    #[error("Scan setup error: {0}")]
    ScanSetup(String),

    /// A scan failed while running.
    #[error("Scan error: {0}")]
    Scan(String),

    /// Required environment variables are not defined.
    #[error("Macro '{macro_name}' requires environment: {}", .missing.join(", "))]
    MissingEnvironment {
        /// Name of the macro being prepared.
        macro_name: String,
        /// Names of the undefined variables.
        missing: Vec<String>,
    },

    /// The macro name is not registered in the catalog.
    #[error("Unknown macro: {0}")]
    UnknownMacro(String),

    /// The environment variable is not defined.
    #[error("Unknown environment variable: {0}")]
    UnknownEnvironment(String),

    /// The device name is not registered in the pool.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// A macro parameter could not be interpreted.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A hook entry is malformed.
    #[error("Invalid hook: {0}")]
    InvalidHook(String),

    /// A top-level macro was requested while another one is running.
    #[error("Executor busy: {0}")]
    Busy(String),

    /// Failure reported by a device collaborator.
    #[error("Device error: {0:#}")]
    Device(#[from] anyhow::Error),
}

impl MacroError {
    /// True for the cooperative stop.
    pub fn is_stop(&self) -> bool {
        matches!(self, MacroError::Stop)
    }

    /// True for both the operator abort and the watchdog abort.
    pub fn is_abort(&self) -> bool {
        matches!(self, MacroError::Abort | MacroError::ForcedAbort)
    }

    /// True for the release escape valve.
    pub fn is_release(&self) -> bool {
        matches!(self, MacroError::Release)
    }

    /// True for any operator-driven cancellation.
    pub fn is_cancellation(&self) -> bool {
        self.is_stop() || self.is_abort() || self.is_release()
    }

    /// Short variant name, forwarded as the exception type of status events.
    pub fn kind(&self) -> &'static str {
        match self {
            MacroError::Stop => "StopException",
            MacroError::Abort => "AbortException",
            MacroError::ForcedAbort => "AbortException",
            MacroError::Release => "ReleaseException",
            MacroError::ScanSetup(_) => "ScanSetupError",
            MacroError::Scan(_) => "ScanException",
            MacroError::MissingEnvironment { .. } => "MissingEnv",
            MacroError::UnknownMacro(_) => "UnknownMacro",
            MacroError::UnknownEnvironment(_) => "UnknownEnv",
            MacroError::UnknownDevice(_) => "UnknownDevice",
            MacroError::InvalidParameter(_) => "WrongParam",
            MacroError::InvalidHook(_) => "InvalidHook",
            MacroError::Busy(_) => "ExecutorBusy",
            MacroError::Device(_) => "DeviceError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MacroError::Scan("mot01 did not reach 10.0".to_string());
        assert_eq!(err.to_string(), "Scan error: mot01 did not reach 10.0");
    }

    #[test]
    fn test_missing_environment_lists_variables() {
        let err = MacroError::MissingEnvironment {
            macro_name: "ascan".into(),
            missing: vec!["ActiveMntGrp".into(), "ScanDir".into()],
        };
        assert_eq!(
            err.to_string(),
            "Macro 'ascan' requires environment: ActiveMntGrp, ScanDir"
        );
    }

    #[test]
    fn test_classification() {
        assert!(MacroError::Stop.is_stop());
        assert!(MacroError::ForcedAbort.is_abort());
        assert!(MacroError::Release.is_cancellation());
        assert!(!MacroError::Scan("x".into()).is_cancellation());
        let wrapped: MacroError = anyhow::anyhow!("serial timeout").into();
        assert_eq!(wrapped.kind(), "DeviceError");
    }
}
