//! Macro server library.
//!
//! Runs user macros (nested procedures that coordinate motors and
//! acquisition devices) one at a time per session, with cooperative stop,
//! asynchronous abort, pause/resume, hooks and a family of scans.
//!
//! ```no_run
//! use daq_macroserver::config::Settings;
//! use daq_macroserver::executor::MacroExecutor;
//! use daq_macroserver::hardware::{mock::{MockCounter, MockMotor}, pool::DevicePool};
//! use daq_macroserver::macros::MacroCatalog;
//! use daq_macroserver::params;
//! use daq_macroserver::session::InMemorySession;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo() -> daq_macroserver::error::MacroResult<()> {
//! let pool = Arc::new(DevicePool::new());
//! pool.register_moveable(Arc::new(MockMotor::new("mot01")));
//! pool.register_acquirable(Arc::new(MockCounter::new("mntgrp01", &["ct01"])));
//! let session = Arc::new(InMemorySession::new("demo").with_env("ActiveMntGrp", json!("mntgrp01")));
//! let catalog = Arc::new(MacroCatalog::with_builtins());
//! let executor = MacroExecutor::new(session, pool, catalog, Settings::default());
//! executor.run("ascan", params!["mot01", 0.0, 10.0, 10, 0.1]).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod error_recovery;
pub mod executor;
pub mod hardware;
pub mod hooks;
pub mod logging;
pub mod macros;
pub mod pause;
pub mod scan;
pub mod session;
pub mod signal;
pub mod value;

pub use error::{MacroError, MacroResult};
pub use executor::MacroExecutor;
pub use macros::{MacroCatalog, MacroContext, MacroState, StatusKind};
pub use session::{InMemorySession, Session, SessionEvent};
pub use value::ParamValue;
