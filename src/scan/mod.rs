//! Scan engine.
//!
//! Every scan is a [`core::ScanCore`] (targets, data pipeline, start/end
//! bookkeeping) driven by a [`core::ScanLoop`] through a
//! [`core::ScanSequence`], which the macro executor advances one progress
//! step at a time.
//!
//! - [`step`]: move, settle, acquire per point (`ascan`, `a2scan`, `dscan`)
//! - [`continuous`]: software-timed acquisitions during coordinated cruise
//!   motion (`ascanc`, `meshc`)
//! - [`hardware`]: hardware-timed bursts collected from buffer pushes
//!   (`ascanct`, `meshct`)
//! - [`time`]: acquisitions without motion (`timescan`)
//! - [`waypoint`]: legs shared by the continuous scans

pub mod continuous;
pub mod core;
pub mod hardware;
pub mod history;
pub mod macros;
pub mod motion;
pub mod record;
pub mod step;
pub mod synch;
pub mod time;
pub mod waypoint;

pub use self::core::{Estimate, ScanCore, ScanLoop, ScanSequence};
pub use history::{ScanHistoryEntry, SCAN_HISTORY};
pub use record::{JsonLinesRecorder, Record, Recorder, ScanData, SessionRecorder};
pub use synch::{SynchDescription, SynchDomain, SynchGroup, SynchValue};
pub use waypoint::Waypoint;

use std::time::Duration;

/// Longest span a scan timer is armed for.
const MAX_SPAN: Duration = Duration::from_secs(365 * 24 * 3600);

/// Seconds as a [`Duration`]. Negative and NaN give zero; anything longer
/// than [`MAX_SPAN`] saturates there.
pub(crate) fn secs(s: f64) -> Duration {
    if s.is_nan() || s <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(s)
        .map(|d| d.min(MAX_SPAN))
        .unwrap_or(MAX_SPAN)
}
